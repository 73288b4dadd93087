mod config;
mod dispatch;
mod git;
mod monitor;
mod process;
mod state;
mod util;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ParsedConfig};
use crate::git::Cache;
use crate::monitor::Monitor;
use crate::state::StateStore;
use crate::test::Manager;
use crate::util::TaskGroup;

#[derive(Parser)]
#[command(version, about = "Single-host CI supervisor: watches a Git repository and runs a test script against new commits.")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, short)]
    config: PathBuf,
    /// Override the configured work directory.
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Log specification, e.g. "debug" or "home_ci=debug".
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // The handle keeps the logger alive for the lifetime of main.
    let _logger = flexi_logger::Logger::try_with_env_or_str(&args.log)
        .context("parsing log spec")?
        .start()
        .context("starting logger")?;

    let config = Config::from_yaml_file(&args.config)?;
    let config_dir = args.config.parent().unwrap_or(Path::new("."));
    let mut config = ParsedConfig::new(config, config_dir)?;
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }
    let config = Arc::new(config);
    info!(
        "watching {:?} every {:?}, work dir {:?}",
        config.repository, config.check_interval, config.work_dir
    );

    let ct = CancellationToken::new();
    let cache = Arc::new(Cache::new(config.cache_dir(), config.repository.clone()));
    let state = Arc::new(StateStore::load(
        config.state_file(),
        config.stale_running_test_threshold(),
    ));
    let mut manager = Manager::new(config.clone(), cache.clone(), state.clone(), ct.clone())?;
    let monitor = Monitor::new(
        config.clone(),
        cache.clone(),
        state.clone(),
        manager.queue(),
        ct.clone(),
    );

    let mut group = TaskGroup::new(ct.clone());
    {
        let ct = ct.clone();
        group.spawn(async move {
            let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
            let mut sigterm =
                signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
            select! {
                _ = sigint.recv() => info!("got SIGINT, shutting down"),
                _ = sigterm.recv() => info!("got SIGTERM, shutting down"),
                _ = ct.cancelled() => (),
            }
            ct.cancel();
            Ok(())
        });
    }
    group.spawn(async move { manager.run().await });
    group.spawn(async move { monitor.run().await });
    group.spawn(monitor::reaper(config, ct.clone()));

    group.wait().await
}
