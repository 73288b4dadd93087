use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ParsedConfig;
use crate::git::Cache;
use crate::state::StateStore;
use crate::test::{JobQueue, TestJob};
use crate::util::{IoResultExt as _, ResultExt as _};

// Periodic reconciliation of observed branch tips against persisted state.
// Each tick refreshes the cache, diffs every recently-active branch's tip
// against what was last accepted into the queue, and enqueues the new
// pairs. Branch state only advances when the queue accepts the job, so a
// full queue just means the commit is retried on the next tick.
pub struct Monitor {
    config: Arc<ParsedConfig>,
    cache: Arc<Cache>,
    state: Arc<StateStore>,
    queue: JobQueue,
    ct: CancellationToken,
}

impl Monitor {
    pub fn new(
        config: Arc<ParsedConfig>,
        cache: Arc<Cache>,
        state: Arc<StateStore>,
        queue: JobQueue,
        ct: CancellationToken,
    ) -> Self {
        Self {
            config,
            cache,
            state,
            queue,
            ct,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.ct.cancelled() => break,
                _ = ticker.tick() => (),
            }
            // A failed tick (cache gone, origin unreachable on first clone,
            // ...) is retried wholesale on the next one.
            if let Err(e) = self.tick().await {
                error!("monitor tick failed: {:#}", e);
            }
        }
        info!("monitor stopping");
        self.state.save().or_log_error("saving state at shutdown");
        Ok(())
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        self.cache.ensure().await.context("refreshing cache")?;

        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(self.config.recent_commits_within)
                .unwrap_or_else(|_| chrono::TimeDelta::days(10 * 365));
        let branches = self
            .cache
            .branches_with_commits_since(cutoff)
            .await
            .context("discovering branches")?;
        debug!("tick: {} recently-active branch(es)", branches.len());

        for branch in branches {
            let tip = match self.cache.tip_commit(&branch).await {
                Ok(tip) => tip,
                Err(e) => {
                    debug!("skipping branch {:?} this tick: {:#}", branch, e);
                    continue;
                }
            };
            let already_accepted = self
                .state
                .get_branch_state(&branch)
                .is_some_and(|prev| prev.latest_commit == tip.hash);
            if already_accepted {
                continue;
            }
            info!(
                "new commit on {}: {} ({:?})",
                branch,
                tip.hash.abbrev(),
                tip.message
            );
            if self.queue.enqueue(TestJob {
                branch: branch.clone(),
                commit: tip.hash.clone(),
            }) {
                self.state.update_branch_state(&branch, tip.hash);
            }
            // On rejection the branch state is left alone so the next tick
            // tries the same commit again.
        }

        self.state.save().context("saving state")?;
        Ok(())
    }
}

// Delete run directories whose mtime is older than keep_time. One sweep;
// the loop below schedules it. Returns how many directories went away.
pub async fn reap_run_dirs(config: &ParsedConfig) -> anyhow::Result<usize> {
    let cutoff = SystemTime::now() - config.keep_time;
    let mut read_dir = match tokio::fs::read_dir(config.runs_dir()).await {
        Ok(read_dir) => read_dir,
        // No runs yet.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context("listing run directories"),
    };

    let mut reaped = 0;
    while let Some(entry) = read_dir.next_entry().await.context("listing run directories")? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("couldn't stat {:?}: {}", entry.path(), e);
                continue;
            }
        };
        if !metadata.is_dir() {
            continue;
        }
        let modified = metadata.modified().context("no mtime support")?;
        if modified < cutoff {
            info!("reaping old run directory {:?}", entry.path());
            tokio::fs::remove_dir_all(entry.path())
                .await
                .ignore(io::ErrorKind::NotFound)
                .with_context(|| format!("removing {:?}", entry.path()))?;
            reaped += 1;
        }
    }
    Ok(reaped)
}

// Periodic retention reaper. With keep_time == 0 the executors delete their
// own workspaces at finalize and there is nothing to do here.
pub async fn reaper(config: Arc<ParsedConfig>, ct: CancellationToken) -> anyhow::Result<()> {
    if config.keep_time == Duration::ZERO {
        return Ok(());
    }
    let period = (config.keep_time / 2).min(Duration::from_secs(60 * 60));
    let mut ticker = interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        // First tick fires immediately: the startup sweep.
        select! {
            _ = ct.cancelled() => return Ok(()),
            _ = ticker.tick() => (),
        }
        reap_run_dirs(&config).await.or_log_error("reaping run directories");
    }
}
