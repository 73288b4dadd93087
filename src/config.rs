use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::debug;
use regex::Regex;
use serde::Deserialize;

use crate::git::CommitHash;

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Cleanup {
    /// Run the cleanup script after every test run, whatever its outcome.
    #[serde(default)]
    pub after_e2e: bool,
    /// Path of the cleanup script, relative to the workspace. Empty means
    /// there is nothing to run even if after_e2e is set.
    #[serde(default)]
    pub script: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Dispatch {
    #[serde(default)]
    pub enabled: bool,
    /// "owner/name" of the repository whose dispatch endpoint gets notified.
    #[serde(default)]
    pub target_repo: String,
    /// File holding the bearer token. Relative paths are resolved against
    /// the directory containing the config file.
    #[serde(default)]
    pub token_file: String,
    /// Overrides the default test-success/test-failure event type.
    #[serde(default)]
    pub event_type: String,
    /// When set, a run whose script didn't write the result file counts as
    /// a notification failure.
    #[serde(default)]
    pub requires_result_file: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.github.com".to_owned()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Origin to watch, either a local path or a remote URL.
    pub repository: String,
    /// Short identifier, used in paths and state keys.
    pub repo_name: String,
    /// Base directory for the cache, state and run directories. Defaults to
    /// the user's local data dir.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_check_interval")]
    pub check_interval_s: u64,
    /// Test script to run, relative to the workspace.
    pub test_script: String,
    /// Extra arguments appended to the script invocation. Split on
    /// whitespace; quoting is not supported.
    #[serde(default)]
    pub options: String,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// A branch is only eligible while its tip's author time is within this
    /// window of now.
    #[serde(default = "default_recent_commits_within")]
    pub recent_commits_within_s: u64,
    /// Hard wall-clock limit per script execution.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_s: u64,
    /// How long finished run directories are kept around. 0 deletes the
    /// workspace as soon as the run finalizes.
    #[serde(default)]
    pub keep_time_s: u64,
    #[serde(default)]
    pub cleanup: Cleanup,
    #[serde(default)]
    pub dispatch: Dispatch,
}

fn default_check_interval() -> u64 {
    60
}

fn default_max_concurrent_runs() -> usize {
    1
}

fn default_recent_commits_within() -> u64 {
    24 * 60 * 60
}

fn default_test_timeout() -> u64 {
    60 * 60
}

impl Config {
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing config file {:?}", path))
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub owner: String,
    pub name: String,
    pub token_path: PathBuf,
    // None means derive test-success/test-failure from the run outcome.
    pub event_type: Option<String>,
    pub requires_result_file: bool,
    pub api_base: String,
}

// Config with defaults filled in, durations and paths resolved, and the
// obviously-broken configurations rejected. Everything downstream takes
// this, the raw Config never leaves main/tests.
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub repository: String,
    pub repo_name: String,
    pub work_dir: PathBuf,
    pub check_interval: Duration,
    pub test_script: String,
    pub options: Vec<String>,
    pub max_concurrent_runs: usize,
    pub recent_commits_within: Duration,
    pub test_timeout: Duration,
    pub keep_time: Duration,
    // Some iff cleanup is enabled and a script is configured.
    pub cleanup_script: Option<String>,
    // Some iff dispatch is enabled.
    pub dispatch: Option<DispatchSettings>,
}

impl ParsedConfig {
    // config_dir is the directory of the file config was loaded from,
    // relative token paths are resolved against it.
    pub fn new(config: Config, config_dir: &Path) -> anyhow::Result<Self> {
        if config.repo_name.is_empty() {
            bail!("repo_name must not be empty");
        }
        if config.repo_name.contains(std::path::is_separator) {
            bail!("repo_name must not contain path separators: {:?}", config.repo_name);
        }
        if config.repository.is_empty() {
            bail!("repository must not be empty");
        }
        if config.test_script.is_empty() {
            bail!("test_script must not be empty");
        }
        if config.max_concurrent_runs < 1 {
            bail!("max_concurrent_runs must be at least 1");
        }

        let dispatch = if config.dispatch.enabled {
            let (owner, name) = match config.dispatch.target_repo.split_once('/') {
                Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                    (owner.to_owned(), name.to_owned())
                }
                _ => bail!(
                    "dispatch.target_repo must be \"owner/name\", got {:?}",
                    config.dispatch.target_repo
                ),
            };
            if config.dispatch.token_file.is_empty() {
                bail!("dispatch.token_file must be set when dispatch is enabled");
            }
            let token_file = PathBuf::from(&config.dispatch.token_file);
            let token_path = if token_file.is_absolute() {
                token_file
            } else {
                config_dir.join(token_file)
            };
            Some(DispatchSettings {
                owner,
                name,
                token_path,
                event_type: match config.dispatch.event_type.as_str() {
                    "" => None,
                    e => Some(e.to_owned()),
                },
                requires_result_file: config.dispatch.requires_result_file,
                api_base: config.dispatch.api_base.trim_end_matches('/').to_owned(),
            })
        } else {
            None
        };

        let work_dir = match config.work_dir {
            Some(dir) => dir,
            None => default_work_dir()?,
        };

        Ok(Self {
            repository: config.repository,
            repo_name: config.repo_name,
            work_dir,
            check_interval: Duration::from_secs(config.check_interval_s),
            test_script: config.test_script,
            options: config
                .options
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
            max_concurrent_runs: config.max_concurrent_runs,
            recent_commits_within: Duration::from_secs(config.recent_commits_within_s),
            test_timeout: Duration::from_secs(config.test_timeout_s),
            keep_time: Duration::from_secs(config.keep_time_s),
            cleanup_script: if config.cleanup.after_e2e && !config.cleanup.script.is_empty() {
                Some(config.cleanup.script)
            } else {
                None
            },
            dispatch,
        })
    }

    // The derived path layout. Everything lives under work_dir.

    pub fn cache_dir(&self) -> PathBuf {
        self.work_dir.join("cache").join(&self.repo_name)
    }

    pub fn state_file(&self) -> PathBuf {
        self.work_dir
            .join("state")
            .join(format!("{}.json", self.repo_name))
    }

    // Parent of all run directories for this repository.
    pub fn runs_dir(&self) -> PathBuf {
        self.work_dir.join(&self.repo_name)
    }

    pub fn run_dir(&self, branch: &str, commit: &CommitHash) -> PathBuf {
        self.runs_dir().join(run_id(branch, commit))
    }

    // No Executor can still own a persisted running test older than this
    // after a restart.
    pub fn stale_running_test_threshold(&self) -> Duration {
        (self.test_timeout * 2).max(Duration::from_secs(60 * 60))
    }
}

fn default_work_dir() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "home-ci")
        .context("couldn't determine a default work_dir, set one in the config")?;
    Ok(dirs.data_local_dir().to_owned())
}

static UNSAFE_PATH_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9A-Za-z._-]+").unwrap());

// Branch names can contain slashes and other characters we don't want in a
// directory name.
pub fn sanitize_branch(branch: &str) -> String {
    UNSAFE_PATH_CHARS.replace_all(branch, "_").into_owned()
}

pub fn run_id(branch: &str, commit: &CommitHash) -> String {
    format!("{}_{}", sanitize_branch(branch), commit.abbrev())
}
