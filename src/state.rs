use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    time::Duration,
};

use anyhow::{bail, Context as _};
use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::git::CommitHash;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BranchState {
    // Most recent commit hash for which a job has been accepted into the
    // queue. Never rolled back.
    pub latest_commit: CommitHash,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunningTest {
    pub branch: String,
    pub commit: CommitHash,
    pub log_file: PathBuf,
    pub start_time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct RepositoryState {
    branch_states: HashMap<String, BranchState>,
    running_tests: Vec<RunningTest>,
    last_updated: Option<DateTime<Utc>>,
}

// Crash-tolerant persistence of what's running and what was last seen on
// each branch. One instance per repository, exclusively owned by the
// monitor process; executors reach it through a shared reference. Reads and
// mutations take the lock briefly, durability is explicit via save().
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: RwLock<RepositoryState>,
}

impl StateStore {
    // Read state from the given file. Absent or malformed files mean
    // starting empty - losing the state file loses dedup history, not
    // correctness. Persisted running tests older than stale_threshold are
    // dropped: their executors cannot exist anymore after a restart.
    pub fn load(path: PathBuf, stale_threshold: Duration) -> Self {
        let mut state = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<RepositoryState>(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!("state file {:?} is malformed, starting empty: {}", path, e);
                    RepositoryState::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no state file at {:?}, starting empty", path);
                RepositoryState::default()
            }
            Err(e) => {
                warn!("couldn't read state file {:?}, starting empty: {}", path, e);
                RepositoryState::default()
            }
        };

        // An absurdly-large configured threshold just means nothing is stale.
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(stale_threshold)
                .unwrap_or_else(|_| chrono::TimeDelta::days(10 * 365));
        state.running_tests.retain(|rt| {
            if rt.start_time < cutoff {
                warn!(
                    "discarding stale running test {}@{} (started {})",
                    rt.branch, rt.commit, rt.start_time
                );
                false
            } else {
                true
            }
        });

        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub fn get_branch_state(&self, branch: &str) -> Option<BranchState> {
        self.state.read().branch_states.get(branch).cloned()
    }

    pub fn update_branch_state(&self, branch: &str, commit: CommitHash) {
        self.state.write().branch_states.insert(
            branch.to_owned(),
            BranchState {
                latest_commit: commit,
            },
        );
    }

    // Rejects a second entry for the same (branch, commit): that would mean
    // two executors own the same run.
    pub fn add_running_test(&self, rt: RunningTest) -> anyhow::Result<()> {
        let mut state = self.state.write();
        if state
            .running_tests
            .iter()
            .any(|existing| existing.branch == rt.branch && existing.commit == rt.commit)
        {
            bail!("a test for {}@{} is already running", rt.branch, rt.commit);
        }
        state.running_tests.push(rt);
        Ok(())
    }

    // Returns whether an entry was actually removed.
    pub fn remove_running_test(&self, branch: &str, commit: &CommitHash) -> bool {
        let mut state = self.state.write();
        let before = state.running_tests.len();
        state
            .running_tests
            .retain(|rt| !(rt.branch == branch && rt.commit == *commit));
        state.running_tests.len() != before
    }

    pub fn running_tests(&self) -> Vec<RunningTest> {
        self.state.read().running_tests.clone()
    }

    // Atomic write-temp-then-rename of the full state. A crash mid-save
    // leaves either the old file or the new one, never a torn write.
    pub fn save(&self) -> anyhow::Result<()> {
        let json = {
            let mut state = self.state.write();
            state.last_updated = Some(Utc::now());
            serde_json::to_string_pretty(&*state).context("serializing state")?
        };

        let dir = self
            .path
            .parent()
            .context("state file path has no parent")?;
        fs::create_dir_all(dir).with_context(|| format!("creating state directory {:?}", dir))?;
        let temp = NamedTempFile::new_in(dir).context("creating temp state file")?;
        fs::write(temp.path(), json).context("writing temp state file")?;
        temp.persist(&self.path)
            .with_context(|| format!("renaming state file into place at {:?}", self.path))?;
        Ok(())
    }
}
