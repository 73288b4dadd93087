use core::fmt;
use core::fmt::{Debug, Display};
use std::ffi::OsStr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;
use std::{io, str};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::process::{CommandExt as _, OutputExt as _};

#[derive(Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(String);

// A Hash is an ID for referring to an object in a git repository. Note that
// construction is infallible: having a Hash doesn't guarantee the ID refers
// to an object in an actual repo, and even if we checked at construction
// time there's no way to enforce that invariant going forward. You just have
// to do error handling whenever you deal with Git objects, like you would
// with any mutable database.
impl Hash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    // First 8 characters, the form used in run directory names.
    pub fn abbrev(&self) -> &str {
        &self.0[..8]
    }
}

impl AsRef<OsStr> for Hash {
    fn as_ref(&self) -> &OsStr {
        OsStr::new(&self.0)
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitHash(Hash);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl From<CommitHash> for Hash {
    fn from(h: CommitHash) -> Hash {
        h.0
    }
}

impl Deref for CommitHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Tip of a branch as seen in the cache.
#[derive(Debug, Clone)]
pub struct Commit {
    pub hash: CommitHash,
    pub author_time: DateTime<Utc>,
    pub message: String,
}

// Looked the branch up fine, it just isn't there. Callers skip the branch
// for this tick instead of treating it as a real failure.
#[derive(Debug)]
pub struct BranchNotFound(pub String);

impl Display for BranchNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch {:?} not found in cache", self.0)
    }
}

impl std::error::Error for BranchNotFound {}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

// Wrapper for a git Command that holds a semaphore permit for as long as the
// process exists. Just delegates enough methods to let you use it without
// letting you drop the permit until the process has terminated (which
// hopefully implies the stdio pipes have been closed...). This exists to
// avoid running into file descriptor exhaustion, without needing any retry
// logic that would risk creating livelocks.
#[derive(Debug)]
pub struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut GitCommand {
        self.command.args(args);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        self.command.execute().await
    }

    async fn output(&mut self) -> io::Result<process::Output> {
        self.command.output().await
    }
}

// A git command. dir is the repository to operate on; clone-like commands
// that create the repository pass None.
async fn git<I, S>(dir: Option<&Path>, args: I) -> GitCommand
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    // Separate process group means git doesn't get SIGINT if the user
    // Ctrl-C's the terminal. We are trusting that git won't get stuck and
    // prevent us from shutting down.
    cmd.process_group(0);
    GitCommand {
        _permit: COMMAND_SEM.acquire().await.unwrap(),
        command: cmd,
    }
}

// Remote origins get shallow treatment, local paths don't need it and
// shallow-cloning them would be all cost no benefit.
fn origin_is_remote(origin: &str) -> bool {
    origin.contains("://") || (origin.contains('@') && origin.contains(':'))
}

// The supervisor-owned clone used for branch discovery and tip resolution.
// Bare, lives at work_dir/cache/<repo_name>, updated by fetching the
// origin's heads into refs/remotes/origin/*. Also the clone source for
// workspaces, so the origin itself is only ever touched by fetch - in
// particular a local origin's working tree is never raced against.
#[derive(Debug)]
pub struct Cache {
    path: PathBuf,
    origin: String,
    // Set once the first clone (or open of an existing cache) succeeded.
    // Only the monitor calls ensure(), the atomic is just so executors can
    // share &Cache for workspace clones.
    initialized: AtomicBool,
}

impl Cache {
    pub fn new(path: PathBuf, origin: String) -> Self {
        Self {
            path,
            origin,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Idempotently create or refresh the cache. A failure to clone when no
    // usable cache exists is an error; a failure to fetch on top of an
    // existing cache just means stale data, which the caller lives with.
    pub async fn ensure(&self) -> anyhow::Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            if self.path.exists() && !self.is_valid_repo().await {
                warn!("cache at {:?} is corrupt, recreating it", self.path);
                tokio::fs::remove_dir_all(&self.path)
                    .await
                    .with_context(|| format!("removing corrupt cache {:?}", self.path))?;
            }
            if !self.path.exists() {
                self.clone_cache().await.context("creating cache clone")?;
            }
            self.initialized.store(true, Ordering::Release);
        }

        match self.fetch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "fetch into cache {:?} failed, using stale data: {:#}",
                    self.path, e
                );
                Ok(())
            }
        }
    }

    async fn is_valid_repo(&self) -> bool {
        match git(Some(&self.path), ["rev-parse", "--git-dir"])
            .await
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn clone_cache(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("creating cache parent directory")?;
        }
        let mut cmd = git(None, ["clone", "--bare"]).await;
        if origin_is_remote(&self.origin) {
            cmd.args(["--depth", "1"]);
        }
        cmd.arg(&self.origin).arg(&self.path);
        cmd.execute()
            .await
            .with_context(|| format!("cloning {:?} into {:?}", self.origin, self.path))?;
        info!("created cache clone of {:?} at {:?}", self.origin, self.path);
        Ok(())
    }

    async fn fetch(&self) -> anyhow::Result<()> {
        let mut cmd = git(Some(&self.path), ["fetch", "--prune"]).await;
        if origin_is_remote(&self.origin) {
            cmd.args(["--depth", "1"]);
        }
        // Fetch straight from the origin URL: a bare clone doesn't carry
        // remote configuration. Discovery reads refs/remotes/origin/*; the
        // heads are mirrored too so that workspace clones of the cache can
        // resolve branches and reach their objects.
        cmd.arg(&self.origin)
            .args(["+refs/heads/*:refs/remotes/origin/*", "+refs/heads/*:refs/heads/*"]);
        cmd.execute().await.context("fetching into cache")?;
        Ok(())
    }

    // Branch names (origin/ prefix stripped, HEAD excluded) whose tip
    // commit's author time is at or after the cutoff.
    pub async fn branches_with_commits_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<String>> {
        let output = git(
            Some(&self.path),
            [
                "for-each-ref",
                "--format=%(refname) %(authordate:unix)",
                "refs/remotes/origin",
            ],
        )
        .await
        .execute()
        .await
        .context("listing cache branches")?;
        let out_str = str::from_utf8(&output.stdout).context("non utf-8 for-each-ref output")?;

        let mut branches = Vec::new();
        for line in out_str.lines() {
            let Some((refname, date)) = line.rsplit_once(' ') else {
                bail!("unparseable for-each-ref line {:?}", line);
            };
            let Some(branch) = refname.strip_prefix("refs/remotes/origin/") else {
                bail!("unexpected ref {:?} in cache", refname);
            };
            if branch == "HEAD" {
                continue;
            }
            let author_time = date
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .with_context(|| format!("bad author date {:?} for {:?}", date, refname))?;
            if author_time >= cutoff {
                branches.push(branch.to_owned());
            }
        }
        Ok(branches)
    }

    // Tip of the named branch. Fails with BranchNotFound (downcastable) if
    // the branch isn't in the cache.
    pub async fn tip_commit(&self, branch: &str) -> anyhow::Result<Commit> {
        let output = git(Some(&self.path), ["log", "-n1", "--format=%H %at %s"])
            .await
            .arg(format!("refs/remotes/origin/{}", branch))
            .arg("--")
            .output()
            .await
            .context("running 'git log -n1'")?;
        // Empirically git returns 128 when the revision doesn't exist; not
        // documented but it's been stable for a long time.
        if output.code_not_killed()? == 128 {
            return Err(BranchNotFound(branch.to_owned()).into());
        }
        output.ok().context("'git log -n1' failed")?;

        let out_string = String::from_utf8(output.stdout).context("reading git log output")?;
        let line = out_string.trim_end_matches('\n');
        let mut parts = line.splitn(3, ' ');
        let (hash, author_secs) = match (parts.next(), parts.next()) {
            (Some(h), Some(t)) if !h.is_empty() => (h, t),
            _ => bail!("failed to parse 'git log' output {:?}", line),
        };
        Ok(Commit {
            hash: CommitHash::new(hash),
            author_time: author_secs
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .with_context(|| format!("bad author time in {:?}", line))?,
            // %s of a message-less commit is empty, splitn then yields None.
            message: parts.next().unwrap_or("").to_owned(),
        })
    }
}

// Materialize the workspace checkout for one run: a single-branch clone of
// the cache at dest, hard-reset to the commit under test. Returns the
// workspace path (== dest). Failures here are run-level: the caller records
// them on the result and still finalizes.
pub async fn prepare_workspace(
    cache: &Cache,
    branch: &str,
    commit: &CommitHash,
    dest: &Path,
) -> anyhow::Result<PathBuf> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("workspace dest {:?} has no parent", dest))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating run directory {:?}", parent))?;

    let branch_clone = git(None, ["clone", "--single-branch", "--branch"])
        .await
        .arg(branch)
        .arg(cache.path())
        .arg(dest)
        .output()
        .await
        .context("spawning git clone")?
        .status
        .success();

    if branch_clone {
        // Normal path: the branch resolved, pin it to the exact commit. The
        // tip may have moved since discovery so this can still fail.
        if git(Some(dest), ["reset", "--hard"])
            .await
            .arg(commit)
            .output()
            .await
            .context("spawning git reset")?
            .status
            .success()
            && head_is(dest, commit).await?
        {
            return Ok(dest.to_owned());
        }
        warn!(
            "workspace for {}@{} didn't land on the commit via the branch, retrying detached",
            branch, commit
        );
    } else {
        // The branch ref couldn't be resolved in the cache (deleted or
        // renamed since discovery). Fall back to a detached checkout.
        debug!("single-branch clone of {:?} failed, cloning for detached checkout", branch);
        tokio::fs::remove_dir_all(dest)
            .await
            .ok();
        git(None, ["clone", "--no-checkout"])
            .await
            .arg(cache.path())
            .arg(dest)
            .execute()
            .await
            .context("cloning workspace")?;
    }

    // Direct commit checkout, once.
    git(Some(dest), ["checkout", "--detach"])
        .await
        .arg(commit)
        .execute()
        .await
        .with_context(|| format!("checking out commit {}", commit))?;
    if !head_is(dest, commit).await? {
        bail!("workspace HEAD is not {} after detached checkout", commit);
    }
    Ok(dest.to_owned())
}

async fn head_is(dir: &Path, commit: &CommitHash) -> anyhow::Result<bool> {
    let output = git(Some(dir), ["rev-parse", "HEAD"])
        .await
        .execute()
        .await
        .context("resolving workspace HEAD")?;
    let head = str::from_utf8(&output.stdout)
        .context("non utf-8 rev-parse output")?
        .trim();
    Ok(head == AsRef::<str>::as_ref(commit))
}
