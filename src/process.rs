use std::io;
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
#[allow(unused_imports)]
use log::{debug, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// How long a child gets between SIGTERM and SIGKILL once its deadline has
// expired or the supervisor is shutting down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub trait OutputExt {
    // Returns an error if the command failed, with stderr in the message.
    fn ok(&self) -> anyhow::Result<()>;
    // Exit code, as long as the process wasn't killed by a signal.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for Output {
    fn ok(&self) -> anyhow::Result<()> {
        let code = self.code_not_killed()?;
        if code != 0 {
            bail!(
                "failed with exit code {}. stderr:\n{}",
                code,
                String::from_utf8_lossy(&self.stderr)
            );
        }
        Ok(())
    }

    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow!("killed by signal {:?}", self.status))
    }
}

pub trait CommandExt {
    // Run the command to completion, capturing output, and fail loudly
    // (including stderr in the error) unless it exits zero.
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .await
            .with_context(|| format!("spawning {:?}", self))?;
        output.ok().with_context(|| format!("running {:?}", self))?;
        Ok(output)
    }
}

// How a supervised script came to stop running.
#[derive(Debug, PartialEq, Eq)]
pub enum ScriptStatus {
    Completed { exit_code: i32 },
    TimedOut,
    Canceled,
}

impl ScriptStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Completed { exit_code: 0 })
    }
}

// Copy everything from the child's pipe into the run log and the
// supervisor's own stream, so the user sees test output live but it's also
// recorded. The log file is shared between the stdout and stderr pumps.
async fn tee(
    mut from: impl AsyncRead + Unpin,
    log: Arc<Mutex<tokio::fs::File>>,
    mut term: impl AsyncWrite + Unpin,
) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        log.lock().await.write_all(&buf[..n]).await?;
        // Failure to write to the terminal shouldn't kill the run, the log
        // file is the record that matters.
        let _ = term.write_all(&buf[..n]).await;
    }
}

fn signal_group(child: &Child, signal: Signal) -> anyhow::Result<()> {
    let pid = child.id().context("no PID for child")?;
    killpg(Pid::from_raw(pid.try_into().context("converting child PID")?), signal)
        .context("signalling child process group")
}

// Run a script to completion under a wall-clock deadline, teeing its output
// into the given log file. On deadline expiry or cancellation the child's
// process group gets SIGTERM, then SIGKILL if it lingers past the grace
// period. The returned status distinguishes the three ways out; spawn
// failures and signal-deaths we didn't cause are errors.
pub async fn run_script(
    mut cmd: Command,
    timeout: Duration,
    ct: &CancellationToken,
    log: tokio::fs::File,
) -> anyhow::Result<ScriptStatus> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Separate process group so we can signal the script and everything it
    // spawned, and so the user Ctrl-C'ing the supervisor doesn't reach the
    // script behind our back.
    cmd.process_group(0);
    let mut child = cmd.spawn().with_context(|| format!("spawning {:?}", cmd))?;

    let log = Arc::new(Mutex::new(log));
    let stdout = child.stdout.take().expect("child stdout not piped");
    let stderr = child.stderr.take().expect("child stderr not piped");
    let out_pump = tokio::spawn(tee(stdout, log.clone(), tokio::io::stdout()));
    let err_pump = tokio::spawn(tee(stderr, log.clone(), tokio::io::stderr()));

    enum Waited {
        Exited(io::Result<ExitStatus>),
        Deadline,
        Canceled,
    }
    let waited = select! {
        result = child.wait() => Waited::Exited(result),
        _ = sleep(timeout) => Waited::Deadline,
        _ = ct.cancelled() => Waited::Canceled,
    };

    let timed_out = matches!(waited, Waited::Deadline);
    let status = match waited {
        Waited::Exited(result) => {
            let status = result.context("awaiting child")?;
            ScriptStatus::Completed {
                exit_code: status
                    .code()
                    .ok_or_else(|| anyhow!("script killed by signal {:?}", status))?,
            }
        }
        Waited::Deadline | Waited::Canceled => {
            signal_group(&child, Signal::SIGTERM).or_else(|e| {
                // The child may have exited in the meantime, in which case
                // there's nobody to signal and nothing to do.
                debug!("SIGTERM after deadline failed: {e}");
                anyhow::Ok(())
            })?;
            select! {
                _ = child.wait() => (),
                _ = sleep(SHUTDOWN_GRACE) => {
                    warn!("script ignored SIGTERM, sending SIGKILL");
                    let _ = signal_group(&child, Signal::SIGKILL);
                    let _ = child.wait().await;
                }
            }
            if timed_out {
                ScriptStatus::TimedOut
            } else {
                ScriptStatus::Canceled
            }
        }
    };

    // The pipes must be drained and closed before the caller finalizes the
    // run, otherwise the log file is incomplete (or worse, we leak the
    // pumps). Once the child is gone both pumps see EOF promptly.
    let _ = out_pump.await.expect("joining stdout pump");
    let _ = err_pump.await.expect("joining stderr pump");
    log.lock().await.flush().await.context("flushing run log")?;

    Ok(status)
}
