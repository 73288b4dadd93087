use std::{fmt::Display, future::Future, io};

#[allow(unused_imports)]
use log::{debug, error};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// Best-effort bookkeeping (state saves, workspace removal) logs its failure
// and moves on rather than taking the run that triggered it down with it.
pub trait ResultExt {
    fn or_log_error(&self, what: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, what: &str) {
        if let Err(e) = self {
            error!("{} - {}", what, e);
        }
    }
}

pub trait IoResultExt {
    // Treat one specific error kind as a non-event. Mostly used with
    // NotFound when deleting things that may already be gone.
    fn ignore(self, kind: io::ErrorKind) -> Self;
}

impl IoResultExt for io::Result<()> {
    fn ignore(self, kind: io::ErrorKind) -> io::Result<()> {
        match self {
            Err(e) if e.kind() == kind => Ok(()),
            other => other,
        }
    }
}

// The supervisor's long-running tasks (signal watcher, scheduler, monitor
// loop, reaper) all live in one of these. The first task to return an error
// cancels the shared token so the others wind down, and that error becomes
// the outcome of the whole group; a clean shutdown is every task returning
// Ok after cancellation.
pub struct TaskGroup {
    ct: CancellationToken,
    tasks: JoinSet<anyhow::Result<()>>,
}

impl TaskGroup {
    pub fn new(ct: CancellationToken) -> Self {
        Self {
            ct,
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    // Wait for every task to finish and return the first error, if any.
    // A panicking task panics here too.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut outcome = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined.expect("supervisor task panicked") {
                self.ct.cancel();
                outcome = Err(e);
                break;
            }
        }
        // The remaining tasks have seen the cancellation (or soon will);
        // give them the chance to exit on their own terms.
        let _ = self.tasks.join_all().await;
        outcome
    }
}
