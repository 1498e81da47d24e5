//! Background task ownership.
//!
//! A [`TaskGroup`] spawns named tasks that all observe one cancellation
//! token. Clients keep one group per session and tear it down as a unit.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl NamedTask {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Default)]
pub struct TaskGroup {
    token: CancellationToken,
    tasks: Vec<NamedTask>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the group is.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn `fut`, stopping it at its next suspension point once the
    /// group is cancelled. Returns `false` (and drops `fut`) if the group
    /// is already cancelled.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(task = name, "group cancelled, not spawning");
            return false;
        }
        self.tasks.retain(|t| !t.is_finished());

        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!(task = name, "cancelled"),
                _ = fut => debug!(task = name, "finished"),
            }
        });
        self.tasks.push(NamedTask { name, handle });
        true
    }

    /// Whether a task with this name is still running.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .iter()
            .any(|t| t.name == name && !t.is_finished())
    }

    pub fn len(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel the group and hand back its tasks for joining. The group is
    /// left fresh so it can be reused for a new session.
    pub fn cancel_and_take(&mut self) -> Vec<NamedTask> {
        self.token.cancel();
        self.token = CancellationToken::new();
        std::mem::take(&mut self.tasks)
    }

    /// Wait for `tasks` to exit, aborting any still running after `grace`.
    pub async fn join_all(tasks: Vec<NamedTask>, grace: Duration) {
        for task in tasks {
            let NamedTask { name, mut handle } = task;
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = name, "task panicked: {e}"),
                Err(_) => {
                    warn!(task = name, "did not stop within {grace:?}, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.tasks.iter().map(NamedTask::name).collect();
        f.debug_struct("TaskGroup")
            .field("cancelled", &self.token.is_cancelled())
            .field("tasks", &names)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
