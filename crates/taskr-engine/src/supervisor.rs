//! Supervised task groups with graceful-then-forced shutdown.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// A set of tasks sharing one shutdown sequence.
///
/// `stop` is the cooperative signal: tasks finish what they hold and exit.
/// `kill` drops whatever is still running once the grace period is over.
#[derive(Debug, Default)]
pub(crate) struct TaskGroup {
    tracker: TaskTracker,
    stop: CancellationToken,
    kill: CancellationToken,
}

impl TaskGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Spawn a task that is dropped when the group is killed.
    pub(crate) fn spawn<F>(&self, name: String, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let kill = self.kill.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = kill.cancelled() => debug!("Task {} aborted", name),
                _ = fut => {}
            }
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until no task is running, leaving the group open.
    pub(crate) async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Signal stop, wait up to `grace`, then kill stragglers.
    ///
    /// Returns the number of tasks that had to be killed.
    pub(crate) async fn shutdown(&self, grace: Duration) -> usize {
        self.stop.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return 0;
        }

        let stragglers = self.tracker.len();
        warn!(
            "{} task(s) still running after {:?} grace period, aborting",
            stragglers, grace
        );
        self.kill.cancel();
        self.tracker.wait().await;
        stragglers
    }
}
