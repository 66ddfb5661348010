//! Queue consumer pool.
//!
//! One dedicated sub-pool per distinct queue name. Every slot runs its own
//! worker loop, so concurrent work is bounded by the number of slots.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::supervisor::TaskGroup;
use crate::worker::{Worker, WorkerContext, WorkerSlot};

/// A started set of workers. Dropped and rebuilt on every (re)start.
pub struct ConsumerPool {
    slots: Vec<Arc<WorkerSlot>>,
    group: TaskGroup,
}

impl ConsumerPool {
    /// Spawn `count` workers for each `(queue, count)` pair.
    pub(crate) fn start(ctx: Arc<WorkerContext>, queues: &[(String, u32)]) -> Self {
        let group = TaskGroup::new();
        let mut slots = Vec::new();

        for (queue, count) in queues {
            for index in 0..*count as usize {
                let slot = Arc::new(WorkerSlot::new(index, queue.clone()));
                let worker = Worker {
                    slot: slot.clone(),
                    ctx: ctx.clone(),
                    stop: group.stop_token(),
                    kill: group.kill_token(),
                };
                group.spawn(format!("worker:{}:{}", queue, index), worker.run());
                slots.push(slot);
            }
            info!("Queue {} consuming with {} worker(s)", queue, count);
        }

        Self { slots, group }
    }

    pub fn slots(&self) -> &[Arc<WorkerSlot>] {
        &self.slots
    }

    pub fn worker_ids(&self) -> Vec<Uuid> {
        self.slots.iter().map(|s| s.id()).collect()
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Workers still running.
    pub fn live_workers(&self) -> usize {
        self.group.len()
    }

    /// Let every worker settle its in-flight delivery and exit, aborting
    /// whatever is left after `grace`. Returns the number aborted.
    pub(crate) async fn stop(&self, grace: Duration) -> usize {
        let aborted = self.group.shutdown(grace).await;
        info!(
            "Consumer pool stopped ({} worker(s), {} aborted)",
            self.slots.len(),
            aborted
        );
        aborted
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
