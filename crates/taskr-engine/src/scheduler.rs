//! Cron scheduler.
//!
//! A single loop owns the timing: it sleeps until the earliest pending fire
//! time (or a wake signal), pops every due event, hands each job to the
//! dispatcher on its own task, and re-arms the job with its next occurrence.
//!
//! When several occurrences of a job elapsed without firing (the engine was
//! paused, the host slept, the loop was starved), only the latest one runs.
//! The skipped ones are counted and logged, never replayed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{DeadLetter, DeadLetterSink};
use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::handler::JobContext;
use crate::job::JobDefinition;
use crate::metrics::EngineMetrics;
use crate::outcome::Settlement;
use crate::registry::JobRegistry;
use crate::supervisor::TaskGroup;

/// A pending firing. Ordered by time, then job id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduledFireEvent {
    pub fire_at: DateTime<Utc>,
    pub job_id: String,
}

/// One job handed to the dispatcher by a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredJob {
    pub job_id: String,

    /// Occurrence being run (the latest elapsed one).
    pub scheduled_for: DateTime<Utc>,

    /// Earlier occurrences coalesced into this run.
    pub missed: u64,
}

/// Collaborators a scheduler runs with.
pub struct SchedulerContext {
    pub registry: Arc<JobRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<EngineMetrics>,
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub clock: Arc<dyn Clock>,
}

/// Time-ordered fire queue plus the loop that drains it.
pub struct CronScheduler {
    ctx: SchedulerContext,
    queue: Mutex<BinaryHeap<Reverse<ScheduledFireEvent>>>,
    wake: Notify,
    paused: AtomicBool,
    max_sleep: Duration,
    runs: Mutex<Arc<TaskGroup>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(ctx: SchedulerContext, max_sleep: Duration) -> Self {
        Self {
            ctx,
            queue: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            max_sleep,
            runs: Mutex::new(Arc::new(TaskGroup::new())),
            loop_handle: Mutex::new(None),
        }
    }

    /// Arm every registered cron job and start the timing loop, unpaused.
    pub fn start(self: &Arc<Self>) {
        let runs = Arc::new(TaskGroup::new());
        let stop = runs.stop_token();
        *self.runs.lock() = runs;
        self.paused.store(false, Ordering::SeqCst);

        self.queue.lock().clear();
        for job in self.ctx.registry.cron_jobs() {
            self.arm(&job);
        }

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop(stop).await });
        if let Some(old) = self.loop_handle.lock().replace(handle) {
            old.abort();
        }
        info!("Cron scheduler started with {} job(s)", self.queue.lock().len());
    }

    /// Stop the loop, wait up to `grace` for running jobs, then abort them.
    /// Pending events are discarded. Returns the number of aborted runs.
    pub async fn stop(&self, grace: Duration) -> usize {
        let runs = self.runs.lock().clone();
        let handle = self.loop_handle.lock().take();

        runs.stop_token().cancel();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let aborted = runs.shutdown(grace).await;
        self.queue.lock().clear();
        info!("Cron scheduler stopped");
        aborted
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Suspend firing. Elapsed occurrences are coalesced on resume.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Cron scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Cron scheduler resumed");
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wake the loop so it re-reads the clock and the queue.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// (Re)arm a job at its first occurrence after now.
    pub fn arm(&self, job: &JobDefinition) {
        let Some(schedule) = job.schedule() else {
            return;
        };
        let now = self.ctx.clock.now();
        let mut queue = self.queue.lock();
        queue.retain(|Reverse(e)| e.job_id != job.id);
        match schedule.next_after(now) {
            Some(fire_at) => {
                debug!("Armed job {} for {}", job.id, fire_at);
                queue.push(Reverse(ScheduledFireEvent {
                    fire_at,
                    job_id: job.id.clone(),
                }));
            }
            None => warn!("Job {} has no future occurrence", job.id),
        }
        drop(queue);
        self.wake.notify_one();
    }

    /// Remove every pending event for `job_id`. Runs already in flight
    /// are not interrupted.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|Reverse(e)| e.job_id != job_id);
        let removed = queue.len() != before;
        drop(queue);
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    /// Sorted snapshot of the fire queue.
    pub fn pending(&self) -> Vec<ScheduledFireEvent> {
        let mut events: Vec<_> = self.queue.lock().iter().map(|Reverse(e)| e.clone()).collect();
        events.sort();
        events
    }

    /// Cron runs currently executing.
    pub fn active_runs(&self) -> usize {
        self.runs.lock().len()
    }

    /// Wait for every cron run to finish.
    pub async fn wait_idle(&self) {
        let runs = self.runs.lock().clone();
        runs.wait_idle().await;
    }

    /// Fire everything due at `now`, in `(fire_at, job_id)` order.
    ///
    /// Does nothing while paused. Each due job is dispatched once for its
    /// latest elapsed occurrence and re-armed after `now`.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<FiredJob> {
        if self.is_paused() {
            return Vec::new();
        }

        let due = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            while queue.peek().is_some_and(|Reverse(e)| e.fire_at <= now) {
                if let Some(Reverse(event)) = queue.pop() {
                    due.push(event);
                }
            }
            due
        };

        let mut fired = Vec::with_capacity(due.len());
        for event in due {
            let Some(job) = self.ctx.registry.lookup(&event.job_id) else {
                debug!("Dropping event for unregistered job {}", event.job_id);
                continue;
            };
            let Some(schedule) = job.schedule() else {
                continue;
            };

            let catch_up = schedule.catch_up(event.fire_at, now);
            if catch_up.missed > 0 {
                warn!(
                    job = %job.id,
                    missed = catch_up.missed,
                    "Coalesced missed cron windows into one run for {}",
                    catch_up.fire_for
                );
            }
            if let Some(next) = catch_up.next {
                self.queue.lock().push(Reverse(ScheduledFireEvent {
                    fire_at: next,
                    job_id: job.id.clone(),
                }));
            }

            self.ctx.metrics.record_cron_fire(catch_up.missed);
            fired.push(FiredJob {
                job_id: job.id.clone(),
                scheduled_for: catch_up.fire_for,
                missed: catch_up.missed,
            });
            self.spawn_run(job, catch_up.fire_for);
        }
        fired
    }

    fn spawn_run(&self, job: Arc<JobDefinition>, scheduled_for: DateTime<Utc>) {
        let runs = self.runs.lock().clone();
        let run = CronRun {
            dispatcher: self.ctx.dispatcher.clone(),
            metrics: self.ctx.metrics.clone(),
            dead_letter: self.ctx.dead_letter.clone(),
            stop: runs.stop_token(),
            kill: runs.kill_token(),
        };
        let name = format!("cron:{}", job.id);
        runs.spawn(name, run.execute(job, scheduled_for));
    }

    fn sleep_duration(&self) -> Duration {
        if self.is_paused() {
            return self.max_sleep;
        }
        let now = self.ctx.clock.now();
        self.queue
            .lock()
            .peek()
            .map(|Reverse(e)| (e.fire_at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.max_sleep)
            .min(self.max_sleep)
    }

    async fn run_loop(self: Arc<Self>, stop: CancellationToken) {
        loop {
            let wait = self.sleep_duration();
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            if stop.is_cancelled() {
                break;
            }
            let fired = self.tick(self.ctx.clock.now());
            if !fired.is_empty() {
                debug!("Tick fired {} job(s)", fired.len());
            }
        }
        debug!("Cron loop exited");
    }
}

/// One cron occurrence, retried in place per the outcome policy.
struct CronRun {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<EngineMetrics>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    stop: CancellationToken,
    kill: CancellationToken,
}

impl CronRun {
    async fn execute(self, job: Arc<JobDefinition>, scheduled_for: DateTime<Utc>) {
        let outcomes = self.dispatcher.outcomes().clone();
        let mut attempt = 1;
        loop {
            let mut ctx = JobContext::new(job.id.clone(), attempt).with_scheduled_for(scheduled_for);
            ctx.cancel = self.kill.child_token();

            let outcome = self.dispatcher.dispatch(&job, ctx).await;
            match outcomes.settle(&job.id, &outcome, self.dead_letter.is_some()) {
                Settlement::Ack => return,
                Settlement::Requeue { delay } => {
                    self.metrics.record_requeue();
                    tokio::select! {
                        _ = self.stop.cancelled() => {
                            info!("Retry of cron job {} skipped, scheduler stopping", job.id);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Settlement::DeadLetter => {
                    let Some(sink) = &self.dead_letter else {
                        return;
                    };
                    let letter = DeadLetter {
                        job_id: Some(job.id.clone()),
                        message: None,
                        reason: outcome.to_string(),
                        outcome: Some(outcome),
                        failed_at: Utc::now(),
                    };
                    match sink.publish(letter).await {
                        Ok(()) => self.metrics.record_dead_letter(),
                        Err(e) => error!("Failed to dead-letter cron job {}: {}", job.id, e),
                    }
                    return;
                }
                Settlement::Discard => {
                    self.metrics.record_discard();
                    error!(
                        "Cron job {} gave up after {} attempt(s): {}",
                        job.id, attempt, outcome
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
