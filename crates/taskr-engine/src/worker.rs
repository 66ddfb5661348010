//! Consumer worker loop.
//!
//! Each worker owns one [`WorkerSlot`] and processes at most one message at
//! a time: it does not receive again until the previous delivery has been
//! acked or nacked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::broker::{DeadLetter, DeadLetterSink, Message, MessageBroker};
use crate::dispatcher::Dispatcher;
use crate::events::{EngineEvent, ListenerSet};
use crate::handler::JobContext;
use crate::job::JobDefinition;
use crate::metrics::EngineMetrics;
use crate::outcome::{Backoff, JobOutcome, Settlement};
use crate::registry::JobRegistry;

/// One pool slot. A fresh id is minted every time a pool starts.
#[derive(Debug)]
pub struct WorkerSlot {
    id: Uuid,
    index: usize,
    queue: String,
    in_flight: Mutex<Option<u64>>,
    active: AtomicU32,
    peak: AtomicU32,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl WorkerSlot {
    pub fn new(index: usize, queue: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            queue: queue.into(),
            in_flight: Mutex::new(None),
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Delivery tag currently held, if any.
    pub fn in_flight(&self) -> Option<u64> {
        *self.in_flight.lock()
    }

    /// Highest number of dispatches ever observed in flight at once.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn begin(&self, delivery_tag: u64) -> InFlight<'_> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        *self.in_flight.lock() = Some(delivery_tag);
        InFlight(self)
    }
}

/// Releases the slot when the delivery is settled or abandoned.
struct InFlight<'a>(&'a WorkerSlot);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.0.in_flight.lock() = None;
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A fatal broker condition raised by a worker.
#[derive(Debug, Default)]
pub struct FaultState {
    message: Mutex<Option<String>>,
    notify: Notify,
}

impl FaultState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault. The first message wins until `clear`.
    pub fn raise(&self, message: String) {
        {
            let mut current = self.message.lock();
            if current.is_none() {
                error!("Broker fault: {}", message);
                *current = Some(message);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn get(&self) -> Option<String> {
        self.message.lock().clone()
    }

    pub fn clear(&self) {
        *self.message.lock() = None;
    }

    /// Resolves once a fault is recorded.
    pub async fn raised(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.message.lock().is_some() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared collaborators for every worker of a pool.
pub(crate) struct WorkerContext {
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) broker: Arc<dyn MessageBroker>,
    pub(crate) dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) listeners: Arc<ListenerSet>,
    pub(crate) fault: Arc<FaultState>,
    pub(crate) reconnect_backoff: Backoff,
    pub(crate) max_reconnect_attempts: u32,
}

pub(crate) struct Worker {
    pub(crate) slot: Arc<WorkerSlot>,
    pub(crate) ctx: Arc<WorkerContext>,
    pub(crate) stop: CancellationToken,
    pub(crate) kill: CancellationToken,
}

impl Worker {
    pub(crate) async fn run(self) {
        let span = info_span!("worker", queue = %self.slot.queue, slot = self.slot.index);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) {
        let queue = self.slot.queue.clone();
        info!("Worker {} started", self.slot.id);
        self.ctx
            .listeners
            .emit(EngineEvent::WorkerStarted {
                worker: self.slot.id,
                queue: queue.clone(),
            })
            .await;

        let mut failures = 0u32;
        loop {
            let received = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                received = self.ctx.broker.receive(&queue) => received,
            };

            match received {
                Ok(message) => {
                    failures = 0;
                    self.process(message).await;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures > self.ctx.max_reconnect_attempts {
                        self.ctx.fault.raise(format!(
                            "queue {}: {} consecutive receive failures, last: {}",
                            queue, failures, e
                        ));
                        break;
                    }
                    let delay = self.ctx.reconnect_backoff.delay_for(failures);
                    warn!("Receive failed ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.ctx.fault.raise(format!("queue {}: {}", queue, e));
                    break;
                }
            }
        }

        info!("Worker {} stopped", self.slot.id);
        self.ctx
            .listeners
            .emit(EngineEvent::WorkerStopped {
                worker: self.slot.id,
                queue,
            })
            .await;
    }

    async fn process(&self, message: Message) {
        let tag = message.delivery_tag;
        let Some(job) = self
            .ctx
            .registry
            .resolve_binding(&message.queue, message.routing_key.as_deref())
        else {
            self.settle_unroutable(message).await;
            return;
        };

        let _in_flight = self.slot.begin(tag);
        let mut ctx =
            JobContext::new(job.id.clone(), message.attempt()).with_payload(message.payload.clone());
        ctx.cancel = self.kill.child_token();

        let outcome = self.ctx.dispatcher.dispatch(&job, ctx).await;
        if outcome.is_success() {
            self.slot.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.slot.failed.fetch_add(1, Ordering::Relaxed);
        }

        let settlement =
            self.ctx
                .dispatcher
                .outcomes()
                .settle(&job.id, &outcome, self.ctx.dead_letter.is_some());
        self.apply(settlement, &job, message, outcome).await;
    }

    async fn apply(
        &self,
        settlement: Settlement,
        job: &JobDefinition,
        message: Message,
        outcome: JobOutcome,
    ) {
        let tag = message.delivery_tag;
        match settlement {
            Settlement::Ack => self.ack(tag).await,
            Settlement::Requeue { delay } => {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = self.stop.cancelled() => debug!("Backoff cut short by stop"),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                self.nack(tag, true).await;
                self.ctx.metrics.record_requeue();
            }
            Settlement::DeadLetter => {
                let letter = DeadLetter {
                    job_id: Some(job.id.clone()),
                    reason: outcome.to_string(),
                    message: Some(message),
                    outcome: Some(outcome),
                    failed_at: Utc::now(),
                };
                self.dead_letter(letter, tag).await;
            }
            Settlement::Discard => {
                error!(
                    "Job {} exhausted its retries, dropping delivery {}: {}",
                    job.id, tag, outcome
                );
                self.ack(tag).await;
                self.ctx.metrics.record_discard();
            }
        }
    }

    async fn settle_unroutable(&self, message: Message) {
        let tag = message.delivery_tag;
        if self.ctx.dead_letter.is_some() {
            let letter = DeadLetter {
                job_id: None,
                reason: format!(
                    "no job bound to queue {} with routing key {:?}",
                    message.queue, message.routing_key
                ),
                message: Some(message),
                outcome: None,
                failed_at: Utc::now(),
            };
            self.dead_letter(letter, tag).await;
        } else {
            warn!(
                "No job bound to queue {} (routing key {:?}), dropping delivery {}",
                message.queue, message.routing_key, tag
            );
            self.ack(tag).await;
            self.ctx.metrics.record_discard();
        }
    }

    async fn dead_letter(&self, letter: DeadLetter, tag: u64) {
        let Some(sink) = &self.ctx.dead_letter else {
            return;
        };
        match sink.publish(letter).await {
            Ok(()) => {
                self.nack(tag, false).await;
                self.ctx.metrics.record_dead_letter();
            }
            Err(e) => {
                error!("Dead-letter publish failed for delivery {}: {}", tag, e);
                self.nack(tag, true).await;
                self.ctx.metrics.record_requeue();
            }
        }
    }

    async fn ack(&self, tag: u64) {
        match self.ctx.broker.ack(tag).await {
            Ok(()) => self.ctx.metrics.record_ack(),
            Err(e) => warn!("Ack of delivery {} failed: {}", tag, e),
        }
    }

    async fn nack(&self, tag: u64, requeue: bool) {
        if let Err(e) = self.ctx.broker.nack(tag, requeue).await {
            warn!("Nack of delivery {} failed: {}", tag, e);
        }
    }
}
