//! Engine lifecycle controller.
//!
//! Owns the registry, scheduler, consumer pool, dispatcher and outcome
//! manager of one engine instance and moves them through
//! `Stopped -> Starting -> Running -> Stopping -> Stopped` as a unit.
//! `Reloading` is a stop-then-start sub-cycle entered from `Running`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{DeadLetterSink, MessageBroker};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigurationError, EngineError, EngineResult, RegistrationError};
use crate::events::{EngineEvent, EngineListener, ListenerSet};
use crate::job::JobDefinition;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::outcome::{ErrorKind, OutcomeHandler, OutcomeManager};
use crate::pool::ConsumerPool;
use crate::registry::JobRegistry;
use crate::scheduler::{CronScheduler, SchedulerContext};
use crate::worker::{FaultState, WorkerContext, WorkerSlot};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Reloading = 4,
}

impl From<u8> for EngineState {
    fn from(v: u8) -> Self {
        match v {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            4 => EngineState::Reloading,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Reloading => "reloading",
        };
        f.write_str(name)
    }
}

/// What `status()` reports to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Running { pid: u32, workers: Vec<Uuid> },
    Starting,
    Stopping,
    Reloading,
    Stopped,
}

/// Work that had to be aborted when a stop ran past its grace timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub aborted_cron_runs: usize,
    pub aborted_workers: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted_cron_runs == 0 && self.aborted_workers == 0
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    jobs: Vec<JobDefinition>,
    broker: Option<Arc<dyn MessageBroker>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    outcome_handlers: Vec<(Option<ErrorKind>, Arc<dyn OutcomeHandler>)>,
    listeners: Vec<Arc<dyn EngineListener>>,
    clock: Arc<dyn Clock>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            jobs: Vec::new(),
            broker: None,
            dead_letter: None,
            outcome_handlers: Vec::new(),
            listeners: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn job(mut self, job: JobDefinition) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn jobs(mut self, jobs: impl IntoIterator<Item = JobDefinition>) -> Self {
        self.jobs.extend(jobs);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Observe outcomes of one error kind.
    pub fn on_outcome(mut self, kind: ErrorKind, handler: impl OutcomeHandler + 'static) -> Self {
        self.outcome_handlers.push((Some(kind), Arc::new(handler)));
        self
    }

    /// Observe every outcome.
    pub fn on_any_outcome(mut self, handler: impl OutcomeHandler + 'static) -> Self {
        self.outcome_handlers.push((None, Arc::new(handler)));
        self
    }

    pub fn listener(mut self, listener: impl EngineListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register every job and wire the components together.
    pub fn build(self) -> Result<Engine, RegistrationError> {
        let registry = Arc::new(JobRegistry::new());
        for job in self.jobs {
            registry.register(job)?;
        }

        let outcomes = Arc::new(OutcomeManager::new(self.config.notify_timeout));
        outcomes.set_default_policy(self.config.default_policy);
        for rule in &self.config.policies {
            outcomes.set_policy(rule.job.as_deref(), rule.kind, rule.policy);
        }
        for (kind, handler) in self.outcome_handlers {
            outcomes.add_handler(kind, handler);
        }

        let listeners = Arc::new(ListenerSet::new());
        for listener in self.listeners {
            listeners.add(listener);
        }

        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            outcomes.clone(),
            metrics.clone(),
            self.config.default_timeout,
        ));
        let scheduler = Arc::new(CronScheduler::new(
            SchedulerContext {
                registry: registry.clone(),
                dispatcher: dispatcher.clone(),
                metrics: metrics.clone(),
                dead_letter: self.dead_letter.clone(),
                clock: self.clock,
            },
            self.config.scheduler_max_sleep,
        ));

        Ok(Engine {
            config: self.config,
            registry,
            outcomes,
            listeners,
            metrics,
            dispatcher,
            scheduler,
            broker: self.broker,
            dead_letter: self.dead_letter,
            fault: Arc::new(FaultState::new()),
            state: AtomicU8::new(EngineState::Stopped as u8),
            pool: Mutex::new(None),
            workers: RwLock::new(Vec::new()),
            transition: Mutex::new(()),
        })
    }
}

/// A supervised orchestration engine for cron and queue jobs.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    outcomes: Arc<OutcomeManager>,
    listeners: Arc<ListenerSet>,
    metrics: Arc<EngineMetrics>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<CronScheduler>,
    broker: Option<Arc<dyn MessageBroker>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    fault: Arc<FaultState>,
    state: AtomicU8,
    pool: Mutex<Option<ConsumerPool>>,
    workers: RwLock<Vec<Uuid>>,
    /// Serializes start, stop and reload.
    transition: Mutex<()>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn state(&self) -> EngineState {
        EngineState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> EngineResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| EngineError::InvalidStateTransition {
                from: EngineState::from(actual),
                to,
            })
    }

    pub fn status(&self) -> EngineStatus {
        match self.state() {
            EngineState::Running => EngineStatus::Running {
                pid: std::process::id(),
                workers: self.workers.read().clone(),
            },
            EngineState::Starting => EngineStatus::Starting,
            EngineState::Stopping => EngineStatus::Stopping,
            EngineState::Reloading => EngineStatus::Reloading,
            EngineState::Stopped => EngineStatus::Stopped,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    pub fn outcomes(&self) -> &Arc<OutcomeManager> {
        &self.outcomes
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fatal broker condition raised by the consumer pool, if any.
    pub fn fault(&self) -> Option<ConfigurationError> {
        self.fault.get().map(ConfigurationError::BrokerUnavailable)
    }

    /// Resolves once the consumer pool reports a fatal broker condition.
    pub async fn fault_raised(&self) -> ConfigurationError {
        self.fault.raised().await;
        self.fault()
            .unwrap_or_else(|| ConfigurationError::BrokerUnavailable("unknown".to_string()))
    }

    /// Slots of the running consumer pool.
    pub async fn worker_slots(&self) -> Vec<Arc<WorkerSlot>> {
        self.pool
            .lock()
            .await
            .as_ref()
            .map(|p| p.slots().to_vec())
            .unwrap_or_default()
    }

    /// Register a job. While running, cron jobs are armed right away;
    /// bindings on a queue without workers are picked up by the next reload.
    pub fn register(&self, job: JobDefinition) -> Result<(), RegistrationError> {
        let job = self.registry.register(job)?;
        if job.is_cron() && self.state() == EngineState::Running {
            self.scheduler.arm(&job);
        }
        Ok(())
    }

    /// Remove a job and its pending firings. In-flight runs finish.
    pub fn unregister(&self, id: &str) -> Result<(), RegistrationError> {
        self.registry.unregister(id)?;
        self.scheduler.cancel(id);
        Ok(())
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    /// Validate, connect, and start the scheduler and the consumer pool.
    pub async fn start(&self) -> EngineResult<()> {
        let _guard = self.transition.lock().await;
        self.start_locked().await
    }

    /// Stop intake, give in-flight work `grace_timeout` to settle, then
    /// abort what is left.
    pub async fn stop(&self) -> EngineResult<ShutdownReport> {
        let _guard = self.transition.lock().await;
        self.stop_locked().await
    }

    /// Stop then start. With `only_workers`, the scheduler keeps running
    /// with its fire queue intact and only the consumer pool is rebuilt.
    /// Either way the broker is reconnected once the old pool is gone, so
    /// deliveries left unsettled by aborted workers are redelivered.
    pub async fn reload(&self, only_workers: bool) -> EngineResult<ShutdownReport> {
        let _guard = self.transition.lock().await;
        self.transition(EngineState::Running, EngineState::Reloading)?;
        info!(only_workers, "Reloading engine");

        let grace = self.config.grace_timeout;
        let report = if only_workers {
            ShutdownReport {
                aborted_cron_runs: 0,
                aborted_workers: self.stop_pool(grace).await,
            }
        } else {
            self.stop_components(grace).await
        };

        if !only_workers {
            if let Err(e) = self.prepare().await {
                error!("Reload failed: {}", e);
                self.set_state(EngineState::Stopped);
                self.listeners.emit(EngineEvent::Stopped).await;
                return Err(e);
            }
            self.scheduler.start();
        } else if let Some(broker) = &self.broker {
            if let Err(e) = broker.connect().await {
                warn!("Broker reconnect during reload failed: {}", e);
            }
        }
        self.start_pool().await;

        self.set_state(EngineState::Running);
        self.listeners
            .emit(EngineEvent::Reloaded { only_workers })
            .await;
        info!("Engine reloaded");
        Ok(report)
    }

    /// Full stop followed by a fresh start.
    pub async fn restart(&self) -> EngineResult<ShutdownReport> {
        let _guard = self.transition.lock().await;
        let report = self.stop_locked().await?;
        self.start_locked().await?;
        Ok(report)
    }

    async fn start_locked(&self) -> EngineResult<()> {
        self.transition(EngineState::Stopped, EngineState::Starting)?;
        info!("Starting engine");
        self.listeners.emit(EngineEvent::BeforeStart).await;

        if let Err(e) = self.prepare().await {
            error!("Engine failed to start: {}", e);
            self.set_state(EngineState::Stopped);
            return Err(e);
        }

        self.scheduler.start();
        self.start_pool().await;
        self.metrics.mark_start();

        self.set_state(EngineState::Running);
        self.listeners.emit(EngineEvent::Started).await;
        info!(
            "Engine running: {} job(s), {} worker(s)",
            self.registry.len(),
            self.workers.read().len()
        );
        Ok(())
    }

    async fn stop_locked(&self) -> EngineResult<ShutdownReport> {
        self.transition(EngineState::Running, EngineState::Stopping)?;
        info!("Stopping engine");
        self.listeners.emit(EngineEvent::BeforeStop).await;

        let report = self.stop_components(self.config.grace_timeout).await;
        if tokio::time::timeout(self.config.notify_timeout, self.outcomes.flush())
            .await
            .is_err()
        {
            warn!("Outcome handlers still running at shutdown");
        }

        self.set_state(EngineState::Stopped);
        self.listeners.emit(EngineEvent::Stopped).await;
        if report.is_clean() {
            info!("Engine stopped");
        } else {
            warn!(
                "Engine stopped, aborted {} cron run(s) and {} worker(s)",
                report.aborted_cron_runs, report.aborted_workers
            );
        }
        Ok(report)
    }

    /// Structural checks and broker connectivity.
    async fn prepare(&self) -> EngineResult<()> {
        self.config.validate()?;

        let has_queue_jobs = !self.registry.queue_bindings(1).is_empty();
        match &self.broker {
            Some(broker) => broker
                .connect()
                .await
                .map_err(|e| ConfigurationError::BrokerUnavailable(e.to_string()))?,
            None if has_queue_jobs => {
                return Err(ConfigurationError::MissingDependency(
                    "message broker (queue jobs are registered)".to_string(),
                )
                .into());
            }
            None => {}
        }
        Ok(())
    }

    async fn start_pool(&self) {
        let queues = self.registry.queue_bindings(self.config.worker_count);
        let Some(broker) = self.broker.clone() else {
            self.workers.write().clear();
            return;
        };
        if queues.is_empty() {
            self.workers.write().clear();
            return;
        }

        self.fault.clear();
        let ctx = Arc::new(WorkerContext {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            broker,
            dead_letter: self.dead_letter.clone(),
            metrics: self.metrics.clone(),
            listeners: self.listeners.clone(),
            fault: self.fault.clone(),
            reconnect_backoff: self.config.reconnect_backoff,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
        });
        let pool = ConsumerPool::start(ctx, &queues);
        *self.workers.write() = pool.worker_ids();
        *self.pool.lock().await = Some(pool);
    }

    async fn stop_pool(&self, grace: Duration) -> usize {
        let pool = self.pool.lock().await.take();
        self.workers.write().clear();
        match pool {
            Some(pool) => pool.stop(grace).await,
            None => 0,
        }
    }

    async fn stop_components(&self, grace: Duration) -> ShutdownReport {
        let (aborted_cron_runs, aborted_workers) =
            tokio::join!(self.scheduler.stop(grace), self.stop_pool(grace));
        ShutdownReport {
            aborted_cron_runs,
            aborted_workers,
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
