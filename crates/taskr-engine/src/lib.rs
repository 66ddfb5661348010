//! # Taskr Engine
//!
//! Orchestration of timed (cron) and message-driven (queue) background jobs.
//!
//! ## Layout
//!
//! - [`registry`]: job definitions keyed by id
//! - [`scheduler`]: time-ordered fire queue and its loop
//! - [`pool`]: per-queue consumer workers, one delivery in flight per slot
//! - [`dispatcher`]: runs a job once with a timeout and classifies the result
//! - [`outcome`]: retry policy, settlement and outcome observers
//! - [`engine`]: the lifecycle controller tying everything together
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskr_engine::{Engine, JobContext, JobDefinition, MemoryBroker, QueueBinding, handler_fn};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(MemoryBroker::new());
//! let engine = Engine::builder()
//!     .broker(broker.clone())
//!     .job(JobDefinition::cron(
//!         "nightly-report",
//!         "0 3 * * *",
//!         handler_fn(|_ctx: JobContext| async { Ok(()) }),
//!     ))
//!     .job(JobDefinition::queue(
//!         "send-mail",
//!         QueueBinding::new("mail").with_concurrency(4),
//!         handler_fn(|ctx: JobContext| async move {
//!             let _body = ctx.text();
//!             Ok(())
//!         }),
//!     ))
//!     .build()?;
//!
//! engine.start().await?;
//! broker.publish("mail", "hello");
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod memory_broker;
pub mod metrics;
pub mod outcome;
pub mod pool;
pub mod registry;
pub mod schedule;
pub mod scheduler;
mod supervisor;
pub mod worker;

pub use broker::{DeadLetter, DeadLetterSink, Message, MessageBroker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, PolicyRule};
pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineBuilder, EngineState, EngineStatus, ShutdownReport};
pub use error::{
    BrokerError, ConfigurationError, EngineError, EngineResult, JobError, RegistrationError,
    ScheduleError,
};
pub use events::{EngineEvent, EngineListener, ListenerSet, listener_fn};
pub use handler::{FnHandler, JobContext, JobHandler, handler_fn};
pub use job::{JobDefinition, QueueBinding, ScheduleSpec, Trigger};
pub use memory_broker::{MemoryBroker, MemoryDeadLetterSink};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use outcome::{
    Backoff, BoxError, ErrorKind, JobOutcome, OutcomeHandler, OutcomeManager, RetryPolicy,
    Settlement, classify, outcome_fn,
};
pub use pool::ConsumerPool;
pub use registry::JobRegistry;
pub use schedule::{CatchUp, Schedule};
pub use scheduler::{CronScheduler, FiredJob, ScheduledFireEvent};
pub use worker::{FaultState, WorkerSlot};
