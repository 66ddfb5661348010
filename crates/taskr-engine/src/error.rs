//! Error types for the engine.

use thiserror::Error;

use crate::engine::EngineState;

/// Errors raised while registering a job. Fatal to that registration only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Job identifier is empty.
    #[error("Job identifier cannot be empty")]
    EmptyIdentifier,

    /// A job with the same identifier already exists.
    #[error("Job already registered: {0}")]
    DuplicateIdentifier(String),

    /// Cron expression or interval failed to compile.
    #[error("Invalid schedule for job {id}: {reason}")]
    InvalidSchedule { id: String, reason: String },

    /// Queue job without a usable source.
    #[error("Queue job {0} has no source binding")]
    MissingBinding(String),

    /// Queue binding with zero worker slots.
    #[error("Queue job {0} must have a concurrency of at least 1")]
    InvalidConcurrency(String),

    /// Job not found (reported by unregister, never fatal).
    #[error("Job not found: {0}")]
    NotFound(String),
}

/// Errors raised by schedule compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Wrong number of cron fields.
    #[error("expected 5 or 6 cron fields, got {0}")]
    FieldCount(usize),

    /// Expression rejected by the cron parser.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// Interval of zero length.
    #[error("interval must be greater than zero")]
    ZeroInterval,
}

/// Structural errors that prevent the engine from starting.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Pool size out of range.
    #[error("Invalid pool size: {0} (must be at least 1)")]
    InvalidPoolSize(u32),

    /// A required external component is not configured.
    #[error("Missing required dependency: {0}")]
    MissingDependency(String),

    /// The message broker could not be reached.
    #[error("Message broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Any other invalid setting.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Loading or validating the configuration file failed.
    #[error(transparent)]
    Config(#[from] taskr_config::ConfigError),
}

/// Errors reported by a message broker connector.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connectivity lost or refused.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// Ack or nack for a delivery the broker does not know.
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// Broker shut down.
    #[error("Broker closed")]
    Closed,

    /// IO error.
    #[error("Broker IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connector-specific failure.
    #[error("{0}")]
    Custom(String),
}

impl BrokerError {
    /// Whether a retry after backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Io(_))
    }
}

/// Errors returned by job handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Expected failure raised by the handler's own logic.
    #[error("{0}")]
    Business(String),

    /// Unexpected failure (panic, IO, broken invariant).
    #[error("unexpected fault: {0}")]
    Fault(String),
}

impl JobError {
    pub fn business(message: impl Into<String>) -> Self {
        JobError::Business(message.into())
    }

    pub fn fault(message: impl Into<String>) -> Self {
        JobError::Fault(message.into())
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Fault(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Business(format!("invalid payload: {}", err))
    }
}

/// Errors surfaced by the lifecycle controller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation not allowed in the current state.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: EngineState, to: EngineState },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Result type for lifecycle operations.
pub type EngineResult<T> = Result<T, EngineError>;
