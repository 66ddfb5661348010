//! Configuration schema definitions.

use serde::{Deserialize, Serialize};

mod schema_infra;
mod schema_jobs;

pub use schema_infra::*;
pub use schema_jobs::*;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,

    /// Engine-wide default retry policy.
    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub broker: BrokerSection,

    #[serde(default)]
    pub dead_letter: DeadLetterSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub cron: Vec<CronJobConfig>,

    #[serde(default)]
    pub queue: Vec<QueueJobConfig>,

    #[serde(default)]
    pub policy: Vec<PolicyConfig>,
}

/// Engine-wide execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Default worker slots per queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,

    /// Dispatch timeout for jobs without their own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// How long `stop` waits for in-flight work before aborting it.
    #[serde(default = "default_grace_timeout_ms")]
    pub grace_timeout_ms: u64,

    /// Upper bound for a single outcome handler invocation.
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
}

fn default_worker_count() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_grace_timeout_ms() -> u64 {
    10_000
}

fn default_notify_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            default_timeout_ms: default_timeout_ms(),
            grace_timeout_ms: default_grace_timeout_ms(),
            notify_timeout_ms: default_notify_timeout_ms(),
        }
    }
}

/// Backoff strategy between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Retries after the first attempt (0 = no retry).
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Fixed delay, or first delay for exponential backoff.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Cap for exponential backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Route to the dead-letter sink once retries are exhausted.
    #[serde(default)]
    pub dead_letter: bool,
}

fn default_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_factor() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::Fixed,
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            dead_letter: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,

    /// Directory for daily-rolling log files (console only when unset).
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
