//! Job and policy configuration types.

use serde::{Deserialize, Serialize};

use super::RetrySection;

/// A cron-triggered job. Exactly one of `schedule` or `interval_secs` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub id: String,

    /// Standard 5-field cron expression.
    #[serde(default)]
    pub schedule: Option<String>,

    /// Fixed interval in seconds.
    #[serde(default)]
    pub interval_secs: Option<u64>,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A queue-triggered job bound to one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJobConfig {
    pub id: String,

    pub queue: String,

    #[serde(default)]
    pub routing_key: Option<String>,

    /// Worker slots for this binding (engine default when unset).
    #[serde(default)]
    pub concurrency: Option<u32>,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Retry policy override, scoped by job and/or error kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Job id; applies to every job when unset.
    #[serde(default)]
    pub job: Option<String>,

    /// `business`, `fault` or `timeout`; applies to every kind when unset.
    #[serde(default)]
    pub kind: Option<String>,

    #[serde(flatten)]
    pub retry: RetrySection,
}
