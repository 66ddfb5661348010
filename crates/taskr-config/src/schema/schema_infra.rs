//! Broker and dead-letter configuration types.

use serde::{Deserialize, Serialize};

/// Message broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Root directory of the spool broker (one subdirectory per queue).
    #[serde(default)]
    pub spool_dir: Option<String>,

    /// How often an idle spool queue is re-scanned.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// First delay after a failed receive.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Consecutive receive failures before a worker gives up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_reconnect_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            spool_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Dead-letter routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterSection {
    /// Whether a dead-letter sink is attached at all.
    #[serde(default)]
    pub enabled: bool,

    /// Directory for dead-lettered records (defaults to `<spool_dir>/dead`).
    #[serde(default)]
    pub directory: Option<String>,
}
