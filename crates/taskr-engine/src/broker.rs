//! Message broker contract.
//!
//! The engine consumes an external broker through [`MessageBroker`] and
//! routes exhausted jobs through an optional [`DeadLetterSink`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::BrokerError;
use crate::outcome::JobOutcome;

/// One delivery from a broker queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,

    /// Broker-assigned id of this delivery; used for ack and nack.
    pub delivery_tag: u64,

    /// Whether the message was delivered before.
    pub redelivered: bool,

    /// 1 on first delivery, incremented on every requeue.
    pub delivery_count: u32,

    pub queue: String,

    pub routing_key: Option<String>,
}

impl Message {
    pub fn new(queue: impl Into<String>, delivery_tag: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            delivery_tag,
            redelivered: false,
            delivery_count: 1,
            queue: queue.into(),
            routing_key: None,
        }
    }

    /// Attempt number this delivery stands for.
    pub fn attempt(&self) -> u32 {
        self.delivery_count.max(1)
    }
}

/// External broker connection.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Verify connectivity. Called once by `Engine::start`.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Wait for the next message on `queue`.
    async fn receive(&self, queue: &str) -> Result<Message, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery; `requeue` puts it back on its queue.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// A job or message that ran out of retries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Job the failure belongs to; `None` when no binding matched.
    pub job_id: Option<String>,

    /// Original delivery; `None` for cron jobs.
    pub message: Option<Message>,

    /// Final outcome; `None` when the message was never dispatched.
    pub outcome: Option<JobOutcome>,

    pub reason: String,

    pub failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: DeadLetter) -> Result<(), BrokerError>;
}
