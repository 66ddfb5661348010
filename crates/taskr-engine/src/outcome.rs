//! Outcome classification, retry policy and outcome notification.
//!
//! Every dispatch ends in one [`JobOutcome`]. The [`OutcomeManager`] decides
//! what happens next from the policy registered for the job and error kind,
//! and hands the outcome to user-registered observers. Observers run off
//! the dispatch path with a timeout; their failures are logged and dropped.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::error::JobError;

/// Boxed error returned by outcome handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure category used for policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Raised by the handler's own logic.
    Business,
    /// Panic, IO failure or other unexpected condition.
    Fault,
    /// The dispatch exceeded its timeout.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Business => "business",
            ErrorKind::Fault => "fault",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "business" => Ok(ErrorKind::Business),
            "fault" => Ok(ErrorKind::Fault),
            "timeout" => Ok(ErrorKind::Timeout),
            other => Err(format!("unknown error kind: {}", other)),
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure {
        kind: ErrorKind,
        attempt: u32,
        message: String,
    },
    Timeout {
        attempt: u32,
    },
}

impl JobOutcome {
    pub fn failure(error: &JobError, attempt: u32) -> Self {
        JobOutcome::Failure {
            kind: classify(error),
            attempt,
            message: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }

    /// Error kind, or `None` for success. A timeout counts as a failure of
    /// kind [`ErrorKind::Timeout`].
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            JobOutcome::Success => None,
            JobOutcome::Failure { kind, .. } => Some(*kind),
            JobOutcome::Timeout { .. } => Some(ErrorKind::Timeout),
        }
    }

    pub fn attempt(&self) -> Option<u32> {
        match self {
            JobOutcome::Success => None,
            JobOutcome::Failure { attempt, .. } | JobOutcome::Timeout { attempt } => Some(*attempt),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "success"),
            JobOutcome::Failure {
                kind,
                attempt,
                message,
            } => write!(f, "{} failure on attempt {}: {}", kind, attempt, message),
            JobOutcome::Timeout { attempt } => write!(f, "timeout on attempt {}", attempt),
        }
    }
}

/// Map a handler error to its kind.
pub fn classify(error: &JobError) -> ErrorKind {
    match error {
        JobError::Business(_) => ErrorKind::Business,
        JobError::Fault(_) => ErrorKind::Fault,
    }
}

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `first × factor^(attempt-1)`, clamped to `max`.
    Exponential {
        first: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { first, factor, max } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = first.as_secs_f64() * factor.powi(exp);
                if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// What to do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Route to the dead-letter sink once retries run out.
    pub dead_letter: bool,
}

impl RetryPolicy {
    /// No retry, log only.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
            dead_letter: false,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
            dead_letter: false,
        }
    }

    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Decision for one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Done. Queue jobs are acked.
    Ack,
    /// Run again after `delay`.
    Requeue { delay: Duration },
    /// Retry budget exhausted; hand to the dead-letter sink.
    DeadLetter,
    /// Retry budget exhausted and no sink: log and drop.
    Discard,
}

/// Observer invoked for job outcomes.
#[async_trait]
pub trait OutcomeHandler: Send + Sync {
    async fn on_outcome(&self, job_id: &str, outcome: &JobOutcome) -> Result<(), BoxError>;
}

/// Adapter turning a closure into an [`OutcomeHandler`].
pub struct FnOutcomeHandler<F>(F);

pub fn outcome_fn<F>(f: F) -> FnOutcomeHandler<F>
where
    F: Fn(&str, &JobOutcome) -> Result<(), BoxError> + Send + Sync + 'static,
{
    FnOutcomeHandler(f)
}

#[async_trait]
impl<F> OutcomeHandler for FnOutcomeHandler<F>
where
    F: Fn(&str, &JobOutcome) -> Result<(), BoxError> + Send + Sync + 'static,
{
    async fn on_outcome(&self, job_id: &str, outcome: &JobOutcome) -> Result<(), BoxError> {
        (self.0)(job_id, outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PolicyKey {
    job: Option<String>,
    kind: Option<ErrorKind>,
}

struct RegisteredHandler {
    /// `None` observes every outcome, successes included.
    kind: Option<ErrorKind>,
    handler: Arc<dyn OutcomeHandler>,
}

/// Policy table and outcome observers.
pub struct OutcomeManager {
    default_policy: RwLock<RetryPolicy>,
    policies: RwLock<HashMap<PolicyKey, RetryPolicy>>,
    handlers: RwLock<Vec<RegisteredHandler>>,
    tracker: TaskTracker,
    notify_timeout: Duration,
}

impl OutcomeManager {
    pub fn new(notify_timeout: Duration) -> Self {
        Self {
            default_policy: RwLock::new(RetryPolicy::none()),
            policies: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            tracker: TaskTracker::new(),
            notify_timeout,
        }
    }

    pub fn set_default_policy(&self, policy: RetryPolicy) {
        *self.default_policy.write() = policy;
    }

    /// Register a policy for a job and/or error kind. `None` matches any.
    pub fn set_policy(&self, job: Option<&str>, kind: Option<ErrorKind>, policy: RetryPolicy) {
        let key = PolicyKey {
            job: job.map(str::to_string),
            kind,
        };
        self.policies.write().insert(key, policy);
    }

    /// Most specific policy: `(job, kind)`, then `(job, any)`, then
    /// `(any, kind)`, then the default.
    pub fn policy_for(&self, job_id: &str, kind: ErrorKind) -> RetryPolicy {
        let policies = self.policies.read();
        let candidates = [
            PolicyKey {
                job: Some(job_id.to_string()),
                kind: Some(kind),
            },
            PolicyKey {
                job: Some(job_id.to_string()),
                kind: None,
            },
            PolicyKey {
                job: None,
                kind: Some(kind),
            },
            PolicyKey {
                job: None,
                kind: None,
            },
        ];
        candidates
            .iter()
            .find_map(|key| policies.get(key).copied())
            .unwrap_or_else(|| *self.default_policy.read())
    }

    /// Observe outcomes of one error kind.
    pub fn on_kind(&self, kind: ErrorKind, handler: impl OutcomeHandler + 'static) {
        self.handlers.write().push(RegisteredHandler {
            kind: Some(kind),
            handler: Arc::new(handler),
        });
    }

    /// Observe every outcome.
    pub fn on_any(&self, handler: impl OutcomeHandler + 'static) {
        self.handlers.write().push(RegisteredHandler {
            kind: None,
            handler: Arc::new(handler),
        });
    }

    pub(crate) fn add_handler(&self, kind: Option<ErrorKind>, handler: Arc<dyn OutcomeHandler>) {
        self.handlers.write().push(RegisteredHandler { kind, handler });
    }

    /// Hand an outcome to the matching observers without waiting for them.
    pub fn notify(&self, job_id: &str, outcome: &JobOutcome) {
        let kind = outcome.kind();
        let matching: Vec<Arc<dyn OutcomeHandler>> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.kind.is_none() || h.kind == kind)
            .map(|h| h.handler.clone())
            .collect();

        for handler in matching {
            let job_id = job_id.to_string();
            let outcome = outcome.clone();
            let limit = self.notify_timeout;
            self.tracker.spawn(async move {
                let call = AssertUnwindSafe(handler.on_outcome(&job_id, &outcome)).catch_unwind();
                match tokio::time::timeout(limit, call).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => {
                        warn!("Outcome handler for job {} failed: {}", job_id, e);
                    }
                    Ok(Err(_)) => {
                        error!("Outcome handler for job {} panicked", job_id);
                    }
                    Err(_) => {
                        warn!(
                            "Outcome handler for job {} timed out after {:?}",
                            job_id, limit
                        );
                    }
                }
            });
        }
    }

    /// Decide what happens after `outcome`.
    pub fn settle(&self, job_id: &str, outcome: &JobOutcome, has_sink: bool) -> Settlement {
        let (Some(kind), Some(attempt)) = (outcome.kind(), outcome.attempt()) else {
            return Settlement::Ack;
        };

        let policy = self.policy_for(job_id, kind);
        let settlement = if attempt <= policy.max_retries {
            Settlement::Requeue {
                delay: policy.backoff.delay_for(attempt),
            }
        } else if policy.dead_letter && has_sink {
            Settlement::DeadLetter
        } else {
            Settlement::Discard
        };
        debug!(
            job = job_id,
            attempt,
            kind = %kind,
            "Settled as {:?}",
            settlement
        );
        settlement
    }

    /// Wait for every pending notification.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn pending_notifications(&self) -> usize {
        self.tracker.len()
    }
}

impl Default for OutcomeManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
#[path = "outcome_tests.rs"]
mod tests;
