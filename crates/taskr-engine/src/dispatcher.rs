//! Dispatcher: the single entry point for running a job once.
//!
//! Both the cron scheduler and the consumer pool call [`Dispatcher::dispatch`].
//! It never retries; the caller settles the returned outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{AbortHandle, JoinError};
use tracing::{Instrument, debug, info_span, warn};

use crate::handler::JobContext;
use crate::job::JobDefinition;
use crate::metrics::EngineMetrics;
use crate::outcome::{ErrorKind, JobOutcome, OutcomeManager};

/// Runs job handlers with a timeout and reports each outcome once.
pub struct Dispatcher {
    outcomes: Arc<OutcomeManager>,
    metrics: Arc<EngineMetrics>,
    default_timeout: Duration,
}

/// Aborts the handler task if the dispatch itself is dropped mid-flight.
struct AbortOnDrop(Option<AbortHandle>);

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Dispatcher {
    pub fn new(
        outcomes: Arc<OutcomeManager>,
        metrics: Arc<EngineMetrics>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            outcomes,
            metrics,
            default_timeout,
        }
    }

    pub fn outcomes(&self) -> &Arc<OutcomeManager> {
        &self.outcomes
    }

    /// Run `job` once with `ctx`.
    ///
    /// The handler runs on its own task, so a panic surfaces as a fault.
    /// On timeout the context's token is cancelled and the handler task is
    /// left to wind down on its own.
    pub async fn dispatch(&self, job: &JobDefinition, ctx: JobContext) -> JobOutcome {
        let timeout = job.timeout.unwrap_or(self.default_timeout);
        let attempt = ctx.attempt;
        let cancel = ctx.cancel.clone();
        let handler = job.handler.clone();
        let span = info_span!("dispatch", job = %job.id, attempt);

        self.metrics.record_dispatch();
        let task = tokio::spawn(async move { handler.handle(ctx).await }.instrument(span.clone()));
        let mut guard = AbortOnDrop(Some(task.abort_handle()));

        let outcome = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => JobOutcome::Success,
            Ok(Ok(Err(e))) => JobOutcome::failure(&e, attempt),
            Ok(Err(join_err)) => JobOutcome::Failure {
                kind: ErrorKind::Fault,
                attempt,
                message: join_failure(join_err),
            },
            Err(_) => {
                cancel.cancel();
                guard.disarm();
                JobOutcome::Timeout { attempt }
            }
        };

        span.in_scope(|| match &outcome {
            JobOutcome::Success => {
                self.metrics.record_success();
                debug!("Job completed");
            }
            JobOutcome::Failure { .. } => {
                self.metrics.record_failure();
                warn!("Job failed: {}", outcome);
            }
            JobOutcome::Timeout { .. } => {
                self.metrics.record_timeout();
                warn!("Job timed out after {:?}", timeout);
            }
        });

        self.outcomes.notify(&job.id, &outcome);
        outcome
    }
}

fn join_failure(err: JoinError) -> String {
    if err.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    let panic = err.into_panic();
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
