//! The job handler capability.
//!
//! Every job runs through a single polymorphic [`JobHandler`]. Closures are
//! adapted with [`handler_fn`]; anything else implements the trait.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Context handed to a job handler for one dispatch attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Id of the job being run.
    pub job_id: String,

    /// Attempt number, starting at 1.
    pub attempt: u32,

    /// Message body for queue jobs; `None` for cron jobs.
    pub payload: Option<Bytes>,

    /// Occurrence this run stands for (cron jobs only).
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Cancelled when the dispatch times out or the engine is force-stopped.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            attempt,
            payload: None,
            scheduled_for: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Payload as UTF-8 text, if any.
    pub fn text(&self) -> Option<&str> {
        self.payload
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok())
    }

    /// Decode the payload as JSON. A missing or malformed body is a
    /// business error.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| JobError::business("job has no payload"))?;
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the dispatch has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// The one extension point external code implements.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a job handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.f)(ctx).await
    }
}
