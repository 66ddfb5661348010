//! Engine lifecycle events and listeners.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

use crate::outcome::BoxError;

/// Something that happened to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    BeforeStart,
    Started,
    WorkerStarted { worker: Uuid, queue: String },
    WorkerStopped { worker: Uuid, queue: String },
    BeforeStop,
    Stopped,
    Reloaded { only_workers: bool },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::BeforeStart => "before_start",
            EngineEvent::Started => "started",
            EngineEvent::WorkerStarted { .. } => "worker_started",
            EngineEvent::WorkerStopped { .. } => "worker_stopped",
            EngineEvent::BeforeStop => "before_stop",
            EngineEvent::Stopped => "stopped",
            EngineEvent::Reloaded { .. } => "reloaded",
        }
    }
}

/// Receives engine events.
#[async_trait]
pub trait EngineListener: Send + Sync {
    async fn on_event(&self, event: &EngineEvent) -> Result<(), BoxError>;
}

/// Adapter turning a closure into an [`EngineListener`].
pub struct FnListener<F>(F);

pub fn listener_fn<F>(f: F) -> FnListener<F>
where
    F: Fn(&EngineEvent) -> Result<(), BoxError> + Send + Sync + 'static,
{
    FnListener(f)
}

#[async_trait]
impl<F> EngineListener for FnListener<F>
where
    F: Fn(&EngineEvent) -> Result<(), BoxError> + Send + Sync + 'static,
{
    async fn on_event(&self, event: &EngineEvent) -> Result<(), BoxError> {
        (self.0)(event)
    }
}

/// Listeners registered on one engine.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn EngineListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn EngineListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver an event to every listener in registration order.
    pub async fn emit(&self, event: EngineEvent) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            match AssertUnwindSafe(listener.on_event(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener failed on {}: {}", event.name(), e),
                Err(_) => error!("Listener panicked on {}", event.name()),
            }
        }
    }
}
