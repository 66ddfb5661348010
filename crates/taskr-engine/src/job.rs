//! Job definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::JobHandler;
use crate::schedule::Schedule;

/// How a cron job's schedule is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    /// 5-field (or 6-field with seconds) cron expression.
    Expression(String),
    /// Fixed interval between runs.
    Interval(Duration),
}

/// Where a queue job receives its messages from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,

    /// Restrict the binding to messages with this routing key.
    pub routing_key: Option<String>,

    /// Worker slots for the queue; the engine default when unset.
    pub concurrency: Option<u32>,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            routing_key: None,
            concurrency: None,
        }
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Whether a message from `queue` with `routing_key` is meant for this binding.
    pub fn matches(&self, queue: &str, routing_key: Option<&str>) -> bool {
        if self.queue != queue {
            return false;
        }
        match &self.routing_key {
            None => true,
            Some(key) => routing_key == Some(key.as_str()),
        }
    }
}

/// What makes a job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Cron(ScheduleSpec),
    Queue(QueueBinding),
}

/// A registered unit of work.
#[derive(Clone)]
pub struct JobDefinition {
    pub id: String,
    pub trigger: Trigger,
    pub handler: Arc<dyn JobHandler>,

    /// Per-job dispatch timeout; the engine default when unset.
    pub timeout: Option<Duration>,

    /// Compiled schedule, filled in by the registry for cron jobs.
    pub(crate) schedule: Option<Schedule>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, trigger: Trigger, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            id: id.into(),
            trigger,
            handler,
            timeout: None,
            schedule: None,
        }
    }

    /// Cron job driven by a cron expression.
    pub fn cron(
        id: impl Into<String>,
        expression: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Self {
        Self::new(
            id,
            Trigger::Cron(ScheduleSpec::Expression(expression.into())),
            Arc::new(handler),
        )
    }

    /// Cron job driven by a fixed interval.
    pub fn interval(
        id: impl Into<String>,
        every: Duration,
        handler: impl JobHandler + 'static,
    ) -> Self {
        Self::new(
            id,
            Trigger::Cron(ScheduleSpec::Interval(every)),
            Arc::new(handler),
        )
    }

    /// Queue job bound to one source.
    pub fn queue(
        id: impl Into<String>,
        binding: QueueBinding,
        handler: impl JobHandler + 'static,
    ) -> Self {
        Self::new(id, Trigger::Queue(binding), Arc::new(handler))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_cron(&self) -> bool {
        matches!(self.trigger, Trigger::Cron(_))
    }

    pub fn binding(&self) -> Option<&QueueBinding> {
        match &self.trigger {
            Trigger::Queue(binding) => Some(binding),
            Trigger::Cron(_) => None,
        }
    }

    /// Compiled schedule (cron jobs, once registered).
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
