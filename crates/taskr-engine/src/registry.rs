//! Job registry.
//!
//! Holds every job definition keyed by id. Reads are lock-free for the
//! scheduler and all pool workers; registration validates its input and
//! inserts with a single check-and-set.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::RegistrationError;
use crate::job::{JobDefinition, QueueBinding, Trigger};
use crate::schedule::Schedule;

/// Registry of job definitions owned by one engine.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a job.
    ///
    /// Nothing is stored when an error is returned.
    pub fn register(&self, mut job: JobDefinition) -> Result<Arc<JobDefinition>, RegistrationError> {
        if job.id.trim().is_empty() {
            return Err(RegistrationError::EmptyIdentifier);
        }

        match &job.trigger {
            Trigger::Cron(spec) => {
                let schedule = Schedule::from_spec(spec).map_err(|e| {
                    RegistrationError::InvalidSchedule {
                        id: job.id.clone(),
                        reason: e.to_string(),
                    }
                })?;
                job.schedule = Some(schedule);
            }
            Trigger::Queue(binding) => {
                if binding.queue.trim().is_empty() {
                    return Err(RegistrationError::MissingBinding(job.id.clone()));
                }
                if binding.concurrency == Some(0) {
                    return Err(RegistrationError::InvalidConcurrency(job.id.clone()));
                }
            }
        }

        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(RegistrationError::DuplicateIdentifier(job.id)),
            Entry::Vacant(slot) => {
                debug!("Registered job {}", job.id);
                let job = Arc::new(job);
                slot.insert(job.clone());
                Ok(job)
            }
        }
    }

    /// Remove a job. `NotFound` is informational.
    pub fn unregister(&self, id: &str) -> Result<Arc<JobDefinition>, RegistrationError> {
        self.jobs
            .remove(id)
            .map(|(_, job)| {
                debug!("Unregistered job {}", id);
                job
            })
            .ok_or_else(|| RegistrationError::NotFound(id.to_string()))
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(id).map(|job| job.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Every cron job, sorted by id.
    pub fn cron_jobs(&self) -> Vec<Arc<JobDefinition>> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|e| e.value().is_cron())
            .map(|e| e.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Distinct queue names with the number of worker slots each needs:
    /// the largest concurrency among its bindings, or `default_workers`.
    pub fn queue_bindings(&self, default_workers: u32) -> Vec<(String, u32)> {
        let mut queues: BTreeMap<String, Option<u32>> = BTreeMap::new();
        for entry in self.jobs.iter() {
            if let Some(binding) = entry.value().binding() {
                let slot = queues.entry(binding.queue.clone()).or_insert(None);
                if let Some(c) = binding.concurrency {
                    *slot = Some(slot.map_or(c, |current| current.max(c)));
                }
            }
        }
        queues
            .into_iter()
            .map(|(queue, workers)| (queue, workers.unwrap_or(default_workers).max(1)))
            .collect()
    }

    /// Find the job a message belongs to. An exact routing-key binding wins
    /// over a catch-all binding on the same queue; ties go to the smallest id.
    pub fn resolve_binding(
        &self,
        queue: &str,
        routing_key: Option<&str>,
    ) -> Option<Arc<JobDefinition>> {
        let mut exact: Option<Arc<JobDefinition>> = None;
        let mut fallback: Option<Arc<JobDefinition>> = None;

        for entry in self.jobs.iter() {
            let job = entry.value();
            let Some(binding) = job.binding() else {
                continue;
            };
            if !binding.matches(queue, routing_key) {
                continue;
            }
            let target = if binding.routing_key.is_some() {
                &mut exact
            } else {
                &mut fallback
            };
            if target.as_ref().is_none_or(|current| job.id < current.id) {
                *target = Some(job.clone());
            }
        }

        exact.or(fallback)
    }

    /// Bindings registered on `queue`.
    pub fn bindings_for(&self, queue: &str) -> Vec<QueueBinding> {
        self.jobs
            .iter()
            .filter_map(|e| e.value().binding().cloned())
            .filter(|b| b.queue == queue)
            .collect()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
