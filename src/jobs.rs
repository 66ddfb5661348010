//! Job definitions built from the `[[cron]]` and `[[queue]]` tables.

use std::time::Duration;

use anyhow::bail;

use taskr_config::{Config, CronJobConfig, QueueJobConfig};
use taskr_engine::{JobDefinition, QueueBinding};

use crate::handlers::CommandHandler;

/// Every configured job, cron jobs first, in file order.
pub(crate) fn job_definitions(config: &Config) -> anyhow::Result<Vec<JobDefinition>> {
    let mut jobs = Vec::with_capacity(config.cron.len() + config.queue.len());
    for job in &config.cron {
        jobs.push(cron_job(job)?);
    }
    for job in &config.queue {
        jobs.push(queue_job(job));
    }
    Ok(jobs)
}

fn cron_job(job: &CronJobConfig) -> anyhow::Result<JobDefinition> {
    let handler = CommandHandler::new(&job.command, job.args.clone());
    let definition = match (&job.schedule, job.interval_secs) {
        (Some(expression), None) => JobDefinition::cron(&job.id, expression, handler),
        (None, Some(secs)) => JobDefinition::interval(&job.id, Duration::from_secs(secs), handler),
        (Some(_), Some(_)) => bail!("cron job {} sets both schedule and interval_secs", job.id),
        (None, None) => bail!("cron job {} needs a schedule or interval_secs", job.id),
    };
    Ok(with_timeout(definition, job.timeout_ms))
}

fn queue_job(job: &QueueJobConfig) -> JobDefinition {
    let mut binding = QueueBinding::new(&job.queue);
    if let Some(ref key) = job.routing_key {
        binding = binding.with_routing_key(key);
    }
    if let Some(concurrency) = job.concurrency {
        binding = binding.with_concurrency(concurrency);
    }
    let handler = CommandHandler::new(&job.command, job.args.clone());
    with_timeout(JobDefinition::queue(&job.id, binding, handler), job.timeout_ms)
}

fn with_timeout(job: JobDefinition, timeout_ms: Option<u64>) -> JobDefinition {
    match timeout_ms {
        Some(ms) => job.with_timeout(Duration::from_millis(ms)),
        None => job,
    }
}
