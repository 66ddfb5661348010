//! `taskr check` and `taskr jobs`.

use anyhow::bail;
use serde::Serialize;
use tracing::{error, warn};

use taskr_config::{Config, ConfigValidator};

use crate::cmd_run::build_engine;

/// Validate the file and the job definitions it produces.
pub(crate) fn check(config: &Config) -> anyhow::Result<()> {
    let result = ConfigValidator::validate(config)?;
    for warning in &result.warnings {
        warn!("{}: {}", warning.path, warning.message);
    }
    if !result.is_valid() {
        for e in &result.errors {
            error!("{}: {}", e.path, e.message);
        }
        bail!("{} configuration error(s)", result.errors.len());
    }

    // Compiles every schedule and binding the same way `run` does.
    let engine = build_engine(config)?;
    println!(
        "Configuration OK: {} job(s), {} warning(s)",
        engine.registry().len(),
        result.warnings.len()
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct JobRow {
    id: String,
    kind: &'static str,
    trigger: String,
    command: String,
}

fn job_rows(config: &Config) -> Vec<JobRow> {
    let cron = config.cron.iter().map(|job| JobRow {
        id: job.id.clone(),
        kind: "cron",
        trigger: match (&job.schedule, job.interval_secs) {
            (Some(expression), _) => expression.clone(),
            (None, Some(secs)) => format!("every {}s", secs),
            (None, None) => "-".to_string(),
        },
        command: command_line(&job.command, &job.args),
    });
    let queue = config.queue.iter().map(|job| {
        let mut trigger = job.queue.clone();
        if let Some(ref key) = job.routing_key {
            trigger.push_str(&format!(" [{}]", key));
        }
        if let Some(concurrency) = job.concurrency {
            trigger.push_str(&format!(" x{}", concurrency));
        }
        JobRow {
            id: job.id.clone(),
            kind: "queue",
            trigger,
            command: command_line(&job.command, &job.args),
        }
    });
    cron.chain(queue).collect()
}

fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Print the configured jobs.
pub(crate) fn list_jobs(config: &Config, json: bool) -> anyhow::Result<()> {
    let rows = job_rows(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No jobs configured");
        return Ok(());
    }
    let id_width = rows.iter().map(|r| r.id.len()).max().unwrap_or(2).max(2);
    let trigger_width = rows.iter().map(|r| r.trigger.len()).max().unwrap_or(7).max(7);
    println!(
        "{:<id_width$}  {:<5}  {:<trigger_width$}  COMMAND",
        "ID", "KIND", "TRIGGER"
    );
    for row in rows {
        println!(
            "{:<id_width$}  {:<5}  {:<trigger_width$}  {}",
            row.id, row.kind, row.trigger, row.command
        );
    }
    Ok(())
}
