//! Configuration validation.

use std::collections::HashSet;

use crate::error::ConfigError;
use crate::schema::{Config, RetrySection};

/// Error kinds a `[[policy]]` table may name.
const ERROR_KINDS: [&str; 3] = ["business", "fault", "timeout"];

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Convert into the first error, if any.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(e) => Err(ConfigError::InvalidValue {
                field: e.path,
                message: e.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_engine(config, &mut result);
        Self::validate_retry("retry", &config.retry, &mut result);
        Self::validate_broker(config, &mut result);
        Self::validate_jobs(config, &mut result);
        Self::validate_policies(config, &mut result);

        Ok(result)
    }

    fn validate_engine(config: &Config, result: &mut ValidationResult) {
        if config.engine.worker_count == 0 {
            result.add_error(ValidationError::new(
                "engine.worker_count",
                "worker_count must be at least 1",
            ));
        }

        if config.engine.default_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "engine.default_timeout_ms",
                "default_timeout_ms must be greater than 0",
            ));
        }

        if config.engine.grace_timeout_ms == 0 {
            result.add_warning(ValidationWarning::new(
                "engine.grace_timeout_ms",
                "grace_timeout_ms is 0, in-flight work will be aborted immediately on stop",
            ));
        }
    }

    fn validate_retry(path: &str, retry: &RetrySection, result: &mut ValidationResult) {
        if retry.factor < 1.0 {
            result.add_warning(ValidationWarning::new(
                format!("{}.factor", path),
                "factor below 1.0 makes exponential delays shrink",
            ));
        }

        if retry.delay_ms > retry.max_delay_ms {
            result.add_warning(ValidationWarning::new(
                format!("{}.delay_ms", path),
                "delay_ms exceeds max_delay_ms and will be capped",
            ));
        }
    }

    fn validate_broker(config: &Config, result: &mut ValidationResult) {
        if !config.queue.is_empty() && config.broker.spool_dir.is_none() {
            result.add_error(ValidationError::new(
                "broker.spool_dir",
                "queue jobs are configured but no broker is set",
            ));
        }

        if config.broker.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "broker.poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        }

        if config.broker.max_reconnect_attempts == 0 {
            result.add_warning(ValidationWarning::new(
                "broker.max_reconnect_attempts",
                "max_reconnect_attempts is 0, the first receive error is fatal",
            ));
        }
    }

    fn validate_jobs(config: &Config, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, job) in config.cron.iter().enumerate() {
            let path = format!("cron[{}]", i);
            Self::validate_job_id(&path, &job.id, &mut seen, result);

            match (&job.schedule, job.interval_secs) {
                (Some(_), Some(_)) => result.add_error(ValidationError::new(
                    &path,
                    "set either schedule or interval_secs, not both",
                )),
                (None, None) => result.add_error(ValidationError::new(
                    &path,
                    "one of schedule or interval_secs is required",
                )),
                (None, Some(0)) => result.add_error(ValidationError::new(
                    format!("{}.interval_secs", path),
                    "interval_secs must be greater than 0",
                )),
                _ => {}
            }

            if job.command.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{}.command", path),
                    "command cannot be empty",
                ));
            }
        }

        for (i, job) in config.queue.iter().enumerate() {
            let path = format!("queue[{}]", i);
            Self::validate_job_id(&path, &job.id, &mut seen, result);

            if job.queue.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{}.queue", path),
                    "queue name cannot be empty",
                ));
            }

            if job.concurrency == Some(0) {
                result.add_error(ValidationError::new(
                    format!("{}.concurrency", path),
                    "concurrency must be at least 1",
                ));
            }

            if job.command.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{}.command", path),
                    "command cannot be empty",
                ));
            }
        }
    }

    fn validate_job_id(
        path: &str,
        id: &str,
        seen: &mut HashSet<String>,
        result: &mut ValidationResult,
    ) {
        if id.trim().is_empty() {
            result.add_error(ValidationError::new(
                format!("{}.id", path),
                "job id cannot be empty",
            ));
        } else if !seen.insert(id.to_string()) {
            result.add_error(ValidationError::new(
                format!("{}.id", path),
                format!("duplicate job id '{}'", id),
            ));
        }
    }

    fn validate_policies(config: &Config, result: &mut ValidationResult) {
        let ids: HashSet<&str> = config
            .cron
            .iter()
            .map(|j| j.id.as_str())
            .chain(config.queue.iter().map(|j| j.id.as_str()))
            .collect();

        for (i, policy) in config.policy.iter().enumerate() {
            let path = format!("policy[{}]", i);

            if let Some(ref kind) = policy.kind {
                if !ERROR_KINDS.contains(&kind.as_str()) {
                    result.add_error(ValidationError::new(
                        format!("{}.kind", path),
                        format!("unknown error kind '{}', valid values: {:?}", kind, ERROR_KINDS),
                    ));
                }
            }

            if let Some(ref job) = policy.job {
                if !ids.contains(job.as_str()) {
                    result.add_warning(ValidationWarning::new(
                        format!("{}.job", path),
                        format!("policy refers to unknown job '{}'", job),
                    ));
                }
            }

            if policy.retry.dead_letter && !config.dead_letter.enabled {
                result.add_warning(ValidationWarning::new(
                    format!("{}.dead_letter", path),
                    "dead_letter requested but no dead-letter sink is enabled",
                ));
            }

            Self::validate_retry(&path, &policy.retry, result);
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
