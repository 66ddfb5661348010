//! Engine configuration.
//!
//! [`EngineConfig`] is the static, typed settings structure the engine runs
//! with. [`EngineConfig::from_config`] is the explicit step that applies a
//! loaded `taskr_config::Config` onto it.

use std::time::Duration;

use taskr_config::{BackoffKind, Config, RetrySection};

use crate::error::ConfigurationError;
use crate::outcome::{Backoff, ErrorKind, RetryPolicy};

/// Retry policy scoped to a job and/or error kind.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub job: Option<String>,
    pub kind: Option<ErrorKind>,
    pub policy: RetryPolicy,
}

/// Settings fixed for the lifetime of one running engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Worker slots per queue when a binding does not set its own.
    pub worker_count: u32,

    pub default_timeout: Duration,

    /// How long `stop` waits for in-flight dispatches.
    pub grace_timeout: Duration,

    /// Upper bound for one outcome handler call.
    pub notify_timeout: Duration,

    pub default_policy: RetryPolicy,

    pub policies: Vec<PolicyRule>,

    /// Delay schedule between failed broker receives.
    pub reconnect_backoff: Backoff,

    /// Consecutive receive failures tolerated before a broker fault.
    pub max_reconnect_attempts: u32,

    /// Longest the scheduler sleeps without re-checking the clock.
    pub scheduler_max_sleep: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            default_timeout: Duration::from_secs(30),
            grace_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(5),
            default_policy: RetryPolicy::none(),
            policies: Vec::new(),
            reconnect_backoff: Backoff::Exponential {
                first: Duration::from_millis(500),
                factor: 2.0,
                max: Duration::from_secs(30),
            },
            max_reconnect_attempts: 10,
            scheduler_max_sleep: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Apply a loaded configuration file.
    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        let mut policies = Vec::with_capacity(config.policy.len());
        for rule in &config.policy {
            let kind = rule
                .kind
                .as_deref()
                .map(str::parse::<ErrorKind>)
                .transpose()
                .map_err(ConfigurationError::Invalid)?;
            policies.push(PolicyRule {
                job: rule.job.clone(),
                kind,
                policy: RetryPolicy::from(&rule.retry),
            });
        }

        let broker = &config.broker;
        let engine_config = Self {
            worker_count: config.engine.worker_count,
            default_timeout: Duration::from_millis(config.engine.default_timeout_ms),
            grace_timeout: Duration::from_millis(config.engine.grace_timeout_ms),
            notify_timeout: Duration::from_millis(config.engine.notify_timeout_ms),
            default_policy: RetryPolicy::from(&config.retry),
            policies,
            reconnect_backoff: Backoff::Exponential {
                first: Duration::from_millis(broker.reconnect_delay_ms),
                factor: 2.0,
                max: Duration::from_millis(broker.reconnect_max_delay_ms),
            },
            max_reconnect_attempts: broker.max_reconnect_attempts,
            ..Self::default()
        };
        engine_config.validate()?;
        Ok(engine_config)
    }

    /// Structural checks run by `Engine::start`.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.worker_count == 0 {
            return Err(ConfigurationError::InvalidPoolSize(self.worker_count));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigurationError::Invalid(
                "default timeout must be greater than zero".to_string(),
            ));
        }
        if self.scheduler_max_sleep.is_zero() {
            return Err(ConfigurationError::Invalid(
                "scheduler max sleep must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_worker_count(mut self, worker_count: u32) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_grace_timeout(mut self, timeout: Duration) -> Self {
        self.grace_timeout = timeout;
        self
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_policy(
        mut self,
        job: Option<&str>,
        kind: Option<ErrorKind>,
        policy: RetryPolicy,
    ) -> Self {
        self.policies.push(PolicyRule {
            job: job.map(str::to_string),
            kind,
            policy,
        });
        self
    }

    pub fn with_reconnect(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.reconnect_backoff = backoff;
        self.max_reconnect_attempts = max_attempts;
        self
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        let first = Duration::from_millis(section.delay_ms);
        let backoff = match section.backoff {
            BackoffKind::Fixed => Backoff::Fixed(first),
            BackoffKind::Exponential => Backoff::Exponential {
                first,
                factor: section.factor,
                max: Duration::from_millis(section.max_delay_ms),
            },
        };
        RetryPolicy {
            max_retries: section.max_retries,
            backoff,
            dead_letter: section.dead_letter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.default_policy, RetryPolicy::none());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let config = EngineConfig::default().with_worker_count(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidPoolSize(0))
        ));
    }

    #[test]
    fn test_from_config_applies_sections() {
        let config = taskr_config::ConfigLoader::load_str(
            r#"
            [engine]
            worker_count = 3
            default_timeout_ms = 2000

            [retry]
            max_retries = 2
            backoff = "exponential"
            delay_ms = 100
            max_delay_ms = 400
            dead_letter = true

            [[policy]]
            job = "mail"
            kind = "timeout"
            max_retries = 5
            "#,
        )
        .unwrap();

        let engine = EngineConfig::from_config(&config).unwrap();
        assert_eq!(engine.worker_count, 3);
        assert_eq!(engine.default_timeout, Duration::from_secs(2));
        assert_eq!(engine.default_policy.max_retries, 2);
        assert!(engine.default_policy.dead_letter);
        assert_eq!(
            engine.default_policy.backoff,
            Backoff::Exponential {
                first: Duration::from_millis(100),
                factor: 2.0,
                max: Duration::from_millis(400),
            }
        );

        assert_eq!(engine.policies.len(), 1);
        let rule = &engine.policies[0];
        assert_eq!(rule.job.as_deref(), Some("mail"));
        assert_eq!(rule.kind, Some(ErrorKind::Timeout));
        assert_eq!(rule.policy.max_retries, 5);
        assert_eq!(rule.policy.backoff, Backoff::Fixed(Duration::from_millis(1000)));
    }

    #[test]
    fn test_from_config_rejects_unknown_kind() {
        let config = taskr_config::ConfigLoader::load_str(
            r#"
            [[policy]]
            kind = "cosmic-rays"
            "#,
        )
        .unwrap();
        assert!(matches!(
            EngineConfig::from_config(&config),
            Err(ConfigurationError::Invalid(_))
        ));
    }
}
