//! Configuration loader.

use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::ConfigError;
use crate::schema::Config;

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.taskr/spool`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BackoffKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.engine.worker_count, 1);
        assert!(config.cron.is_empty());
        assert!(config.queue.is_empty());
    }

    #[test]
    fn test_load_engine_section() {
        let content = r#"
            [engine]
            worker_count = 4
            default_timeout_ms = 2500
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.engine.worker_count, 4);
        assert_eq!(config.engine.default_timeout_ms, 2500);
        assert_eq!(config.engine.grace_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_jobs() {
        let content = r#"
            [[cron]]
            id = "cleanup"
            schedule = "*/5 * * * *"
            command = "rm"
            args = ["-rf", "/tmp/scratch"]

            [[cron]]
            id = "heartbeat"
            interval_secs = 30
            command = "true"

            [[queue]]
            id = "thumbnails"
            queue = "images"
            routing_key = "resize"
            concurrency = 2
            command = "./resize.sh"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.cron.len(), 2);
        assert_eq!(config.cron[0].schedule.as_deref(), Some("*/5 * * * *"));
        assert_eq!(config.cron[1].interval_secs, Some(30));
        assert_eq!(config.queue.len(), 1);
        assert_eq!(config.queue[0].routing_key.as_deref(), Some("resize"));
        assert_eq!(config.queue[0].concurrency, Some(2));
    }

    #[test]
    fn test_single_queue_table_is_rejected() {
        // A bare [queue] table is not accepted: bindings are always a list.
        let content = r#"
            [queue]
            id = "a"
            queue = "a"
            command = "true"
        "#;
        assert!(ConfigLoader::load_str(content).is_err());
    }

    #[test]
    fn test_load_policies() {
        let content = r#"
            [[policy]]
            job = "thumbnails"
            kind = "business"
            max_retries = 2
            backoff = "exponential"
            delay_ms = 100
            dead_letter = true
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        let policy = &config.policy[0];
        assert_eq!(policy.job.as_deref(), Some("thumbnails"));
        assert_eq!(policy.retry.max_retries, 2);
        assert_eq!(policy.retry.backoff, BackoffKind::Exponential);
        assert!(policy.retry.dead_letter);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[engine]").unwrap();
        writeln!(file, "worker_count = 3").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.engine.worker_count, 3);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/path/taskr.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: test-only variable with a unique name
        unsafe {
            std::env::set_var("TASKR_TEST_SPOOL", "/var/spool/taskr");
        }
        let content = "[broker]\nspool_dir = \"${TASKR_TEST_SPOOL}\"";
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.broker.spool_dir.as_deref(), Some("/var/spool/taskr"));
        unsafe {
            std::env::remove_var("TASKR_TEST_SPOOL");
        }
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${TASKR_NONEXISTENT_VAR_98765}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let expanded = ConfigLoader::expand_path("~/spool");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("/spool"));
    }

    #[test]
    fn test_expand_path_no_tilde() {
        assert_eq!(ConfigLoader::expand_path("/srv/spool"), "/srv/spool");
    }
}
