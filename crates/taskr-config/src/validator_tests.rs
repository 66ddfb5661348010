use super::*;
use crate::loader::ConfigLoader;

fn load(content: &str) -> Config {
    ConfigLoader::load_str(content).unwrap()
}

#[test]
fn test_validate_default_config() {
    let config = Config::default();
    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.is_valid());
}

#[test]
fn test_validate_zero_workers() {
    let mut config = Config::default();
    config.engine.worker_count = 0;

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(!result.is_valid());
    assert!(result.errors.iter().any(|e| e.path == "engine.worker_count"));
}

#[test]
fn test_validate_cron_needs_exactly_one_schedule() {
    let config = load(
        r#"
            [[cron]]
            id = "both"
            schedule = "* * * * *"
            interval_secs = 60
            command = "true"

            [[cron]]
            id = "neither"
            command = "true"
        "#,
    );

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "cron[0]"));
    assert!(result.errors.iter().any(|e| e.path == "cron[1]"));
}

#[test]
fn test_validate_duplicate_ids_across_kinds() {
    let config = load(
        r#"
            [broker]
            spool_dir = "/tmp/spool"

            [[cron]]
            id = "sync"
            interval_secs = 10
            command = "true"

            [[queue]]
            id = "sync"
            queue = "events"
            command = "true"
        "#,
    );

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "queue[0].id"));
}

#[test]
fn test_validate_queue_without_broker() {
    let config = load(
        r#"
            [[queue]]
            id = "mail"
            queue = "outbox"
            command = "true"
        "#,
    );

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "broker.spool_dir"));
}

#[test]
fn test_validate_queue_binding_fields() {
    let config = load(
        r#"
            [broker]
            spool_dir = "/tmp/spool"

            [[queue]]
            id = "mail"
            queue = ""
            concurrency = 0
            command = "true"
        "#,
    );

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "queue[0].queue"));
    assert!(result.errors.iter().any(|e| e.path == "queue[0].concurrency"));
}

#[test]
fn test_validate_unknown_policy_kind() {
    let config = load(
        r#"
            [[policy]]
            kind = "network"
        "#,
    );

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.errors.iter().any(|e| e.path == "policy[0].kind"));
}

#[test]
fn test_validate_policy_dead_letter_without_sink_warns() {
    let config = load(
        r#"
            [[policy]]
            max_retries = 2
            dead_letter = true
        "#,
    );

    let result = ConfigValidator::validate(&config).unwrap();
    assert!(result.is_valid());
    assert!(result.warnings.iter().any(|w| w.path == "policy[0].dead_letter"));
}

#[test]
fn test_into_result_returns_first_error() {
    let mut config = Config::default();
    config.engine.worker_count = 0;

    let result = ConfigValidator::validate(&config).unwrap();
    let err = result.into_result().unwrap_err();
    assert!(err.to_string().contains("engine.worker_count"));
}
