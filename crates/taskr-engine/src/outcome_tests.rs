use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn business(attempt: u32) -> JobOutcome {
    JobOutcome::failure(&JobError::business("bad input"), attempt)
}

#[test]
fn test_classify() {
    assert_eq!(classify(&JobError::business("x")), ErrorKind::Business);
    assert_eq!(classify(&JobError::fault("x")), ErrorKind::Fault);
    assert_eq!(JobOutcome::Timeout { attempt: 1 }.kind(), Some(ErrorKind::Timeout));
    assert_eq!(JobOutcome::Success.kind(), None);
}

#[test]
fn test_error_kind_parse() {
    assert_eq!("Business".parse::<ErrorKind>().unwrap(), ErrorKind::Business);
    assert_eq!("timeout".parse::<ErrorKind>().unwrap(), ErrorKind::Timeout);
    assert!("other".parse::<ErrorKind>().is_err());
}

#[test]
fn test_exponential_backoff() {
    let backoff = Backoff::Exponential {
        first: Duration::from_millis(100),
        factor: 2.0,
        max: Duration::from_secs(1),
    };
    assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
    assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
    assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
    assert_eq!(backoff.delay_for(5), Duration::from_secs(1));
    assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(1));
}

#[test]
fn test_default_policy_is_log_only() {
    let manager = OutcomeManager::default();
    assert_eq!(manager.policy_for("any", ErrorKind::Fault), RetryPolicy::none());
    assert_eq!(manager.settle("any", &business(1), true), Settlement::Discard);
    assert_eq!(manager.settle("any", &JobOutcome::Success, true), Settlement::Ack);
}

#[test]
fn test_policy_lookup_order() {
    let manager = OutcomeManager::default();
    let default = RetryPolicy::fixed(1, Duration::from_millis(1));
    let by_kind = RetryPolicy::fixed(2, Duration::from_millis(2));
    let by_job = RetryPolicy::fixed(3, Duration::from_millis(3));
    let exact = RetryPolicy::fixed(4, Duration::from_millis(4));

    manager.set_default_policy(default);
    assert_eq!(manager.policy_for("mail", ErrorKind::Business), default);

    manager.set_policy(None, Some(ErrorKind::Business), by_kind);
    assert_eq!(manager.policy_for("mail", ErrorKind::Business), by_kind);
    assert_eq!(manager.policy_for("mail", ErrorKind::Fault), default);

    manager.set_policy(Some("mail"), None, by_job);
    assert_eq!(manager.policy_for("mail", ErrorKind::Business), by_job);
    assert_eq!(manager.policy_for("mail", ErrorKind::Fault), by_job);
    assert_eq!(manager.policy_for("other", ErrorKind::Business), by_kind);

    manager.set_policy(Some("mail"), Some(ErrorKind::Business), exact);
    assert_eq!(manager.policy_for("mail", ErrorKind::Business), exact);
    assert_eq!(manager.policy_for("mail", ErrorKind::Timeout), by_job);
}

#[test]
fn test_retry_budget_of_two_then_dead_letter() {
    let manager = OutcomeManager::default();
    manager.set_policy(
        Some("orders"),
        None,
        RetryPolicy::fixed(2, Duration::from_millis(10)).with_dead_letter(),
    );

    let delay = Duration::from_millis(10);
    assert_eq!(
        manager.settle("orders", &business(1), true),
        Settlement::Requeue { delay }
    );
    assert_eq!(
        manager.settle("orders", &business(2), true),
        Settlement::Requeue { delay }
    );
    assert_eq!(manager.settle("orders", &business(3), true), Settlement::DeadLetter);

    // No sink attached: the exhausted job is dropped instead.
    assert_eq!(manager.settle("orders", &business(3), false), Settlement::Discard);
}

#[test]
fn test_timeout_uses_timeout_policy() {
    let manager = OutcomeManager::default();
    manager.set_policy(None, Some(ErrorKind::Timeout), RetryPolicy::fixed(1, Duration::ZERO));

    let timeout = JobOutcome::Timeout { attempt: 1 };
    assert_eq!(
        manager.settle("slow", &timeout, false),
        Settlement::Requeue {
            delay: Duration::ZERO
        }
    );
    assert_eq!(manager.settle("slow", &business(1), false), Settlement::Discard);
}

#[tokio::test]
async fn test_notify_filters_by_kind() {
    let manager = OutcomeManager::default();
    let all = Arc::new(AtomicUsize::new(0));
    let faults = Arc::new(AtomicUsize::new(0));

    let counter = all.clone();
    manager.on_any(outcome_fn(move |_job: &str, _outcome: &JobOutcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let counter = faults.clone();
    manager.on_kind(
        ErrorKind::Fault,
        outcome_fn(move |_job: &str, _outcome: &JobOutcome| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    manager.notify("job", &JobOutcome::Success);
    manager.notify("job", &business(1));
    manager.notify("job", &JobOutcome::failure(&JobError::fault("boom"), 1));
    manager.flush().await;

    assert_eq!(all.load(Ordering::SeqCst), 3);
    assert_eq!(faults.load(Ordering::SeqCst), 1);
}

struct Panicking;

#[async_trait]
impl OutcomeHandler for Panicking {
    async fn on_outcome(&self, _job_id: &str, _outcome: &JobOutcome) -> Result<(), BoxError> {
        panic!("observer bug");
    }
}

struct Stuck;

#[async_trait]
impl OutcomeHandler for Stuck {
    async fn on_outcome(&self, _job_id: &str, _outcome: &JobOutcome) -> Result<(), BoxError> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_handlers_are_swallowed() {
    let manager = OutcomeManager::new(Duration::from_millis(50));
    let reached = Arc::new(AtomicUsize::new(0));

    manager.on_any(outcome_fn(|_job: &str, _outcome: &JobOutcome| {
        Err("observer down".into())
    }));
    manager.on_any(Panicking);
    manager.on_any(Stuck);
    let counter = reached.clone();
    manager.on_any(outcome_fn(move |_job: &str, _outcome: &JobOutcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    manager.notify("job", &JobOutcome::Success);
    manager.flush().await;

    assert_eq!(reached.load(Ordering::SeqCst), 1);
    assert_eq!(manager.pending_notifications(), 0);

    // Still usable after the failures.
    manager.notify("job", &JobOutcome::Success);
    manager.flush().await;
    assert_eq!(reached.load(Ordering::SeqCst), 2);
}
