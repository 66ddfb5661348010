use super::*;
use crate::broker::{DeadLetterSink, MessageBroker};
use crate::dispatcher::Dispatcher;
use crate::error::JobError;
use crate::events::ListenerSet;
use crate::handler::{JobContext, handler_fn};
use crate::job::{JobDefinition, QueueBinding};
use crate::memory_broker::{MemoryBroker, MemoryDeadLetterSink};
use crate::metrics::EngineMetrics;
use crate::outcome::{Backoff, OutcomeManager, RetryPolicy};
use crate::registry::JobRegistry;
use crate::worker::FaultState;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Harness {
    registry: Arc<JobRegistry>,
    broker: Arc<MemoryBroker>,
    sink: Arc<MemoryDeadLetterSink>,
    outcomes: Arc<OutcomeManager>,
    fault: Arc<FaultState>,
    ctx: Arc<WorkerContext>,
}

fn harness(with_sink: bool) -> Harness {
    let registry = Arc::new(JobRegistry::new());
    let broker = Arc::new(MemoryBroker::new());
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let outcomes = Arc::new(OutcomeManager::default());
    let metrics = Arc::new(EngineMetrics::new());
    let fault = Arc::new(FaultState::new());
    let dead_letter: Option<Arc<dyn DeadLetterSink>> = if with_sink {
        Some(sink.clone())
    } else {
        None
    };
    let ctx = Arc::new(WorkerContext {
        registry: registry.clone(),
        dispatcher: Arc::new(Dispatcher::new(
            outcomes.clone(),
            metrics.clone(),
            Duration::from_secs(5),
        )),
        broker: broker.clone() as Arc<dyn MessageBroker>,
        dead_letter,
        metrics,
        listeners: Arc::new(ListenerSet::new()),
        fault: fault.clone(),
        reconnect_backoff: Backoff::Fixed(Duration::from_millis(5)),
        max_reconnect_attempts: 3,
    });
    Harness {
        registry,
        broker,
        sink,
        outcomes,
        fault,
        ctx,
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn counting_handler(
    counter: Arc<AtomicUsize>,
    work: Duration,
) -> impl crate::handler::JobHandler + 'static {
    handler_fn(move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_each_slot_holds_at_most_one_delivery() {
    let h = harness(false);
    let handled = Arc::new(AtomicUsize::new(0));
    h.registry
        .register(JobDefinition::queue(
            "work",
            QueueBinding::new("work").with_concurrency(3),
            counting_handler(handled.clone(), Duration::from_millis(15)),
        ))
        .unwrap();
    for i in 0..30 {
        h.broker.publish("work", format!("job-{}", i));
    }

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    assert_eq!(pool.size(), 3);

    wait_until("all acks", || h.broker.acked().len() == 30).await;
    pool.stop(Duration::from_secs(1)).await;

    assert_eq!(handled.load(Ordering::SeqCst), 30);
    for slot in pool.slots() {
        assert!(slot.peak_concurrency() <= 1, "slot {} overlapped", slot.index());
        assert!(slot.in_flight().is_none());
    }
    let total: u64 = pool.slots().iter().map(|s| s.processed()).sum();
    assert_eq!(total, 30);
    assert!(h.broker.settle_counts().values().all(|&n| n == 1));
}

#[tokio::test]
async fn test_retry_budget_two_then_dead_letter() {
    let h = harness(true);
    h.outcomes.set_policy(
        Some("orders"),
        None,
        RetryPolicy::fixed(2, Duration::ZERO).with_dead_letter(),
    );
    let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = attempts.clone();
    h.registry
        .register(JobDefinition::queue(
            "orders",
            QueueBinding::new("orders"),
            handler_fn(move |ctx: JobContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(ctx.attempt);
                    Err(JobError::business("card declined"))
                }
            }),
        ))
        .unwrap();
    h.broker.publish("orders", "{\"id\":1}");

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    wait_until("dead letter", || h.sink.len() == 1).await;
    pool.stop(Duration::from_secs(1)).await;

    assert_eq!(*attempts.lock(), vec![1, 2, 3]);
    let nacks = h.broker.nacked();
    assert_eq!(nacks.len(), 3);
    assert!(nacks[0].1 && nacks[1].1, "first two attempts requeue");
    assert!(!nacks[2].1, "third attempt goes to dead letter");
    assert!(h.broker.acked().is_empty());

    let letter = &h.sink.letters()[0];
    assert_eq!(letter.job_id.as_deref(), Some("orders"));
    let message = letter.message.as_ref().unwrap();
    assert_eq!(message.delivery_count, 3);
    assert!(message.redelivered);
}

#[tokio::test]
async fn test_exhausted_without_sink_is_acked() {
    let h = harness(false);
    h.outcomes
        .set_default_policy(RetryPolicy::fixed(1, Duration::ZERO).with_dead_letter());
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    h.registry
        .register(JobDefinition::queue(
            "mail",
            QueueBinding::new("mail"),
            handler_fn(move |_ctx: JobContext| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::fault("smtp down"))
                }
            }),
        ))
        .unwrap();
    h.broker.publish("mail", "hi");

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    wait_until("ack", || h.broker.acked().len() == 1).await;
    pool.stop(Duration::from_secs(1)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.broker.nacked(), vec![(1, true)]);
    assert_eq!(h.ctx.metrics.snapshot().discards, 1);
}

#[tokio::test]
async fn test_routing_key_and_unroutable_messages() {
    let h = harness(true);
    let eu = Arc::new(AtomicUsize::new(0));
    let any = Arc::new(AtomicUsize::new(0));
    h.registry
        .register(JobDefinition::queue(
            "orders-eu",
            QueueBinding::new("orders").with_routing_key("eu"),
            counting_handler(eu.clone(), Duration::ZERO),
        ))
        .unwrap();
    h.registry
        .register(JobDefinition::queue(
            "audit",
            QueueBinding::new("audit").with_routing_key("security"),
            counting_handler(any.clone(), Duration::ZERO),
        ))
        .unwrap();

    h.broker.publish_with_key("orders", "eu", "a");
    h.broker.publish_with_key("orders", "us", "b");
    h.broker.publish("audit", "c");

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    wait_until("settled", || h.broker.unacked_len() == 0 && h.sink.len() == 2).await;
    pool.stop(Duration::from_secs(1)).await;

    assert_eq!(eu.load(Ordering::SeqCst), 1);
    assert_eq!(any.load(Ordering::SeqCst), 0);
    let letters = h.sink.letters();
    assert!(letters.iter().all(|l| l.job_id.is_none() && l.outcome.is_none()));
}

#[tokio::test]
async fn test_transient_receive_errors_are_retried() {
    let h = harness(false);
    let handled = Arc::new(AtomicUsize::new(0));
    h.registry
        .register(JobDefinition::queue(
            "flaky",
            QueueBinding::new("flaky"),
            counting_handler(handled.clone(), Duration::ZERO),
        ))
        .unwrap();
    h.broker.fail_next_receives(2);
    h.broker.publish("flaky", "x");

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    wait_until("ack", || h.broker.acked().len() == 1).await;
    pool.stop(Duration::from_secs(1)).await;

    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(h.fault.get().is_none());
}

#[tokio::test]
async fn test_persistent_receive_failure_raises_fault() {
    let h = harness(false);
    h.registry
        .register(JobDefinition::queue(
            "down",
            QueueBinding::new("down"),
            counting_handler(Arc::new(AtomicUsize::new(0)), Duration::ZERO),
        ))
        .unwrap();
    h.broker.set_available(false);

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    tokio::time::timeout(Duration::from_secs(2), h.fault.raised())
        .await
        .unwrap();
    wait_until("worker exit", || pool.live_workers() == 0).await;

    assert!(h.fault.get().unwrap().contains("down"));
    assert_eq!(pool.stop(Duration::from_millis(10)).await, 0);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_dispatch() {
    let h = harness(false);
    let started = Arc::new(AtomicUsize::new(0));
    h.registry
        .register(JobDefinition::queue(
            "slow",
            QueueBinding::new("slow"),
            counting_handler(started.clone(), Duration::from_millis(200)),
        ))
        .unwrap();
    h.broker.publish("slow", "x");

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    wait_until("dispatch start", || started.load(Ordering::SeqCst) == 1).await;
    assert!(pool.slots()[0].in_flight().is_some());

    let aborted = pool.stop(Duration::from_secs(2)).await;
    assert_eq!(aborted, 0);
    assert_eq!(h.broker.acked().len(), 1);
    assert!(h.broker.settle_counts().values().all(|&n| n == 1));
}

#[tokio::test]
async fn test_stop_aborts_after_grace_without_settling() {
    let h = harness(false);
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();
    h.registry
        .register(JobDefinition::queue(
            "stuck",
            QueueBinding::new("stuck"),
            handler_fn(move |_ctx: JobContext| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }),
        ))
        .unwrap();
    h.broker.publish("stuck", "x");

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    wait_until("dispatch start", || started.load(Ordering::SeqCst) == 1).await;

    let aborted = pool.stop(Duration::from_millis(50)).await;
    assert_eq!(aborted, 1);
    assert!(h.broker.acked().is_empty());
    assert!(h.broker.nacked().is_empty());
    assert_eq!(h.broker.unacked_len(), 1);
}

#[tokio::test]
async fn test_requeue_backoff_is_cut_short_by_stop() {
    let h = harness(false);
    h.outcomes
        .set_default_policy(RetryPolicy::fixed(5, Duration::from_secs(30)));
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();
    h.registry
        .register(JobDefinition::queue(
            "later",
            QueueBinding::new("later"),
            handler_fn(move |_ctx: JobContext| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::business("not yet"))
                }
            }),
        ))
        .unwrap();
    h.broker.publish("later", "x");

    let pool = ConsumerPool::start(h.ctx.clone(), &h.registry.queue_bindings(1));
    wait_until("first attempt", || started.load(Ordering::SeqCst) == 1).await;

    let aborted = pool.stop(Duration::from_secs(2)).await;
    assert_eq!(aborted, 0);
    assert_eq!(h.broker.nacked(), vec![(1, true)]);
    assert_eq!(h.broker.ready_len("later"), 1);
}
