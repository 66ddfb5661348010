use super::*;
use crate::clock::{ManualClock, SystemClock};
use crate::error::JobError;
use crate::handler::handler_fn;
use crate::memory_broker::MemoryDeadLetterSink;
use crate::outcome::{OutcomeManager, RetryPolicy};
use chrono::TimeZone;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Harness {
    scheduler: Arc<CronScheduler>,
    registry: Arc<JobRegistry>,
    clock: Arc<ManualClock>,
    outcomes: Arc<OutcomeManager>,
    metrics: Arc<EngineMetrics>,
    sink: Arc<MemoryDeadLetterSink>,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap()
}

fn harness() -> Harness {
    let registry = Arc::new(JobRegistry::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let outcomes = Arc::new(OutcomeManager::default());
    let metrics = Arc::new(EngineMetrics::new());
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let dispatcher = Arc::new(Dispatcher::new(
        outcomes.clone(),
        metrics.clone(),
        Duration::from_secs(5),
    ));
    let scheduler = Arc::new(CronScheduler::new(
        SchedulerContext {
            registry: registry.clone(),
            dispatcher,
            metrics: metrics.clone(),
            dead_letter: Some(sink.clone()),
            clock: clock.clone(),
        },
        Duration::from_secs(60),
    ));
    Harness {
        scheduler,
        registry,
        clock,
        outcomes,
        metrics,
        sink,
    }
}

fn counting_job(id: &str, expr: &str, counter: Arc<AtomicUsize>) -> JobDefinition {
    JobDefinition::cron(
        id,
        expr,
        handler_fn(move |_ctx: JobContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
}

fn register_and_arm(h: &Harness, job: JobDefinition) -> Arc<JobDefinition> {
    let job = h.registry.register(job).unwrap();
    h.scheduler.arm(&job);
    job
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
}

#[tokio::test]
async fn test_arm_computes_next_occurrence() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    register_and_arm(&h, counting_job("every-5", "*/5 * * * *", counter));

    assert_eq!(
        h.scheduler.pending(),
        vec![ScheduledFireEvent {
            fire_at: at(10, 5, 0),
            job_id: "every-5".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_tick_fires_in_time_then_id_order_and_rearms() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    register_and_arm(&h, counting_job("b", "* * * * *", counter.clone()));
    register_and_arm(&h, counting_job("a", "* * * * *", counter.clone()));
    register_and_arm(&h, counting_job("later", "*/10 * * * *", counter.clone()));

    assert!(h.scheduler.tick(at(10, 0, 59)).is_empty());

    let now = at(10, 1, 0);
    h.clock.set(now);
    let fired = h.scheduler.tick(now);
    let ids: Vec<_> = fired.iter().map(|f| f.job_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(fired.iter().all(|f| f.missed == 0 && f.scheduled_for == now));

    h.scheduler.wait_idle().await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let pending = h.scheduler.pending();
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].fire_at, at(10, 2, 0));
    assert_eq!(pending[0].job_id, "a");
    assert_eq!(pending[1].job_id, "b");
    assert_eq!(pending[2].fire_at, at(10, 10, 0));
}

#[tokio::test]
async fn test_paused_for_three_minutes_dispatches_once() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    register_and_arm(&h, counting_job("minutely", "* * * * *", counter.clone()));

    h.scheduler.pause();
    h.clock.set(at(10, 3, 30));
    assert!(h.scheduler.tick(h.clock.now()).is_empty());

    h.scheduler.resume();
    let fired = h.scheduler.tick(h.clock.now());
    assert_eq!(
        fired,
        vec![FiredJob {
            job_id: "minutely".to_string(),
            scheduled_for: at(10, 3, 0),
            missed: 2,
        }]
    );
    // Nothing else due at the same instant.
    assert!(h.scheduler.tick(h.clock.now()).is_empty());

    h.scheduler.wait_idle().await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(h.scheduler.pending()[0].fire_at, at(10, 4, 0));

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.cron_fires, 1);
    assert_eq!(metrics.cron_missed, 2);
}

#[tokio::test]
async fn test_interval_job() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    register_and_arm(
        &h,
        JobDefinition::interval(
            "heartbeat",
            Duration::from_secs(30),
            handler_fn(move |ctx: JobContext| {
                let c = c.clone();
                async move {
                    assert!(ctx.scheduled_for.is_some());
                    assert!(ctx.payload.is_none());
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ),
    );

    assert_eq!(h.scheduler.pending()[0].fire_at, at(10, 1, 0));
    let fired = h.scheduler.tick(at(10, 1, 0));
    assert_eq!(fired.len(), 1);
    assert_eq!(h.scheduler.pending()[0].fire_at, at(10, 1, 30));

    h.scheduler.wait_idle().await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_suppresses_future_firings() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    register_and_arm(&h, counting_job("gone", "* * * * *", counter.clone()));

    assert!(h.scheduler.cancel("gone"));
    assert!(!h.scheduler.cancel("gone"));
    assert!(h.scheduler.pending().is_empty());
    assert!(h.scheduler.tick(at(10, 5, 0)).is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unregistered_job_event_is_dropped() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    register_and_arm(&h, counting_job("stale", "* * * * *", counter.clone()));
    h.registry.unregister("stale").unwrap();

    assert!(h.scheduler.tick(at(10, 1, 0)).is_empty());
    assert!(h.scheduler.pending().is_empty());
}

#[tokio::test]
async fn test_start_clears_pause_from_previous_run() {
    let h = harness();
    let counter = Arc::new(AtomicUsize::new(0));
    h.registry
        .register(counting_job("minutely", "* * * * *", counter.clone()))
        .unwrap();

    h.scheduler.start();
    h.scheduler.pause();
    h.scheduler.stop(Duration::from_secs(1)).await;
    assert!(h.scheduler.is_paused());

    h.scheduler.start();
    assert!(!h.scheduler.is_paused());
    assert_eq!(h.scheduler.pending()[0].fire_at, at(10, 1, 0));
    h.scheduler.stop(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_cron_run_retries_then_dead_letters() {
    let h = harness();
    h.outcomes.set_policy(
        Some("flaky"),
        None,
        RetryPolicy::fixed(2, Duration::from_millis(10)).with_dead_letter(),
    );

    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    register_and_arm(
        &h,
        JobDefinition::cron(
            "flaky",
            "* * * * *",
            handler_fn(move |_ctx: JobContext| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::business("upstream said no"))
                }
            }),
        ),
    );

    h.scheduler.tick(at(10, 1, 0));
    h.scheduler.wait_idle().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let letters = h.sink.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id.as_deref(), Some("flaky"));
    assert!(letters[0].message.is_none());
    assert_eq!(h.metrics.snapshot().requeues, 2);
    assert_eq!(h.metrics.snapshot().dead_letters, 1);
}

#[tokio::test]
async fn test_background_loop_fires_interval_job() {
    let registry = Arc::new(JobRegistry::new());
    let outcomes = Arc::new(OutcomeManager::default());
    let metrics = Arc::new(EngineMetrics::new());
    let dispatcher = Arc::new(Dispatcher::new(
        outcomes,
        metrics.clone(),
        Duration::from_secs(5),
    ));
    let scheduler = Arc::new(CronScheduler::new(
        SchedulerContext {
            registry: registry.clone(),
            dispatcher,
            metrics,
            dead_letter: None,
            clock: Arc::new(SystemClock),
        },
        Duration::from_secs(1),
    ));

    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    registry
        .register(JobDefinition::interval(
            "fast",
            Duration::from_millis(50),
            handler_fn(move |_ctx: JobContext| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ))
        .unwrap();

    scheduler.start();
    assert!(scheduler.is_running());
    tokio::time::sleep(Duration::from_millis(300)).await;
    let aborted = scheduler.stop(Duration::from_secs(1)).await;

    assert_eq!(aborted, 0);
    assert!(!scheduler.is_running());
    assert!(counter.load(Ordering::SeqCst) >= 2);
    assert!(scheduler.pending().is_empty());
}

#[tokio::test]
async fn test_stop_aborts_stuck_run_after_grace() {
    let h = harness();
    register_and_arm(
        &h,
        JobDefinition::cron(
            "stuck",
            "* * * * *",
            handler_fn(|ctx: JobContext| async move {
                // Ignores cooperative stop; only a kill ends it.
                ctx.cancelled().await;
                Ok(())
            }),
        )
        .with_timeout(Duration::from_secs(60)),
    );

    h.scheduler.start();
    h.clock.set(at(10, 1, 0));
    h.scheduler.tick(at(10, 1, 0));
    tokio::task::yield_now().await;
    assert_eq!(h.scheduler.active_runs(), 1);

    let aborted = h.scheduler.stop(Duration::from_millis(50)).await;
    assert_eq!(aborted, 1);
    assert_eq!(h.scheduler.active_runs(), 0);
}
