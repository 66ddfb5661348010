//! `taskr run`: start the engine and serve until signalled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use taskr_config::{Config, ConfigLoader, ConfigValidator};
use taskr_engine::{
    Engine, EngineConfig, EngineEvent, ErrorKind, JobOutcome, listener_fn, outcome_fn,
};

use crate::jobs::job_definitions;
use crate::signal::{RunSignal, SignalHandler};
use crate::spool::{SpoolBroker, SpoolDeadLetterSink};

/// Run the engine in foreground until SIGTERM/SIGINT or a broker fault.
pub(crate) async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting Taskr v{}", env!("CARGO_PKG_VERSION"));

    let warnings = ConfigValidator::validate(&config)?.into_result()?;
    for warning in &warnings {
        warn!("{}: {}", warning.path, warning.message);
    }

    let engine = build_engine(&config)?;
    let signals = SignalHandler::new();
    signals.install().context("failed to install signal handlers")?;

    engine.start().await?;
    serve(&engine, &signals).await
}

/// Wire the engine from a loaded configuration.
pub(crate) fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let mut builder = Engine::builder()
        .config(EngineConfig::from_config(config)?)
        .jobs(job_definitions(config)?)
        .on_outcome(
            ErrorKind::Timeout,
            outcome_fn(|job_id: &str, outcome: &JobOutcome| {
                warn!(job_id, attempt = ?outcome.attempt(), "Job timed out");
                Ok(())
            }),
        )
        .listener(listener_fn(|event: &EngineEvent| {
            match event {
                EngineEvent::WorkerStarted { worker, queue } => {
                    info!(%worker, queue = %queue, "Worker started")
                }
                EngineEvent::WorkerStopped { worker, queue } => {
                    info!(%worker, queue = %queue, "Worker stopped")
                }
                other => info!(event = other.name(), "Engine event"),
            }
            Ok(())
        }));

    let spool = SpoolBroker::from_section(&config.broker).map(Arc::new);
    if let Some(ref broker) = spool {
        info!("Spool broker at {}", broker.root().display());
        builder = builder.broker(broker.clone());
    }

    if config.dead_letter.enabled {
        let dir = match (&config.dead_letter.directory, &spool) {
            (Some(dir), _) => PathBuf::from(ConfigLoader::expand_path(dir)),
            (None, Some(broker)) => broker.root().join("dead-letters"),
            (None, None) => bail!("dead_letter.enabled needs dead_letter.directory or broker.spool_dir"),
        };
        info!("Dead letters written to {}", dir.display());
        builder = builder.dead_letter(Arc::new(SpoolDeadLetterSink::new(dir)));
    }

    Ok(builder.build()?)
}

/// Serve until shutdown, then stop the engine.
///
/// A broker fault stops the engine and fails the run.
pub(crate) async fn serve(engine: &Engine, signals: &SignalHandler) -> anyhow::Result<()> {
    let mut rx = signals.subscribe();

    let fault = loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Ok(RunSignal::Shutdown) | Err(RecvError::Closed) => break None,
                Ok(RunSignal::Reload) => match engine.reload(true).await {
                    Ok(report) if report.is_clean() => info!("Workers reloaded"),
                    Ok(report) => warn!(
                        "Workers reloaded, {} worker(s) aborted",
                        report.aborted_workers
                    ),
                    Err(e) => error!("Reload failed: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} signal(s)", skipped);
                }
            },
            fault = engine.fault_raised() => break Some(fault),
        }
    };

    if let Some(ref fault) = fault {
        error!("Stopping after broker fault: {}", fault);
    }

    let report = engine.stop().await?;
    let metrics = engine.metrics();
    info!(
        dispatches = metrics.dispatches,
        successes = metrics.successes,
        failures = metrics.failures,
        dead_letters = metrics.dead_letters,
        "Taskr stopped"
    );
    if !report.is_clean() {
        warn!(
            "Aborted {} cron run(s) and {} worker(s) at shutdown",
            report.aborted_cron_runs, report.aborted_workers
        );
    }

    match fault {
        Some(fault) => Err(fault.into()),
        None => Ok(()),
    }
}
