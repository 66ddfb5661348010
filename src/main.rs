//! Taskr - cron and queue job runner
//!
//! Main entry point for the Taskr CLI.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use taskr_config::{ConfigLoader, LoggingSection};

mod cli;
mod cmd_check;
mod cmd_publish;
mod cmd_run;
mod handlers;
mod jobs;
mod signal;
mod spool;

use cli::{Cli, Commands};

/// Keeps the file writer flushing for the lifetime of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing with a console layer and an optional rolling file layer.
///
/// `RUST_LOG` overrides `logging.level`. Files rotate daily and the last 30
/// are kept.
fn init_tracing(logging: &LoggingSection) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid logging.level '{}'", logging.level))?,
    };

    let console = if logging.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    };

    let file = match logging.directory.as_deref() {
        Some(dir) => {
            let log_dir = PathBuf::from(ConfigLoader::expand_path(dir));
            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("taskr")
                .filename_suffix("log")
                .max_log_files(30)
                .build(&log_dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .try_init()?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_tracing(&config.logging)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run::run(config).await,
        Commands::Check => cmd_check::check(&config),
        Commands::Jobs { json } => cmd_check::list_jobs(&config, json),
        Commands::Publish {
            queue,
            routing_key,
            data,
            file,
        } => cmd_publish::publish(&config, &queue, routing_key.as_deref(), data, file).await,
    }
}
