//! CLI definitions for Taskr.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Taskr CLI.
#[derive(Parser)]
#[command(name = "taskr")]
#[command(about = "Run cron and queue jobs from a TOML file")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/taskr.toml", env = "TASKR_CONFIG", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the engine in foreground (default)
    Run,

    /// Validate the configuration and exit
    Check,

    /// List configured jobs
    Jobs {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Put a message on a spool queue
    Publish {
        /// Queue name
        queue: String,

        /// Routing key used to pick a binding
        #[arg(long)]
        routing_key: Option<String>,

        /// Message body (stdin is read when neither --data nor --file is set)
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,

        /// Read the message body from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
}
