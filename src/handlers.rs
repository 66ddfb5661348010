//! Shell-command job handler.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use taskr_engine::{JobContext, JobError, JobHandler};

/// How much of stderr is kept in a failure message.
const STDERR_TAIL: usize = 512;

/// Runs an external program for every dispatch.
///
/// The job id, attempt and scheduled time are passed as `TASKR_*`
/// environment variables and the message payload, if any, on stdin. A
/// non-zero exit is a business failure; failing to spawn is a fault. The
/// child is killed when the dispatch is cancelled.
pub(crate) struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub(crate) fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, ctx: &JobContext) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("TASKR_JOB_ID", &ctx.job_id)
            .env("TASKR_ATTEMPT", ctx.attempt.to_string())
            .stdin(if ctx.payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(at) = ctx.scheduled_for {
            command.env("TASKR_SCHEDULED_FOR", at.to_rfc3339());
        }
        command
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        let mut child = self
            .command(&ctx)
            .spawn()
            .map_err(|e| JobError::fault(format!("failed to spawn {}: {}", self.program, e)))?;

        // Written from a separate task so a chatty child cannot block on a full stdout pipe.
        if let (Some(payload), Some(mut stdin)) = (ctx.payload.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Child closed stdin early: {}", e);
                }
            });
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.cancelled() => {
                return Err(JobError::business(format!("{} cancelled", self.program)));
            }
        };

        if !output.stdout.is_empty() {
            debug!(
                job_id = %ctx.job_id,
                "{} stdout: {}",
                self.program,
                String::from_utf8_lossy(&output.stdout).trim_end()
            );
        }

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim_end();
        let tail = match stderr.char_indices().rev().nth(STDERR_TAIL) {
            Some((idx, _)) => &stderr[idx..],
            None => stderr,
        };
        Err(JobError::business(format!(
            "{} exited with {}: {}",
            self.program, output.status, tail
        )))
    }
}
