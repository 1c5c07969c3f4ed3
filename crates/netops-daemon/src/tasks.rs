//! Built-in task references available to every job file.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use netops_scheduler::{Task, TaskContext, TaskError, TaskRegistry};

/// Characters of stdout kept in a run's output.
pub const MAX_OUTPUT_CHARS: usize = 16_000;

pub fn register_builtin_tasks(registry: &TaskRegistry) {
    registry.register("shell.exec", Arc::new(ShellExec::new(MAX_OUTPUT_CHARS)));
    registry.register("log.message", Arc::new(LogMessage));
    registry.register_fn("noop", |_| async { Ok::<_, TaskError>(None) });
}

/// Runs `args[0]` (or `kwargs.command`) through `sh -c`.
///
/// The child is killed when the attempt is dropped, so a job timeout never
/// leaves a stray process behind.
pub struct ShellExec {
    max_output_chars: usize,
}

impl ShellExec {
    pub fn new(max_output_chars: usize) -> Self {
        Self { max_output_chars }
    }
}

#[async_trait]
impl Task for ShellExec {
    async fn run(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        let command = ctx
            .arg_str(0)
            .or_else(|| ctx.kwarg_str("command"))
            .ok_or_else(|| TaskError::InvalidArgs("shell.exec needs a command in args[0]".into()))?;
        debug!(job_id = %ctx.job_id, attempt = ctx.attempt, command, "exec");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.cancel.cancelled() => return Err(TaskError::failed("command cancelled")),
        };

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout), self.max_output_chars);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(TaskError::Failed(format!(
                "command exited with {code}: {}",
                truncate_output(stderr.trim(), self.max_output_chars)
            )));
        }
        Ok(Some(stdout))
    }
}

/// Logs `kwargs.message` (or `args[0]`) and returns it as the run output.
pub struct LogMessage;

#[async_trait]
impl Task for LogMessage {
    async fn run(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        let message = ctx
            .kwarg_str("message")
            .or_else(|| ctx.arg_str(0))
            .ok_or_else(|| TaskError::InvalidArgs("log.message needs kwargs.message".into()))?;
        info!(job_id = %ctx.job_id, "{message}");
        Ok(Some(message.to_string()))
    }
}

/// Keep the head and tail of long output, cut on character boundaries.
fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }
    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    let omitted = total - 2 * half;
    format!("{head}\n... [{omitted} chars omitted] ...\n{tail}")
}
