//! Client-side tool execution.
//!
//! The relay never runs tools itself. A chat client hands each tool-call
//! frame to a [`ToolExecutor`] and reports whatever comes back.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::ToolExecutionError;
use crate::models::ToolCallDescriptor;
use crate::utils::truncate_text;

const MAX_ERROR_CHARS: usize = 2_000;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCallDescriptor) -> Result<Value, ToolExecutionError>;
}

/// Rejects every call. Used when no tool command is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopToolExecutor;

#[async_trait]
impl ToolExecutor for NoopToolExecutor {
    async fn execute(&self, call: &ToolCallDescriptor) -> Result<Value, ToolExecutionError> {
        Err(ToolExecutionError::new(format!(
            "no tool executor configured for '{}'",
            call.function_name()
        )))
    }
}

/// Runs an external command once per tool call.
///
/// The descriptor JSON is written to stdin. Stdout becomes the result,
/// parsed as JSON when it is JSON and passed through as text otherwise.
#[derive(Debug, Clone)]
pub struct CommandToolExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandToolExecutor {
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self> {
        let Some(mut parts) = shlex::split(command_line) else {
            bail!("Failed to parse tool command '{command_line}' as shell-style tokens");
        };
        if parts.is_empty() {
            bail!("Tool command is empty");
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
            timeout,
        })
    }

    async fn run(&self, call: &ToolCallDescriptor) -> Result<Value, ToolExecutionError> {
        let input = serde_json::to_vec(call)
            .map_err(|err| ToolExecutionError::new(format!("failed to encode tool call: {err}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ToolExecutionError::new(format!("failed to spawn '{}': {err}", self.program))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may exit before reading it.
            let _ = stdin.write_all(&input).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| ToolExecutionError::new(format!("tool command failed: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("tool command exited with {}", output.status)
            } else {
                truncate_text(stderr, MAX_ERROR_CHARS)
            };
            return Err(ToolExecutionError::new(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}

#[async_trait]
impl ToolExecutor for CommandToolExecutor {
    async fn execute(&self, call: &ToolCallDescriptor) -> Result<Value, ToolExecutionError> {
        match tokio::time::timeout(self.timeout, self.run(call)).await {
            Ok(result) => result,
            Err(_) => Err(ToolExecutionError::new(format!(
                "'{}' timed out after {}s",
                call.function_name(),
                self.timeout.as_secs_f64()
            ))),
        }
    }
}
