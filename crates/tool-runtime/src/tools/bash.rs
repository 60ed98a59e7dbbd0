//! Shell command execution tool.
//!
//! Runs commands via `sh -c` in the call's working directory. The child is
//! killed when the call is cancelled or its own timeout expires.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::permission::PermissionClass;
use crate::tool::{Tool, ToolContext, ToolDescriptor, ToolError, ToolOutput};

/// Execute shell commands with timeout and working directory support.
pub struct BashTool;

impl BashTool {
    const DEFAULT_TIMEOUT_SECS: u64 = 30;
    const MAX_TIMEOUT_SECS: u64 = 300;

    fn resolve_working_dir(base: &Path, override_dir: Option<&str>) -> Result<PathBuf, ToolError> {
        match override_dir {
            Some(d) => super::resolve_in(base, d),
            None => Ok(base.to_path_buf()),
        }
    }
}

/// Run `command` under `sh -c`, honouring cancellation and a timeout.
pub(crate) async fn run_shell(
    command: &str,
    working_dir: &Path,
    timeout: Duration,
    context: &ToolContext,
) -> Result<ToolOutput, ToolError> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn shell: {e}")))?;

    // Dropping the wait future drops the child, which kills it.
    let output = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed(format!("command execution error: {e}")));
            }
            Err(_) => {
                warn!(command = command, ?timeout, "command timed out");
                return Err(ToolError::Timeout(timeout));
            }
        },
        _ = context.cancel.cancelled() => {
            debug!(command = command, "command cancelled, killing child");
            return Err(ToolError::Cancelled);
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);

    let content = if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n--- stderr ---\n{stderr}")
    };
    let content = if content.is_empty() {
        format!("(exit code {exit_code})")
    } else {
        content
    };

    if output.status.success() {
        Ok(ToolOutput::text(content))
    } else {
        debug!(exit_code = exit_code, "command returned non-zero exit code");
        Ok(ToolOutput::failure(content))
    }
}

#[async_trait]
impl Tool for BashTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "bash",
            "Execute a shell command and return stdout/stderr output.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    },
                    "timeout_secs": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Timeout in seconds (default 30, max 300)"
                    },
                    "working_dir": {
                        "type": "string",
                        "description": "Directory to run in, relative to the working directory"
                    }
                },
                "required": ["command"]
            }),
        )
        .with_permission(PermissionClass::Ask)
        .with_match_argument("command")
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let command = input
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing 'command' field".to_string()))?;

        let timeout_secs = input
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(Self::DEFAULT_TIMEOUT_SECS)
            .min(Self::MAX_TIMEOUT_SECS);

        let working_dir_override = input.get("working_dir").and_then(|v| v.as_str());
        let working_dir = Self::resolve_working_dir(&context.working_directory, working_dir_override)?;

        debug!(
            command = command,
            timeout_secs = timeout_secs,
            working_dir = %working_dir.display(),
            "executing bash command"
        );

        run_shell(command, &working_dir, Duration::from_secs(timeout_secs), context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ToolContext {
        ToolContext::new(std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_echo_command() {
        let output = BashTool
            .execute(serde_json::json!({"command": "echo hello"}), &test_context())
            .await
            .unwrap();

        assert_eq!(output.content.trim(), "hello");
        assert!(!output.is_error);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let output = BashTool
            .execute(serde_json::json!({"command": "exit 1"}), &test_context())
            .await
            .unwrap();

        assert!(output.is_error);
        assert_eq!(output.content, "(exit code 1)");
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let err = BashTool
            .execute(
                serde_json::json!({"command": "ls", "working_dir": "../etc"}),
                &test_context(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_cancel_kills_command() {
        let ctx = test_context();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let err = BashTool
            .execute(serde_json::json!({"command": "sleep 30"}), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_descriptor() {
        let descriptor = BashTool.descriptor();
        assert_eq!(descriptor.name, "bash");
        assert_eq!(descriptor.permission, PermissionClass::Ask);
        assert_eq!(descriptor.match_argument.as_deref(), Some("command"));
    }
}
