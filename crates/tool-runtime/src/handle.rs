//! Uniform invocation handle over built-in, project-local and remote tools.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::schema::{ArgumentValidator, SchemaError};
use crate::tool::{Tool, ToolCall, ToolContext, ToolDescriptor, ToolError, ToolResult};

/// Where a tool came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    /// In-process callable
    Builtin,
    /// Project-local definition
    Local,
    /// Tool served by a remote protocol server
    Remote,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleKind::Builtin => "builtin",
            HandleKind::Local => "local",
            HandleKind::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// A resolved tool: descriptor, origin, compiled schema and the callable.
///
/// `invoke` never fails: validation errors, tool errors, timeouts,
/// cancellation and panics all come back as an error [`ToolResult`].
#[derive(Clone)]
pub struct ToolHandle {
    descriptor: ToolDescriptor,
    kind: HandleKind,
    source: String,
    validator: Arc<ArgumentValidator>,
    tool: Arc<dyn Tool>,
}

impl ToolHandle {
    pub fn new(
        tool: Arc<dyn Tool>,
        kind: HandleKind,
        source: impl Into<String>,
    ) -> Result<Self, SchemaError> {
        let descriptor = tool.descriptor();
        let validator = ArgumentValidator::compile(&descriptor.name, &descriptor.input_schema)?;
        Ok(Self {
            descriptor,
            kind,
            source: source.into(),
            validator: Arc::new(validator),
            tool,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Check arguments against the tool's schema.
    pub fn validate(&self, input: &Value) -> Result<(), ToolError> {
        self.validator.validate(input).map_err(|errors| {
            ToolError::InvalidInput(format!(
                "arguments for '{}' do not match its schema: {}",
                self.descriptor.name,
                errors.join("; ")
            ))
        })
    }

    /// Run the call.
    ///
    /// `default_timeout` applies when the descriptor has no deadline of its
    /// own. Once `ctx.cancel` fires the tool gets `grace` to finish before
    /// its future is dropped.
    pub async fn invoke(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        default_timeout: Option<Duration>,
        grace: Duration,
    ) -> ToolResult {
        if let Err(e) = self.validate(&call.input) {
            return ToolResult::error(call, e.to_string());
        }
        if ctx.cancel.is_cancelled() {
            return ToolResult::error(call, ToolError::Cancelled.to_string());
        }

        let deadline = self
            .descriptor
            .timeout_secs
            .map(Duration::from_secs)
            .or(default_timeout);

        debug!(tool = %self.descriptor.name, call_id = %call.id, source = %self.source, "invoking tool");

        let execution = AssertUnwindSafe(self.tool.execute(call.input.clone(), ctx)).catch_unwind();
        tokio::pin!(execution);

        let timer = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        let outcome = tokio::select! {
            result = &mut execution => result,
            _ = &mut timer => {
                // Deadlines are a form of cancellation: signal, then allow the grace period.
                ctx.cancel.cancel();
                // Whatever the tool returns within the grace period, the call has timed out.
                let _ = tokio::time::timeout(grace, &mut execution).await;
                let limit = deadline.unwrap_or_default();
                warn!(tool = %self.descriptor.name, call_id = %call.id, ?limit, "tool timed out");
                return ToolResult::error(call, ToolError::Timeout(limit).to_string());
            }
            _ = ctx.cancel.cancelled() => {
                match tokio::time::timeout(grace, &mut execution).await {
                    Ok(result) => {
                        debug!(tool = %self.descriptor.name, call_id = %call.id, "tool acknowledged cancellation");
                        result
                    }
                    Err(_) => {
                        warn!(tool = %self.descriptor.name, call_id = %call.id, "tool ignored cancellation, dropping it");
                        return ToolResult::error(call, ToolError::Cancelled.to_string());
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(output)) => ToolResult {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: output.content,
                is_error: output.is_error,
            },
            Ok(Err(e)) => ToolResult::error(call, format!("Tool error: {}", e)),
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                warn!(tool = %self.descriptor.name, call_id = %call.id, %detail, "tool panicked");
                ToolResult::error(call, format!("Tool '{}' failed unexpectedly: {}", call.name, detail))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolHandle")
            .field("name", &self.descriptor.name)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{EchoTool, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("panics", "always panics", Value::Null)
        }

        async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
            panic!("internal invariant broken");
        }
    }

    /// Sleeps; honours cancellation only when `cooperative`.
    struct SleepyTool {
        cooperative: bool,
    }

    #[async_trait]
    impl Tool for SleepyTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("sleepy", "sleeps", Value::Null)
        }

        async fn execute(&self, _input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
            if self.cooperative {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(ToolOutput::text("slept")),
                    _ = context.cancel.cancelled() => Err(ToolError::Cancelled),
                }
            } else {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ToolOutput::text("slept"))
            }
        }
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            input,
            message_id: "msg".to_string(),
        }
    }

    fn handle(tool: impl Tool + 'static) -> ToolHandle {
        ToolHandle::new(Arc::new(tool), HandleKind::Builtin, "builtin").unwrap()
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let h = handle(EchoTool);
        let ctx = ToolContext::new("/tmp");
        let result = h
            .invoke(&call("echo", json!({"message": "hi"})), &ctx, None, Duration::from_secs(1))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
        assert_eq!(result.tool_call_id, "call_1");
        assert_eq!(result.tool_name, "echo");
    }

    #[tokio::test]
    async fn test_schema_violation_is_error_result() {
        let h = handle(EchoTool);
        let ctx = ToolContext::new("/tmp");
        let result = h
            .invoke(&call("echo", json!({"message": 5})), &ctx, None, Duration::from_secs(1))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("schema"));
    }

    #[tokio::test]
    async fn test_panic_is_normalized() {
        let h = handle(PanickingTool);
        let ctx = ToolContext::new("/tmp");
        let result = h
            .invoke(&call("panics", json!({})), &ctx, None, Duration::from_secs(1))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("internal invariant broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_error_result() {
        let h = handle(SleepyTool { cooperative: false });
        let ctx = ToolContext::new("/tmp");
        let result = h
            .invoke(
                &call("sleepy", json!({})),
                &ctx,
                Some(Duration::from_secs(2)),
                Duration::from_millis(100),
            )
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("Timeout"));
        assert!(ctx.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported_even_when_tool_stops_within_grace() {
        let h = handle(SleepyTool { cooperative: true });
        let ctx = ToolContext::new("/tmp");
        let result = h
            .invoke(
                &call("sleepy", json!({})),
                &ctx,
                Some(Duration::from_secs(2)),
                Duration::from_secs(1),
            )
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("Timeout"));
        assert!(!result.content.contains("Cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_cancellation() {
        let h = handle(SleepyTool { cooperative: true });
        let ctx = ToolContext::new("/tmp");
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let result = h
            .invoke(&call("sleepy", json!({})), &ctx, None, Duration::from_secs(1))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("Cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncooperative_tool_dropped_after_grace() {
        let h = handle(SleepyTool { cooperative: false });
        let ctx = ToolContext::new("/tmp");
        ctx.cancel.cancel();
        let result = h
            .invoke(&call("sleepy", json!({})), &ctx, None, Duration::from_millis(10))
            .await;
        assert!(result.is_error);
    }

    #[test]
    fn test_bad_schema_rejected_at_construction() {
        struct BadSchema;
        #[async_trait]
        impl Tool for BadSchema {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("bad", "bad schema", json!({"type": 12}))
            }
            async fn execute(&self, _: Value, _: &ToolContext) -> Result<ToolOutput, ToolError> {
                Ok(ToolOutput::text(""))
            }
        }
        assert!(ToolHandle::new(Arc::new(BadSchema), HandleKind::Local, "project").is_err());
    }
}
