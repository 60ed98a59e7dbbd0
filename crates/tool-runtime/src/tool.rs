use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::permission::PermissionClass;

/// Full static description of an invocable tool.
///
/// The descriptor is what the resolver, the permission gate and the handle
/// work from. Only the [`ToolDefinition`] view of it is sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name (e.g., "bash", "read_file")
    pub name: String,
    /// Human-readable description for the LLM
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
    /// Default permission class when no rule matches
    #[serde(default)]
    pub permission: PermissionClass,
    /// Argument globs that are always allowed
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    /// Argument globs that are always denied
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    /// Argument that patterns and approvals are matched against.
    /// When unset the whole argument object (canonical JSON) is used.
    #[serde(default)]
    pub match_argument: Option<String>,
    /// Per-tool execution deadline
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            permission: PermissionClass::default(),
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            match_argument: None,
            timeout_secs: None,
        }
    }

    pub fn with_permission(mut self, permission: PermissionClass) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_match_argument(mut self, argument: impl Into<String>) -> Self {
        self.match_argument = Some(argument.into());
        self
    }

    pub fn with_allow_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.allow_patterns.push(pattern.into());
        self
    }

    pub fn with_deny_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.deny_patterns.push(pattern.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The LLM-facing view of this tool.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    /// The string that permission patterns and the approval cache key on.
    pub fn argument_subject(&self, input: &Value) -> String {
        match self.match_argument.as_deref().and_then(|field| input.get(field)) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => canonical_json(other),
            None => canonical_json(input),
        }
    }
}

/// Serialize with object keys sorted, independent of map ordering features.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Describes a tool's interface for LLM consumption.
/// Maps to Claude's tool format and OpenAI's function format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Represents an LLM requesting execution of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this invocation within the turn (used to match results)
    pub id: String,
    /// Tool name to execute
    pub name: String,
    /// JSON input arguments
    pub input: Value,
    /// Id of the assistant message that requested this call
    #[serde(default)]
    pub message_id: String,
}

/// Result of executing a tool, sent back to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the ToolCall id
    pub tool_call_id: String,
    pub tool_name: String,
    /// Result content (text or structured)
    pub content: String,
    /// Whether this result represents an error
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// What a tool hands back; the handle attaches call id and tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Context passed to tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Working directory for file/bash operations
    pub working_directory: PathBuf,
    /// Id of the call being executed
    pub call_id: String,
    /// Fires when the turn is cancelled or the call times out.
    /// Long-running tools should observe it and wind down.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            call_id: String::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context for one call, cancelled together with `parent`.
    pub fn for_call(&self, call_id: &str, parent: &CancellationToken) -> Self {
        Self {
            working_directory: self.working_directory.clone(),
            call_id: call_id.to_string(),
            cancel: parent.child_token(),
        }
    }
}

/// The primary extension point: all tools implement this trait.
///
/// Tools are object-safe, Send + Sync, and async.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's descriptor (name, schema, permission defaults).
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with the given JSON input.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl fmt::Display for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

/// Simple echo tool for testing purposes.
#[cfg(any(test, feature = "test-utils"))]
pub struct EchoTool;

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "echo",
            "Echoes back the input message. For testing.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo back"
                    }
                },
                "required": ["message"]
            }),
        )
        .with_permission(PermissionClass::Always)
        .with_match_argument("message")
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let message = input
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing 'message' field".to_string()))?;

        Ok(ToolOutput::text(message))
    }
}
