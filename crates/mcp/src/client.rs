//! MCP client implementation.
//!
//! Performs the `initialize` handshake over an [`RpcChannel`], pages
//! through `tools/list`, and adapts each remote tool to the runtime's
//! `Tool` trait.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tern_tool_runtime::permission::PermissionClass;
use tern_tool_runtime::tool::{Tool, ToolContext, ToolDescriptor, ToolError, ToolOutput};

use crate::channel::RpcChannel;
use crate::error::McpError;
use crate::types::*;

/// Protocol revisions this client accepts from a server.
const SUPPORTED_VERSIONS: [&str; 2] = [PROTOCOL_VERSION, "2024-11-05"];

async fn timed<T>(limit: Duration, fut: impl Future<Output = Result<T, McpError>>) -> Result<T, McpError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| McpError::Timeout(limit))?
}

/// An initialized connection to one MCP server.
pub struct McpClient {
    name: String,
    channel: Arc<dyn RpcChannel>,
    server_info: Implementation,
    instructions: Option<String>,
    request_timeout: Duration,
}

impl McpClient {
    /// Run the handshake. `request_timeout` bounds the handshake and
    /// listing; tool calls are bounded by the caller.
    pub async fn connect(
        name: impl Into<String>,
        channel: Arc<dyn RpcChannel>,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        let name = name.into();
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "tern".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        };
        let value = timed(
            request_timeout,
            channel.call("initialize", Some(serde_json::to_value(params)?)),
        )
        .await?;
        let result: InitializeResult = serde_json::from_value(value)?;
        if !SUPPORTED_VERSIONS.contains(&result.protocol_version.as_str()) {
            channel.close().await;
            return Err(McpError::UnsupportedVersion(result.protocol_version));
        }

        channel.notify("notifications/initialized", None).await?;
        info!(
            server = %name,
            remote = %result.server_info.name,
            version = %result.protocol_version,
            "MCP server initialized"
        );

        Ok(Self {
            name,
            channel,
            server_info: result.server_info,
            instructions: result.instructions,
            request_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Every tool the server offers, across all pages.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let params = serde_json::to_value(ListToolsParams { cursor: cursor.clone() })?;
            let value = timed(self.request_timeout, self.channel.call("tools/list", Some(params))).await?;
            let page: ListToolsResult = serde_json::from_value(value)?;
            debug!(server = %self.name, count = page.tools.len(), "received tools/list page");
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(server = %self.name, cursor = %next, "server repeated a tools/list cursor, stopping");
                    break;
                }
                None => break,
            }
        }
        info!(server = %self.name, count = tools.len(), "tool discovery complete");
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.call_tool_as(self.channel.next_id(), name, arguments).await
    }

    async fn call_tool_as(&self, id: RpcId, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let value = self.channel.request(id, "tools/call", Some(params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Tell the server a request is no longer wanted.
    pub async fn cancel(&self, id: RpcId, reason: &str) -> Result<(), McpError> {
        let params = serde_json::to_value(CancelledParams {
            request_id: id,
            reason: Some(reason.to_string()),
        })?;
        self.channel.notify("notifications/cancelled", Some(params)).await
    }

    /// Adapters for `tools`, all sharing this connection.
    pub fn tools(self: &Arc<Self>, tools: Vec<ToolInfo>, permission: PermissionClass) -> Vec<McpTool> {
        tools
            .into_iter()
            .map(|info| McpTool {
                client: Arc::clone(self),
                info,
                permission,
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        info!(server = %self.name, "closing MCP connection");
        self.channel.close().await;
    }
}

/// A remote tool behind the runtime's `Tool` trait.
pub struct McpTool {
    client: Arc<McpClient>,
    info: ToolInfo,
    permission: PermissionClass,
}

impl McpTool {
    pub fn server(&self) -> &str {
        self.client.name()
    }
}

#[async_trait]
impl Tool for McpTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(&self.info.name, &self.info.description, self.info.input_schema.clone())
            .with_permission(self.permission)
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let id = self.client.channel.next_id();
        tokio::select! {
            result = self.client.call_tool_as(id.clone(), &self.info.name, input) => match result {
                Ok(result) => Ok(ToolOutput {
                    content: result.text_content(),
                    is_error: result.is_error,
                }),
                Err(e) => Err(ToolError::ExecutionFailed(format!(
                    "MCP server '{}': {}",
                    self.client.name, e
                ))),
            },
            _ = context.cancel.cancelled() => {
                debug!(server = %self.client.name, tool = %self.info.name, id = %id, "cancelling remote call");
                if let Err(e) = self.client.cancel(id, "cancelled by client").await {
                    debug!(server = %self.client.name, error = %e, "could not deliver cancellation");
                }
                Err(ToolError::Cancelled)
            }
        }
    }
}
