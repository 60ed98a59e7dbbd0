//! MCP server implementation.
//!
//! Exposes a `ToolRegistry` over any [`McpTransport`]. Calls go through
//! `ToolHandle::invoke`, so arguments are schema-checked and tool failures
//! come back as `isError` results rather than JSON-RPC errors.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tern_tool_runtime::handle::{HandleKind, ToolHandle};
use tern_tool_runtime::permission::PermissionClass;
use tern_tool_runtime::schema::SchemaError;
use tern_tool_runtime::tool::{ToolCall, ToolContext};
use tern_tool_runtime::{ToolRegistry, ToolSource};

use crate::error::McpError;
use crate::transport::McpTransport;
use crate::types::*;

const DEFAULT_PAGE_SIZE: usize = 100;
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// MCP server that bridges a `ToolRegistry` to MCP clients.
pub struct McpServer {
    tools: BTreeMap<String, ToolHandle>,
    info: Implementation,
    initialized: bool,
    working_directory: PathBuf,
    page_size: usize,
    tool_timeout: Option<Duration>,
}

impl McpServer {
    /// Tools whose permission class is `never` are not served.
    pub fn new(registry: &ToolRegistry) -> Result<Self, SchemaError> {
        let mut tools = BTreeMap::new();
        for descriptor in registry.descriptors() {
            if descriptor.permission == PermissionClass::Never {
                tracing::debug!(tool = %descriptor.name, "tool is never permitted, not serving it");
                continue;
            }
            if let Some(tool) = registry.get(&descriptor.name) {
                let handle = ToolHandle::new(tool, HandleKind::Builtin, registry.name())?;
                tools.insert(descriptor.name, handle);
            }
        }
        Ok(Self {
            tools,
            info: Implementation {
                name: "tern".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            initialized: false,
            working_directory: PathBuf::from("."),
            page_size: DEFAULT_PAGE_SIZE,
            tool_timeout: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    /// Working directory for tool execution.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Tools per `tools/list` page.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Deadline for tools that do not declare their own.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    /// Serve until the transport closes.
    ///
    /// Requests are handled one at a time, in arrival order.
    pub async fn run<T: McpTransport>(&mut self, transport: &mut T) -> Result<(), McpError> {
        tracing::info!(server = %self.info.name, tools = self.tools.len(), "MCP server starting");

        while let Some(line) = transport.receive().await? {
            tracing::debug!(message = %line, "received message");

            let response = match IncomingMessage::parse(&line) {
                Ok(IncomingMessage::Request(request)) => self.handle_request(&request).await,
                Ok(IncomingMessage::Notification(notification)) => {
                    self.handle_notification(&notification);
                    continue;
                }
                Ok(IncomingMessage::Response(response)) => {
                    tracing::debug!(id = %response.id, "ignoring response from client");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse message");
                    JsonRpcResponse::error(RpcId::Null, McpError::JsonParse(e).to_rpc_error())
                }
            };

            transport.send(&serde_json::to_string(&response)?).await?;
        }

        tracing::info!("transport closed, shutting down");
        Ok(())
    }

    pub async fn handle_request(&mut self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            "initialize" => self.handle_initialize(&request.params),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" if self.initialized => self.handle_list_tools(&request.params),
            "tools/call" if self.initialized => self.handle_call_tool(&id, &request.params).await,
            "tools/list" | "tools/call" => Err(McpError::NotInitialized),
            method => {
                tracing::warn!(method = %method, "unknown method");
                Err(McpError::MethodNotFound(method.to_string()))
            }
        };
        match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::error(id, e.to_rpc_error()),
        }
    }

    fn handle_notification(&mut self, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => tracing::info!("client confirmed initialization"),
            // Calls run to completion before the next message is read, so
            // by the time this arrives the call has already been answered.
            "notifications/cancelled" => tracing::debug!(params = ?notification.params, "client cancelled a request"),
            method => tracing::debug!(method = %method, "unknown notification, ignoring"),
        }
    }

    fn handle_initialize(&mut self, params: &Option<Value>) -> Result<Value, McpError> {
        let params: InitializeParams = serde_json::from_value(params.clone().unwrap_or(Value::Null))
            .map_err(|e| McpError::InvalidParams(e.to_string()))?;
        tracing::info!(
            client = %params.client_info.name,
            version = %params.protocol_version,
            "handling initialize"
        );
        self.initialized = true;

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
            },
            server_info: self.info.clone(),
            instructions: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    fn handle_list_tools(&self, params: &Option<Value>) -> Result<Value, McpError> {
        let params: ListToolsParams = match params {
            Some(p) => serde_json::from_value(p.clone()).map_err(|e| McpError::InvalidParams(e.to_string()))?,
            None => ListToolsParams::default(),
        };
        let start = match params.cursor.as_deref() {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| McpError::InvalidParams(format!("unknown cursor '{}'", cursor)))?,
            None => 0,
        };

        let tools: Vec<ToolInfo> = self
            .tools
            .values()
            .skip(start)
            .take(self.page_size)
            .map(|handle| ToolInfo::from(handle.descriptor().definition()))
            .collect();
        let end = start + tools.len();
        let next_cursor = (end < self.tools.len()).then(|| end.to_string());

        Ok(serde_json::to_value(ListToolsResult { tools, next_cursor })?)
    }

    async fn handle_call_tool(&self, id: &RpcId, params: &Option<Value>) -> Result<Value, McpError> {
        let params = params
            .as_ref()
            .ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
        let params: CallToolParams =
            serde_json::from_value(params.clone()).map_err(|e| McpError::InvalidParams(e.to_string()))?;

        tracing::debug!(tool = %params.name, "handling tools/call");
        let handle = self
            .tools
            .get(&params.name)
            .ok_or_else(|| McpError::ToolNotFound(params.name.clone()))?;

        let call = ToolCall {
            id: id.to_string(),
            name: params.name,
            input: if params.arguments.is_null() {
                Value::Object(Default::default())
            } else {
                params.arguments
            },
            message_id: String::new(),
        };
        let mut ctx = ToolContext::new(self.working_directory.clone());
        ctx.call_id = call.id.clone();
        let result = handle.invoke(&call, &ctx, self.tool_timeout, CANCEL_GRACE).await;

        Ok(serde_json::to_value(CallToolResult::text(result.content, result.is_error))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use async_trait::async_trait;
    use tern_tool_runtime::tool::{EchoTool, Tool, ToolDescriptor, ToolError, ToolOutput};
    use tern_tool_runtime::tools::ListDirTool;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::transport::LineTransport;

    struct WipeTool;

    #[async_trait]
    impl Tool for WipeTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("wipe", "Erase everything", json!({"type": "object"}))
                .with_permission(PermissionClass::Never)
        }

        async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("wiped"))
        }
    }

    fn test_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        reg.register(ListDirTool).unwrap();
        reg
    }

    async fn initialized() -> McpServer {
        let mut server = McpServer::new(&test_registry()).unwrap();
        let req = JsonRpcRequest::new(
            RpcId::Number(1),
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test-client"}
            })),
        );
        let resp = server.handle_request(&req).await;
        assert!(resp.error.is_none());
        server
    }

    fn call(id: i64, name: &str, arguments: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(RpcId::Number(id), "tools/call", Some(json!({"name": name, "arguments": arguments})))
    }

    #[tokio::test]
    async fn test_tools_require_initialize() {
        let mut server = McpServer::new(&test_registry()).unwrap();
        let resp = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(1), "tools/list", None))
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_list_tools_pages() {
        let mut server = initialized().await.with_page_size(1);

        let first = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(2), "tools/list", None))
            .await;
        let first: ListToolsResult = serde_json::from_value(first.result.unwrap()).unwrap();
        assert_eq!(first.tools[0].name, "echo");
        assert_eq!(first.next_cursor.as_deref(), Some("1"));

        let second = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(3), "tools/list", Some(json!({"cursor": "1"}))))
            .await;
        let second: ListToolsResult = serde_json::from_value(second.result.unwrap()).unwrap();
        assert_eq!(second.tools[0].name, "list_dir");
        assert!(second.next_cursor.is_none());

        let bad = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(4), "tools/list", Some(json!({"cursor": "zz"}))))
            .await;
        assert_eq!(bad.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_call_tool() {
        let mut server = initialized().await;
        let resp = server.handle_request(&call(5, "echo", json!({"message": "hello mcp"}))).await;
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text_content(), "hello mcp");
    }

    #[tokio::test]
    async fn test_schema_violation_is_error_result() {
        let mut server = initialized().await;
        let resp = server.handle_request(&call(6, "echo", json!({"message": 42}))).await;
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(result.is_error);
        assert!(result.text_content().contains("schema"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_method() {
        let mut server = initialized().await;
        let resp = server.handle_request(&call(7, "nonexistent", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);

        let resp = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(8), "resources/list", None))
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_never_permitted_tools_are_not_served() {
        let mut registry = test_registry();
        registry.register(WipeTool).unwrap();
        let mut server = McpServer::new(&registry).unwrap();
        let req = JsonRpcRequest::new(
            RpcId::Number(1),
            "initialize",
            Some(json!({"protocolVersion": PROTOCOL_VERSION, "clientInfo": {"name": "test-client"}})),
        );
        assert!(server.handle_request(&req).await.error.is_none());

        let listed = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(2), "tools/list", None))
            .await;
        let listed: ListToolsResult = serde_json::from_value(listed.result.unwrap()).unwrap();
        let names: Vec<&str> = listed.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "list_dir"]);

        let resp = server.handle_request(&call(3, "wipe", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_unparseable_message_is_answered_with_null_id() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let mut server = McpServer::new(&test_registry()).unwrap();
        let serving = tokio::spawn(async move {
            let mut transport = LineTransport::new(BufReader::new(server_read), server_write);
            server.run(&mut transport).await
        });

        let (client_read, mut client_write) = tokio::io::split(client_io);
        client_write.write_all(b"{not json\n").await.unwrap();
        let mut lines = BufReader::new(client_read).lines();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], error_codes::PARSE_ERROR);

        drop(client_write);
        drop(lines);
        serving.await.unwrap().unwrap();
    }
}
