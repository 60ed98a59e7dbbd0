//! Client and server talking over an in-memory byte stream.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use tern_mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcId, PROTOCOL_VERSION};
use tern_mcp::{LineTransport, McpClient, McpServer, McpServerConfig, McpToolSource, RpcChannel, StreamChannel};
use tern_tool_runtime::handle::HandleKind;
use tern_tool_runtime::permission::PermissionClass;
use tern_tool_runtime::resolver::{ToolResolver, ToolSource};
use tern_tool_runtime::tool::{EchoTool, Tool, ToolCall, ToolContext, ToolDescriptor, ToolError, ToolOutput};
use tern_tool_runtime::ToolRegistry;

struct UpperTool;

#[async_trait]
impl Tool for UpperTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "upper",
            "Uppercase text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
        )
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text(input["text"].as_str().unwrap_or_default().to_uppercase()))
    }
}

fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::named("remote-builtins");
    registry.register(EchoTool).unwrap();
    registry.register(UpperTool).unwrap();
    registry
}

/// Serve `registry()` on one end of a duplex and connect a client to the other.
async fn serve_and_connect(page_size: usize) -> Arc<McpClient> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let (server_read, server_write) = tokio::io::split(server_io);
    let mut server = McpServer::new(&registry()).unwrap().with_page_size(page_size);
    tokio::spawn(async move {
        let mut transport = LineTransport::new(BufReader::new(server_read), server_write);
        server.run(&mut transport).await
    });

    let (client_read, client_write) = tokio::io::split(client_io);
    let channel: Arc<dyn RpcChannel> = Arc::new(StreamChannel::new("memory", client_read, client_write));
    Arc::new(
        McpClient::connect("memory", channel, Duration::from_secs(5))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_handshake_and_paged_listing() {
    let client = serve_and_connect(1).await;
    assert_eq!(client.server_info().name, "tern");

    let names: Vec<String> = client.list_tools().await.unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo", "upper"]);

    let result = client.call_tool("upper", json!({"text": "shout"})).await.unwrap();
    assert_eq!(result.text_content(), "SHOUT");
    assert!(!result.is_error);
}

#[tokio::test]
async fn test_remote_tools_resolve_and_invoke_like_local_ones() {
    let client = serve_and_connect(100).await;
    let mut config = McpServerConfig::stdio("memory", "unused", vec![]);
    config.permission = PermissionClass::Always;
    let remote: Arc<dyn ToolSource> = Arc::new(McpToolSource::with_client(config, client));

    let mut local = ToolRegistry::new();
    local.register(EchoTool).unwrap();
    let sources: Vec<Arc<dyn ToolSource>> = vec![Arc::new(local), remote];

    let resolved = ToolResolver::default().resolve_all(&sources).await.unwrap();
    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved.overrides.len(), 1);
    assert_eq!(resolved.overrides[0].name, "echo");

    let upper = resolved.get("upper").unwrap();
    assert_eq!(upper.kind(), HandleKind::Remote);
    assert_eq!(upper.descriptor().permission, PermissionClass::Always);

    let call = ToolCall {
        id: "c1".to_string(),
        name: "upper".to_string(),
        input: json!({"text": "remote"}),
        message_id: String::new(),
    };
    let result = upper
        .invoke(&call, &ToolContext::new("."), None, Duration::from_millis(100))
        .await;
    assert_eq!(result.content, "REMOTE");

    // Checked locally against the advertised schema before any request is sent.
    let bad = ToolCall {
        input: json!({"text": 1}),
        ..call
    };
    let result = upper
        .invoke(&bad, &ToolContext::new("."), None, Duration::from_millis(100))
        .await;
    assert!(result.is_error);
    assert!(result.content.contains("schema"));
}

#[tokio::test]
async fn test_cancelled_call_notifies_server() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, mut server_write) = tokio::io::split(server_io);
    let mut lines = BufReader::new(server_read).lines();

    // A hand-driven server: answer the handshake and listing, then never
    // answer the tool call.
    let server = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            let raw: Value = serde_json::from_str(&line).unwrap();
            if raw.get("id").is_none() {
                let note: JsonRpcNotification = serde_json::from_value(raw).unwrap();
                let done = note.method == "notifications/cancelled";
                seen.push((note.method, note.params));
                if done {
                    return seen;
                }
                continue;
            }
            let request: JsonRpcRequest = serde_json::from_value(raw).unwrap();
            let result = match request.method.as_str() {
                "initialize" => json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "hand"}
                }),
                "tools/list" => json!({"tools": [{"name": "wait", "inputSchema": {"type": "object"}}]}),
                _ => {
                    seen.push((request.method.clone(), Some(json!({"id": request.id.clone()}))));
                    continue;
                }
            };
            let response = JsonRpcResponse::success(request.id, result);
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            server_write.write_all(out.as_bytes()).await.unwrap();
        }
        seen
    });

    let (client_read, client_write) = tokio::io::split(client_io);
    let channel: Arc<dyn RpcChannel> = Arc::new(StreamChannel::new("hand", client_read, client_write));
    let client = Arc::new(McpClient::connect("hand", channel, Duration::from_secs(5)).await.unwrap());
    let tool = client
        .tools(client.list_tools().await.unwrap(), PermissionClass::Ask)
        .pop()
        .unwrap();

    let ctx = ToolContext::new(".");
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let outcome = tool.execute(json!({}), &ctx).await;
    assert!(matches!(outcome, Err(ToolError::Cancelled)));

    let seen = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    let methods: Vec<&str> = seen.iter().map(|(m, _)| m.as_str()).collect();
    assert_eq!(
        methods,
        vec!["notifications/initialized", "tools/call", "notifications/cancelled"]
    );
    let call_id = seen[1].1.as_ref().unwrap()["id"].clone();
    let cancelled = seen[2].1.as_ref().unwrap();
    assert_eq!(cancelled["requestId"], call_id);
    assert_eq!(serde_json::from_value::<RpcId>(call_id).unwrap(), RpcId::Number(3));
}
