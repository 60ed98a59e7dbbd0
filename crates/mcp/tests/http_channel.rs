//! `HttpChannel` against a minimal HTTP/1.1 server on a local socket.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use tern_mcp::types::{PROTOCOL_VERSION, SESSION_HEADER};
use tern_mcp::{HttpChannel, McpClient, McpError, RpcChannel};
use tern_tool_runtime::permission::PermissionClass;
use tern_tool_runtime::tool::{Tool, ToolContext};

/// One request as the server saw it.
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    session: Option<String>,
    body: Option<Value>,
}

struct Reply {
    status: u16,
    content_type: &'static str,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Reply {
    fn json(body: Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn sse(body: Value) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            headers: Vec::new(),
            body: format!(": keepalive\n\nevent: message\ndata: {}\n\n", body),
        }
    }

    fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            headers: Vec::new(),
            body: body.to_string(),
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        _ => "Error",
    }
}

/// Serve connections until the test ends, answering each request with `handler`.
async fn serve<F>(handler: F) -> (String, Arc<Mutex<Vec<Seen>>>)
where
    F: Fn(&Seen) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/mcp", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);

    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let handler = Arc::clone(&handler);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);

                let mut request_line = String::new();
                reader.read_line(&mut request_line).await.unwrap();
                let method = request_line.split_whitespace().next().unwrap_or_default().to_string();

                let mut session = None;
                let mut length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    let (name, value) = line.split_once(':').unwrap();
                    let value = value.trim().to_string();
                    if name.eq_ignore_ascii_case("content-length") {
                        length = value.parse().unwrap();
                    } else if name.eq_ignore_ascii_case(SESSION_HEADER) {
                        session = Some(value);
                    }
                }
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).await.unwrap();

                let request = Seen {
                    method,
                    session,
                    body: serde_json::from_slice(&body).ok(),
                };
                let reply = (*handler)(&request);
                log.lock().unwrap().push(request);

                let mut head = format!(
                    "HTTP/1.1 {} {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n",
                    reply.status,
                    reason(reply.status),
                    reply.content_type,
                    reply.body.len()
                );
                for (name, value) in &reply.headers {
                    head.push_str(&format!("{}: {}\r\n", name, value));
                }
                head.push_str("\r\n");
                write.write_all(head.as_bytes()).await.unwrap();
                write.write_all(reply.body.as_bytes()).await.unwrap();
                write.shutdown().await.ok();
            });
        }
    });
    (url, seen)
}

/// A small MCP server: JSON for `initialize` and `tools/call`, SSE for
/// `tools/list`, 500 for anything unknown.
fn mcp_handler(request: &Seen) -> Reply {
    let Some(body) = &request.body else {
        return Reply::status(204, "");
    };
    let id = body.get("id").cloned();
    let method = body["method"].as_str().unwrap_or_default();
    match (method, id) {
        ("initialize", Some(id)) => {
            let mut reply = Reply::json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "http-fake"}
                }
            }));
            reply.headers.push((SESSION_HEADER, "sess-42".to_string()));
            reply
        }
        ("tools/list", Some(id)) => Reply::sse(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": [{"name": "shout", "inputSchema": {"type": "object"}}]}
        })),
        ("tools/call", Some(id)) => {
            let text = body["params"]["arguments"]["text"].as_str().unwrap_or_default().to_uppercase();
            Reply::json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": [{"type": "text", "text": text}]}
            }))
        }
        (_, None) => Reply::status(202, ""),
        (_, Some(_)) => Reply::status(500, "boom"),
    }
}

#[tokio::test]
async fn test_session_round_trip_and_reply_framings() {
    let (url, seen) = serve(mcp_handler).await;
    let channel = Arc::new(HttpChannel::new("fake", &url, &BTreeMap::new()).unwrap());
    let dyn_channel: Arc<dyn RpcChannel> = channel.clone();

    let client = Arc::new(
        McpClient::connect("fake", dyn_channel, Duration::from_secs(5))
            .await
            .unwrap(),
    );
    assert_eq!(client.server_info().name, "http-fake");
    assert_eq!(channel.session_id().as_deref(), Some("sess-42"));

    // tools/list is answered as an event stream
    let infos = client.list_tools().await.unwrap();
    assert_eq!(infos.len(), 1);

    // and the remote tool behaves like any other
    let tool = client.tools(infos, PermissionClass::Ask).pop().unwrap();
    let output = tool.execute(json!({"text": "hi"}), &ToolContext::new(".")).await.unwrap();
    assert_eq!(output.content, "HI");
    assert!(!output.is_error);

    let err = channel.call("resources/list", None).await.unwrap_err();
    assert!(matches!(&err, McpError::Http(msg) if msg.contains("500") && msg.contains("boom")));

    channel.close().await;

    let seen = seen.lock().unwrap().clone();
    let methods: Vec<(String, Option<String>)> = seen
        .iter()
        .map(|s| {
            let rpc = s
                .body
                .as_ref()
                .and_then(|b| b["method"].as_str())
                .unwrap_or("-")
                .to_string();
            (format!("{} {}", s.method, rpc), s.session.clone())
        })
        .collect();
    let session = Some("sess-42".to_string());
    assert_eq!(
        methods,
        vec![
            ("POST initialize".to_string(), None),
            ("POST notifications/initialized".to_string(), session.clone()),
            ("POST tools/list".to_string(), session.clone()),
            ("POST tools/call".to_string(), session.clone()),
            ("POST resources/list".to_string(), session.clone()),
            ("DELETE -".to_string(), session),
        ]
    );
}

#[tokio::test]
async fn test_close_without_session_sends_nothing() {
    let (url, seen) = serve(|_| Reply::status(500, "unexpected")).await;
    let channel = HttpChannel::new("fake", &url, &BTreeMap::new()).unwrap();

    channel.close().await;

    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_error_object_in_json_reply() {
    let (url, _) = serve(|request| {
        let id = request.body.as_ref().unwrap()["id"].clone();
        Reply::json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32602, "message": "bad cursor"}
        }))
    })
    .await;
    let channel = HttpChannel::new("fake", &url, &BTreeMap::new()).unwrap();

    let err = channel.call("tools/list", Some(json!({"cursor": "x"}))).await.unwrap_err();
    assert!(matches!(err, McpError::Rpc { code: -32602, .. }));
}
