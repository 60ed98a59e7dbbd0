//! Client-side request/response channels.
//!
//! An [`RpcChannel`] correlates requests with responses. `StreamChannel`
//! speaks newline-delimited JSON over a byte stream with a background
//! reader task routing responses by id, so any number of callers may wait
//! concurrently. `HttpChannel` POSTs each message to a streamable HTTP
//! endpoint.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::types::*;

#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Allocate the id for the next request.
    fn next_id(&self) -> RpcId;

    /// Send a request under `id` and wait for its result.
    async fn request(&self, id: RpcId, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Release the connection. Requests still waiting fail.
    async fn close(&self);

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id();
        self.request(id, method, params).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn into_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    match response.error {
        Some(err) => Err(err.into()),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

// ── Byte streams ────────────────────────────────────────────────────

type Waiters = Mutex<HashMap<RpcId, oneshot::Sender<Result<Value, McpError>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Removes the waiter for `id` when the caller stops waiting.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    id: RpcId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.waiters).remove(&self.id);
    }
}

struct Shared {
    server: String,
    waiters: Waiters,
    closed: AtomicBool,
}

impl Shared {
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let waiters: Vec<_> = lock(&self.waiters).drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(self.unavailable()));
        }
    }

    fn unavailable(&self) -> McpError {
        McpError::ServerUnavailable(format!("connection to '{}' is closed", self.server))
    }
}

/// JSON-RPC over a bidirectional byte stream.
pub struct StreamChannel {
    shared: Arc<Shared>,
    writer: SharedWriter,
    next_id: AtomicI64,
    reader: JoinHandle<()>,
    child: Option<Mutex<Child>>,
}

impl StreamChannel {
    /// Wrap an already connected stream pair.
    pub fn new(
        server: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            server: server.into(),
            waiters: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));

        let loop_shared = Arc::clone(&shared);
        let loop_writer = Arc::clone(&writer);
        let reader = tokio::spawn(async move {
            read_loop(reader, &loop_shared, &loop_writer).await;
            loop_shared.fail_all();
        });

        Self {
            shared,
            writer,
            next_id: AtomicI64::new(1),
            reader,
            child: None,
        }
    }

    /// Launch a server process and talk to it over its stdin/stdout.
    pub fn spawn(
        server: impl Into<String>,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, McpError> {
        let server = server.into();
        info!(server = %server, command = %command, "spawning MCP server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ServerUnavailable("failed to capture server stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ServerUnavailable("failed to capture server stdout".to_string()))?;

        let mut channel = Self::new(server, stdout, stdin);
        channel.child = Some(Mutex::new(child));
        Ok(channel)
    }

    /// Requests currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.waiters).len()
    }
}

async fn write_line(writer: &SharedWriter, line: &str) -> Result<(), McpError> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop(reader: impl AsyncRead + Unpin, shared: &Shared, writer: &SharedWriter) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(server = %shared.server, "server closed its output");
                return;
            }
            Err(e) => {
                warn!(server = %shared.server, error = %e, "reading from server failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match IncomingMessage::parse(&line) {
            Ok(IncomingMessage::Response(response)) => {
                let waiter = lock(&shared.waiters).remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(into_result(response));
                    }
                    None => debug!(server = %shared.server, id = %response.id, "response to a request nobody is waiting on"),
                }
            }
            Ok(IncomingMessage::Request(request)) => {
                let response = if request.method == "ping" {
                    JsonRpcResponse::success(request.id, json!({}))
                } else {
                    JsonRpcResponse::error(request.id, McpError::MethodNotFound(request.method).to_rpc_error())
                };
                let sent = match serde_json::to_string(&response) {
                    Ok(json) => write_line(writer, &json).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!(server = %shared.server, error = %e, "failed to answer server request");
                }
            }
            Ok(IncomingMessage::Notification(notification)) => {
                debug!(server = %shared.server, method = %notification.method, "server notification");
            }
            Err(e) => warn!(server = %shared.server, error = %e, "unparseable message from server"),
        }
    }
}

#[async_trait]
impl RpcChannel for StreamChannel {
    fn next_id(&self) -> RpcId {
        RpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request(&self, id: RpcId, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let json = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.waiters).insert(id.clone(), tx);
        let _guard = WaiterGuard {
            waiters: &self.shared.waiters,
            id: id.clone(),
        };
        // The reader marks the channel closed before draining waiters.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(self.shared.unavailable());
        }

        debug!(server = %self.shared.server, method = %method, id = %id, "sending request");
        write_line(&self.writer, &json).await?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.shared.unavailable()),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(self.shared.unavailable());
        }
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        write_line(&self.writer, &json).await
    }

    async fn close(&self) {
        self.reader.abort();
        self.shared.fail_all();
        if let Some(child) = &self.child {
            if let Err(e) = lock(child).start_kill() {
                debug!(server = %self.shared.server, error = %e, "server process already gone");
            }
        }
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ── Streamable HTTP ─────────────────────────────────────────────────

/// JSON-RPC over HTTP POST, one message per request.
pub struct HttpChannel {
    server: String,
    url: String,
    headers: HeaderMap,
    client: reqwest::Client,
    session: Mutex<Option<String>>,
    next_id: AtomicI64,
}

impl HttpChannel {
    pub fn new(server: impl Into<String>, url: impl Into<String>, headers: &BTreeMap<String, String>) -> Result<Self, McpError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::InvalidParams(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::InvalidParams(format!("invalid value for header '{}': {}", name, e)))?;
            map.insert(header, value);
        }
        Ok(Self {
            server: server.into(),
            url: url.into(),
            headers: map,
            client: reqwest::Client::new(),
            session: Mutex::new(None),
            next_id: AtomicI64::new(1),
        })
    }

    /// Session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.session).clone()
    }

    async fn post(&self, body: &impl Serialize) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }
        let response = request.send().await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *lock(&self.session) = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http(format!("{} returned {}: {}", self.url, status, body.trim())));
        }
        Ok(response)
    }
}

/// Find the response to `id` in a `text/event-stream` body.
pub fn parse_sse_response(body: &str, id: &RpcId) -> Result<JsonRpcResponse, McpError> {
    for event in body.replace("\r\n", "\n").split("\n\n") {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        if data.is_empty() {
            continue;
        }
        match IncomingMessage::parse(&data.join("\n")) {
            Ok(IncomingMessage::Response(response)) if &response.id == id => return Ok(response),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "skipping unparseable event"),
        }
    }
    Err(McpError::Http(format!(
        "event stream ended without a response to request {}",
        id
    )))
}

#[async_trait]
impl RpcChannel for HttpChannel {
    fn next_id(&self) -> RpcId {
        RpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request(&self, id: RpcId, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        debug!(server = %self.server, method = %method, id = %id, "posting request");
        let response = self.post(&JsonRpcRequest::new(id.clone(), method, params)).await?;
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await?;

        let reply = if is_event_stream {
            parse_sse_response(&body, &id)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)?
        };
        into_result(reply)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.post(&JsonRpcNotification::new(method, params)).await?;
        Ok(())
    }

    async fn close(&self) {
        let Some(session) = self.session_id() else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await;
        if let Err(e) = result {
            debug!(server = %self.server, error = %e, "failed to end HTTP session");
        }
    }
}
