//! Transports to a tool server.
//!
//! - **Stdio**: spawn a child process, one JSON-RPC message per line on
//!   stdin/stdout.
//! - **Http**: POST each message to one endpoint. The reply is either a
//!   JSON body or an SSE stream carrying the response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use na_domain::config::McpServerConfig;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Grace period for a stdio server to exit after stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait up to `timeout` for the matching response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError>;

    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    /// Release the connection. Stdio servers get stdin closed, a grace
    /// period, then a kill.
    async fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no response for request {0} in server reply")]
    MissingResponse(u64),
}

impl TransportError {
    /// Whether the connection should be considered dead after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Json(_) | TransportError::MissingResponse(_) => false,
            TransportError::Status { status, .. } => *status >= 500 || *status == 404,
            TransportError::Io(_) | TransportError::ProcessExited | TransportError::Http(_) => true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum number of non-JSON lines to skip before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Child process speaking newline-delimited JSON-RPC.
///
/// `request_lock` serializes whole request/response cycles, so concurrent
/// callers on one server never read each other's responses.
pub struct StdioTransport {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "failed to capture child stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "failed to capture child stdout")
        })?;

        // Servers log on stderr; drain it so they never block on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, line = %line, "tool server stderr");
                }
            });
        }

        Ok(Self {
            server: config.name.clone(),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::ProcessExited)?;
        let result = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if result.is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
        result.map_err(TransportError::from)
    }

    /// Next JSON-looking line from stdout. Gives up after
    /// [`MAX_SKIP_LINES`] lines of non-JSON output.
    async fn read_line(&self) -> Result<String, TransportError> {
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "tool server produced too many non-JSON lines on stdout",
                )));
            }
            tracing::debug!(server = %self.server, line = %trimmed, "skipping non-JSON stdout line");
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!(server = %self.server, id, method, "sending tool server request");
        self.write_line(&json).await?;

        // Notifications and late responses to timed-out requests are skipped.
        let result = tokio::time::timeout(timeout, async {
            loop {
                let line = self.read_line().await?;
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(resp) if resp.id == id => return Ok(resp),
                    Ok(resp) => {
                        tracing::debug!(expected_id = id, got_id = resp.id, "stale response skipped")
                    }
                    Err(_) => tracing::debug!(line = %line, "non-response message skipped"),
                }
            }
        })
        .await;

        result.unwrap_or(Err(TransportError::Timeout))
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Dropping stdin is what signals EOF to the server.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(server = %self.server, ?status, "tool server exited"),
            Ok(Err(e)) => tracing::warn!(server = %self.server, error = %e, "error waiting for tool server"),
            Err(_) => {
                tracing::warn!(server = %self.server, "tool server did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.server, error = %e, "failed to kill tool server");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable-HTTP client. Safe for concurrent requests: each is its own
/// HTTP exchange, matched by id within its own reply.
pub struct HttpTransport {
    server: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: parking_lot::Mutex<Option<String>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: &McpServerConfig) -> Result<Self, TransportError> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| TransportError::Http("http transport needs a url".into()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            server: config.name.clone(),
            url,
            headers: config.headers.clone(),
            client,
            session_id: parking_lot::Mutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn post(&self, body: String) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);
        for (k, v) in &self.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Some(sid) = self.session_id() {
            rb = rb.header(SESSION_HEADER, sid);
        }
        rb
    }

    async fn exchange(&self, id: u64, body: String) -> Result<JsonRpcResponse, TransportError> {
        let resp = self.post(body).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(sid.to_string());
        }

        let status = resp.status();
        if !status.is_success() {
            if status.as_u16() == 404 {
                // The server forgot our session; the next connect starts fresh.
                *self.session_id.lock() = None;
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        let is_sse = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_sse {
            let bytes = resp.bytes().await.map_err(|e| TransportError::Http(e.to_string()))?;
            return Ok(serde_json::from_slice(&bytes)?);
        }

        // Read events until the one carrying our response arrives.
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Http(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            for data in drain_sse_data(&mut buf) {
                if let Some(resp) = match_response(&data, id) {
                    return Ok(resp);
                }
            }
        }
        buf.push_str("\n\n");
        drain_sse_data(&mut buf)
            .iter()
            .find_map(|data| match_response(data, id))
            .ok_or(TransportError::MissingResponse(id))
    }
}

fn match_response(data: &str, id: u64) -> Option<JsonRpcResponse> {
    serde_json::from_str::<JsonRpcResponse>(data)
        .ok()
        .filter(|r| r.id == id)
}

/// Pop complete SSE events from `buf`, returning their joined `data:` lines.
fn drain_sse_data(buf: &mut String) -> Vec<String> {
    if buf.contains('\r') {
        *buf = buf.replace("\r\n", "\n");
    }
    let mut out = Vec::new();
    while let Some(pos) = buf.find("\n\n") {
        let event: String = buf.drain(..pos + 2).collect();
        let data: Vec<&str> = event
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if !data.is_empty() {
            out.push(data.join("\n"));
        }
    }
    out
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!(server = %self.server, id, method, "sending tool server request");

        let result = tokio::time::timeout(timeout, self.exchange(id, body))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        if let Err(e) = &result {
            if e.is_fatal() {
                self.alive.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let body = serde_json::to_string(&JsonRpcNotification::new(method))?;
        let resp = self
            .post(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let Some(sid) = self.session_id.lock().take() else {
            return;
        };
        let mut rb = self.client.delete(&self.url).header(SESSION_HEADER, sid);
        for (k, v) in &self.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Err(e) = rb.timeout(SHUTDOWN_GRACE).send().await {
            tracing::debug!(server = %self.server, error = %e, "session delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn sse_data_lines_are_joined_per_event() {
        let mut buf = String::from("event: message\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\ndata: x\n\npartial");
        let events = drain_sse_data(&mut buf);
        assert_eq!(events, vec!["{\"a\":\n1}".to_string(), "x".to_string()]);
        assert_eq!(buf, "partial");
    }

    #[test]
    fn fatal_errors_are_connection_level() {
        assert!(TransportError::ProcessExited.is_fatal());
        assert!(!TransportError::Timeout.is_fatal());
        assert!(TransportError::Status { status: 502, body: String::new() }.is_fatal());
        assert!(!TransportError::Status { status: 400, body: String::new() }.is_fatal());
    }

    /// Serves canned replies and records each request head.
    async fn serve(listener: TcpListener, replies: Vec<String>, seen: Arc<parking_lot::Mutex<Vec<String>>>) {
        for reply in replies {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + len {
                        break;
                    }
                }
            }
            seen.lock().push(String::from_utf8_lossy(&raw).to_string());
            let _ = sock.write_all(reply.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    }

    fn http_reply(extra_headers: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn http_transport_reads_sse_and_reuses_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        tokio::spawn(serve(
            listener,
            vec![
                http_reply(
                    "Mcp-Session-Id: sess-42\r\n",
                    "text/event-stream",
                    "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n",
                ),
                http_reply("", "application/json", r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#),
            ],
            seen.clone(),
        ));

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer t0k".to_string());
        let cfg = McpServerConfig {
            name: "remote".into(),
            transport: na_domain::config::McpTransportKind::Http,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url),
            headers,
            tool_timeout_secs: None,
        };
        let t = HttpTransport::new(&cfg).unwrap();

        let first = t
            .send_request("initialize", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first.into_result().unwrap()["ok"], true);
        assert_eq!(t.session_id().as_deref(), Some("sess-42"));

        let second = t
            .send_request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second.id, 2);

        let requests = seen.lock().clone();
        assert_eq!(requests.len(), 2);
        let first_req = requests[0].to_ascii_lowercase();
        let second_req = requests[1].to_ascii_lowercase();
        assert!(first_req.contains("authorization: bearer t0k"));
        assert!(!first_req.contains("mcp-session-id"));
        assert!(second_req.contains("mcp-session-id: sess-42"));
    }
}
