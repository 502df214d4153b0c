//! MCP transport layer.
//!
//! Each MCP server communicates over a transport. Currently supported:
//! - **Stdio**: spawn a child process, send JSON-RPC over stdin/stdout.
//! - **Sse**: HTTP event-stream transport, POST for requests, guarded by
//!   an SSRF check on the configured URL.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use sa_domain::config::McpServerConfig;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the corresponding response.
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError>;

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// Shut down the transport gracefully.
    async fn shutdown(&self);
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("transport not supported: {0}")]
    Unsupported(String),

    #[error("refused to connect: {0}")]
    Blocked(String),

    #[error("HTTP transport error: {0}")]
    Http(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSRF validation, ported from the reference mcp_manager's
// `_validate_sse_url` / `_BLOCKED_NETWORKS`.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "metadata.google.internal"];

/// Returns true if `addr` falls in a network an SSE MCP server must not be
/// allowed to reach: loopback, RFC1918 private space, link-local, unique
/// local (IPv6), or the cloud-metadata link-local range.
fn is_blocked_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_link_local()
                || o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 169 && o[1] == 254)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || ((v6.segments()[0] & 0xfe00) == 0xfc00) // fc00::/7 unique local
                || ((v6.segments()[0] & 0xffc0) == 0xfe80) // fe80::/10 link local
        }
    }
}

/// Validates that a configured SSE URL neither targets a blocked hostname
/// alias nor resolves to a private/loopback/link-local address.
pub fn validate_sse_url(url: &str) -> Result<reqwest::Url, TransportError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| TransportError::Blocked(format!("invalid URL: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(TransportError::Blocked(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::Blocked("URL has no host".to_string()))?;

    if BLOCKED_HOSTNAMES.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        return Err(TransportError::Blocked(format!(
            "refusing to connect to blocked hostname: {host}"
        )));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(TransportError::Blocked(format!(
                "refusing to connect to private/loopback address: {ip}"
            )));
        }
    }

    Ok(parsed)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum number of non-JSON lines to skip before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Checks that a stdio MCP server's executable resolves to something runnable
/// (either an absolute/relative path that exists, or a name found on `PATH`).
pub fn validate_stdio_command(command: &str) -> Result<(), TransportError> {
    if command.trim().is_empty() {
        return Err(TransportError::Blocked("empty command".to_string()));
    }
    let path = std::path::Path::new(command);
    if path.is_absolute() || command.contains('/') {
        if !path.exists() {
            return Err(TransportError::Blocked(format!(
                "command not found: {command}"
            )));
        }
        return Ok(());
    }
    let found = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).exists()))
        .unwrap_or(false);
    if found {
        Ok(())
    } else {
        Err(TransportError::Blocked(format!(
            "command not found on PATH: {command}"
        )))
    }
}

/// Stdio transport: communicates with a child process over stdin/stdout.
///
/// Each JSON-RPC message is a single newline-delimited line.
/// The `request_lock` serializes entire request/response cycles to prevent
/// response mismatching when multiple callers use the same server.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    /// Serializes full request/response cycles to prevent response mismatching.
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
    pid: Option<u32>,
}

impl StdioTransport {
    /// Spawn a child process from the given server config.
    ///
    /// `kill_on_drop` is set so a handshake failure after a successful spawn
    /// (e.g. `initialize` timing out) can't orphan the child — dropping the
    /// `Box<dyn McpTransport>` on any `McpServer::initialize` error path
    /// kills it without needing an explicit `shutdown().await` at each
    /// `?` site.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        validate_stdio_command(&config.command)?;

        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Set additional environment variables if configured.
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Io)?;
        let pid = child.id();
        tracing::debug!(pid, command = %config.command, "spawned MCP server child process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            )))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            )))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            pid,
        })
    }

    /// The child's OS pid, if it was still running at spawn time. Exposed
    /// for diagnostics and tests; not part of the `McpTransport` trait since
    /// `SseTransport` has no process to report.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Get the next unique request ID.
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Write a line of JSON to stdin.
    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read a line of JSON from stdout, skipping any empty or non-JSON lines.
    ///
    /// Gives up after [`MAX_SKIP_LINES`] non-JSON lines to prevent spinning
    /// on a misconfigured server that writes logging to stdout.
    async fn read_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

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
            // Skip lines that don't look like JSON (e.g. stderr leaking).
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "MCP server produced too many non-JSON lines on stdout",
                )));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP server stdout");
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError> {
        // Serialize the entire request/response cycle so concurrent callers
        // cannot read each other's responses.
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending MCP request");
        self.write_line(&json).await?;

        // Read lines until we get a response matching our ID.
        // MCP servers may send notifications between request/response pairs;
        // we skip those (they have no `id` field).
        let timeout = tokio::time::Duration::from_secs(30);
        let result = tokio::time::timeout(timeout, async {
            loop {
                let line = self.read_line().await?;
                // Try to parse as a response first.
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                    tracing::debug!(
                        expected_id = id,
                        got_id = resp.id,
                        "received response for different request, continuing"
                    );
                }
                // Otherwise it might be a notification or something else; skip it.
                tracing::debug!(line = %line, "skipping non-matching message from MCP server");
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let json = serde_json::to_string(&notif)?;
        tracing::debug!(method, "sending MCP notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        // Close stdin to signal the process to exit.
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }
        // Give the process a moment to exit gracefully.
        let timeout = tokio::time::timeout(
            tokio::time::Duration::from_secs(5),
            child.wait(),
        )
        .await;
        match timeout {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "MCP server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for MCP server process");
            }
            Err(_) => {
                tracing::warn!("MCP server process did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP transport for MCP servers exposed over an event-stream endpoint.
///
/// Requests are sent as individual JSON POSTs to the server's `url`; this
/// repo targets MCP servers implementing the streamable-HTTP request/response
/// shape rather than a long-lived SSE subscription, since that's sufficient
/// for `tools/list` and `tools/call`.
pub struct SseTransport {
    url: reqwest::Url,
    client: reqwest::Client,
    next_id: AtomicU64,
    alive: AtomicBool,
    request_timeout: std::time::Duration,
}

impl SseTransport {
    pub fn connect(config: &McpServerConfig) -> Result<Self, TransportError> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| TransportError::Blocked("sse transport requires a url".to_string()))?;
        let url = validate_sse_url(raw)?;
        let timeout = std::time::Duration::from_secs(config.connect_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            url,
            client,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            request_timeout: timeout,
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let result = tokio::time::timeout(self.request_timeout, async {
            self.client
                .post(self.url.clone())
                .json(&req)
                .send()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let notif = JsonRpcNotification::new(method);
        self.client
            .post(self.url.clone())
            .json(&notif)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback_sse_url() {
        assert!(validate_sse_url("http://127.0.0.1:8080/sse").is_err());
        assert!(validate_sse_url("http://localhost:8080/sse").is_err());
    }

    #[test]
    fn rejects_private_ranges() {
        assert!(validate_sse_url("http://10.0.0.5/sse").is_err());
        assert!(validate_sse_url("http://172.16.1.1/sse").is_err());
        assert!(validate_sse_url("http://192.168.1.1/sse").is_err());
        assert!(validate_sse_url("http://169.254.169.254/sse").is_err());
    }

    #[test]
    fn rejects_metadata_hostname() {
        assert!(validate_sse_url("http://metadata.google.internal/compute").is_err());
    }

    #[test]
    fn accepts_public_https_url() {
        assert!(validate_sse_url("https://mcp.example.com/sse").is_ok());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(validate_sse_url("ftp://example.com/sse").is_err());
    }

    #[test]
    fn validate_stdio_command_finds_path_executable() {
        assert!(validate_stdio_command("sh").is_ok());
    }

    #[test]
    fn validate_stdio_command_rejects_missing_absolute_path() {
        assert!(validate_stdio_command("/nonexistent/bin/not-a-real-tool").is_err());
    }

    #[test]
    fn validate_stdio_command_rejects_empty() {
        assert!(validate_stdio_command("").is_err());
    }

    fn stdio_config(command: &str, args: &[&str]) -> McpServerConfig {
        McpServerConfig {
            id: "t".into(),
            transport: sa_domain::config::McpTransportKind::Stdio,
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Default::default(),
            url: None,
            connect_timeout_secs: 5,
        }
    }

    fn process_alive(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    // Regression test for the partial-startup leak: a handshake failure
    // after a successful spawn drops the `StdioTransport` without anyone
    // calling `shutdown()`. `kill_on_drop` must still reap the child.
    #[tokio::test]
    async fn dropping_transport_without_shutdown_kills_the_child() {
        let config = stdio_config("sleep", &["30"]);
        let transport = StdioTransport::spawn(&config).expect("spawn should succeed");
        let pid = transport.pid().expect("child should report a pid");
        assert!(process_alive(pid));

        drop(transport);

        let mut still_alive = true;
        for _ in 0..100 {
            if !process_alive(pid) {
                still_alive = false;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!still_alive, "child process {pid} leaked past transport drop");
    }
}
