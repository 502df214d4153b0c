//! MCP manager — holds all MCP server connections and orchestrates tool
//! discovery and dispatch.
//!
//! Each configured server moves through `Disconnected -> Connecting ->
//! Connected` or `Error`. A server that fails to connect or whose transport
//! dies is marked `Error` and excluded from the tool catalogue; it never
//! takes down the other servers.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use sa_domain::config::{McpConfig, McpServerConfig, McpTransportKind};
use sa_tools::{RemoteProvider, ToolDefinition, ToolOutput};

use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{McpTransport, SseTransport, StdioTransport, TransportError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderStatus::Disconnected => "disconnected",
            ProviderStatus::Connecting => "connecting",
            ProviderStatus::Connected => "connected",
            ProviderStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A point-in-time snapshot of a server's connection state, for status UIs.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: String,
    pub status: ProviderStatus,
    pub tool_count: usize,
    pub last_error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live MCP server connection (one per configured server).
struct McpServer {
    config: McpServerConfig,
    tools: Vec<McpToolDef>,
    transport: Box<dyn McpTransport>,
}

impl McpServer {
    /// Spawn the transport, perform the MCP handshake, and discover tools.
    async fn initialize(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => {
                let t = StdioTransport::spawn(config).map_err(McpError::Transport)?;
                Box::new(t)
            }
            McpTransportKind::Sse => {
                let t = SseTransport::connect(config).map_err(McpError::Transport)?;
                Box::new(t)
            }
        };

        let init_params = protocol::initialize_params();
        let params_value = serde_json::to_value(&init_params)
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;

        let resp = transport
            .send_request("initialize", Some(params_value))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            let err = resp.error.unwrap();
            return Err(McpError::Protocol(format!("initialize failed: {err}")));
        }

        tracing::debug!(server_id = %config.id, "MCP initialize response received");

        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(McpError::Transport)?;

        tracing::debug!(server_id = %config.id, "sent notifications/initialized");

        let tools_resp = transport
            .send_request("tools/list", None)
            .await
            .map_err(McpError::Transport)?;

        let tools = if tools_resp.is_error() {
            tracing::warn!(server_id = %config.id, "tools/list returned error, server will have no tools");
            Vec::new()
        } else {
            let result_value = tools_resp.result.unwrap_or(Value::Null);
            match serde_json::from_value::<ToolsListResult>(result_value) {
                Ok(r) => r.tools,
                Err(e) => {
                    tracing::warn!(server_id = %config.id, error = %e, "failed to parse tools/list result");
                    Vec::new()
                }
            }
        };

        tracing::info!(server_id = %config.id, tool_count = tools.len(), "MCP server initialized");

        Ok(Self {
            config: config.clone(),
            tools,
            transport,
        })
    }

    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.config.id.clone()));
        }

        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });

        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            let err = resp.error.unwrap();
            return Err(McpError::Protocol(format!("tools/call failed: {err}")));
        }

        let result_value = resp.result.unwrap_or(Value::Null);
        serde_json::from_value::<ToolCallResult>(result_value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }

    async fn shutdown(&self) {
        tracing::info!(server_id = %self.config.id, "shutting down MCP server");
        self.transport.shutdown().await;
    }
}

/// State for one configured server: its connection (if any) plus bookkeeping
/// that survives across reconnect attempts.
struct ServerEntry {
    config: McpServerConfig,
    status: ProviderStatus,
    last_error: Option<String>,
    server: Option<McpServer>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Manager that holds all MCP server connections and the merged tool
/// catalogue built from the servers currently connected.
///
/// When two connected servers expose a tool of the same name, the catalogue
/// keeps whichever was registered most recently (last-registration-wins),
/// logging the collision so it doesn't pass silently.
pub struct McpManager {
    entries: RwLock<HashMap<String, ServerEntry>>,
    catalogue: RwLock<HashMap<String, McpToolDef>>,
    /// tool name -> owning server id, kept in lockstep with `catalogue`.
    tool_owner: RwLock<HashMap<String, String>>,
}

impl McpManager {
    /// Create an empty manager (no MCP servers configured).
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            catalogue: RwLock::new(HashMap::new()),
            tool_owner: RwLock::new(HashMap::new()),
        }
    }

    /// Initialize from config: connect each configured server independently.
    /// A server that fails to connect is logged and marked `Error`, never
    /// fatal to the manager as a whole.
    pub async fn from_config(config: &McpConfig) -> Self {
        let manager = Self::empty();
        for server_config in &config.servers {
            manager.connect(server_config.clone()).await;
        }
        manager
    }

    /// Connect (or reconnect) a single server, recording its config so a
    /// later `reconnect` doesn't need it passed back in.
    pub async fn connect(&self, config: McpServerConfig) {
        let id = config.id.clone();
        {
            let mut entries = self.entries.write();
            entries.insert(
                id.clone(),
                ServerEntry {
                    config: config.clone(),
                    status: ProviderStatus::Connecting,
                    last_error: None,
                    server: None,
                },
            );
        }

        tracing::info!(server_id = %id, transport = ?config.transport, "connecting MCP server");

        match McpServer::initialize(&config).await {
            Ok(server) => {
                let mut entries = self.entries.write();
                if let Some(entry) = entries.get_mut(&id) {
                    entry.status = ProviderStatus::Connected;
                    entry.last_error = None;
                    entry.server = Some(server);
                }
            }
            Err(e) => {
                tracing::warn!(server_id = %id, error = %e, "failed to connect MCP server");
                let mut entries = self.entries.write();
                if let Some(entry) = entries.get_mut(&id) {
                    entry.status = ProviderStatus::Error;
                    entry.last_error = Some(e.to_string());
                    entry.server = None;
                }
            }
        }

        self.rebuild_catalogue();
    }

    /// Tear down a server's transport and mark it disconnected. Always
    /// succeeds: a transport that refuses to shut down cleanly still gets
    /// dropped from the catalogue.
    pub async fn disconnect(&self, id: &str) {
        let server = {
            let mut entries = self.entries.write();
            entries.get_mut(id).and_then(|e| {
                e.status = ProviderStatus::Disconnected;
                e.server.take()
            })
        };
        if let Some(server) = server {
            server.shutdown().await;
        }
        self.rebuild_catalogue();
    }

    /// Disconnect then reconnect using the server's last-known config.
    pub async fn reconnect(&self, id: &str) -> Result<(), McpError> {
        let config = {
            let entries = self.entries.read();
            entries
                .get(id)
                .map(|e| e.config.clone())
                .ok_or_else(|| McpError::ServerNotFound(id.to_string()))?
        };
        self.disconnect(id).await;
        self.connect(config).await;
        Ok(())
    }

    /// Rebuild the merged tool-name -> definition catalogue from currently
    /// connected servers. Collisions keep the later server in (sorted) id
    /// order and are logged, matching last-registration-wins semantics.
    fn rebuild_catalogue(&self) {
        let entries = self.entries.read();
        let mut catalogue = HashMap::new();
        let mut owner = HashMap::new();

        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort();

        for id in ids {
            let entry = &entries[id];
            let Some(server) = entry.server.as_ref() else { continue };
            if entry.status != ProviderStatus::Connected || !server.is_alive() {
                continue;
            }
            for tool in &server.tools {
                if let Some(prev_owner) = owner.get(&tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        previous_owner = %prev_owner,
                        new_owner = %id,
                        "tool name collision across MCP servers, keeping most recently registered"
                    );
                }
                catalogue.insert(tool.name.clone(), tool.clone());
                owner.insert(tool.name.clone(), id.clone());
            }
        }

        drop(entries);
        *self.catalogue.write() = catalogue;
        *self.tool_owner.write() = owner;
    }

    /// Get all discovered tools across all connected servers.
    pub fn list_tools(&self) -> Vec<McpToolDef> {
        self.catalogue.read().values().cloned().collect()
    }

    /// Call a tool by name, routing to whichever server currently owns it
    /// in the catalogue. Holds the entries read lock for the duration of
    /// the transport round trip; this serializes calls against concurrent
    /// connect/disconnect but not against other tool calls, since
    /// `RwLock` allows multiple readers.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let owner_id = self
            .tool_owner
            .read()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(format!("no owner for tool {tool_name}")))?;

        let entries = self.entries.read();
        let entry = entries
            .get(&owner_id)
            .ok_or_else(|| McpError::ServerNotFound(owner_id.clone()))?;
        let server = entry
            .server
            .as_ref()
            .ok_or_else(|| McpError::ServerDown(owner_id.clone()))?;
        server.call_tool(tool_name, arguments).await
    }

    /// Snapshot of every configured server's current status.
    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        let entries = self.entries.read();
        let mut out: Vec<ServerStatus> = entries
            .values()
            .map(|e| ServerStatus {
                id: e.config.id.clone(),
                status: e.status,
                tool_count: e.server.as_ref().map(|s| s.tools.len()).unwrap_or(0),
                last_error: e.last_error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn server_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn tool_count(&self) -> usize {
        self.catalogue.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Gracefully shut down all servers concurrently. A server whose
    /// transport fails to tear down cleanly is logged, not propagated —
    /// shutdown never partially fails the manager as a whole.
    pub async fn shutdown(&self) {
        let servers: Vec<McpServer> = {
            let mut entries = self.entries.write();
            entries.values_mut().filter_map(|e| e.server.take()).collect()
        };
        let futs: Vec<_> = servers.iter().map(|s| s.shutdown()).collect();
        futures_util::future::join_all(futs).await;
        *self.catalogue.write() = HashMap::new();
        *self.tool_owner.write() = HashMap::new();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RemoteProvider bridge — lets a ToolRegistry dispatch into MCP servers
// without sa-tools depending on sa-mcp-client.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl RemoteProvider for McpManager {
    fn list_tools(&self) -> Vec<ToolDefinition> {
        self.list_tools()
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            })
            .collect()
    }

    async fn dispatch(&self, tool_name: &str, arguments: Value) -> Option<Result<ToolOutput, String>> {
        if !self.tool_owner.read().contains_key(tool_name) {
            return None;
        }
        Some(
            self.call_tool(tool_name, arguments)
                .await
                .map(|result| {
                    let text = result
                        .content
                        .iter()
                        .map(|c| c.text.clone())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if result.is_error {
                        ToolOutput::error(text)
                    } else {
                        ToolOutput::text(text)
                    }
                })
                .map_err(|e| e.to_string()),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server is down: {0}")]
    ServerDown(String),
}

impl From<McpError> for sa_domain::error::Error {
    fn from(e: McpError) -> Self {
        sa_domain::error::Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manager_has_no_tools() {
        let manager = McpManager::empty();
        assert!(manager.is_empty());
        assert_eq!(manager.tool_count(), 0);
        assert!(manager.list_tools().is_empty());
    }

    #[tokio::test]
    async fn connecting_with_unresolvable_command_marks_error_status() {
        let manager = McpManager::empty();
        manager
            .connect(McpServerConfig {
                id: "broken".into(),
                transport: McpTransportKind::Stdio,
                command: "definitely-not-a-real-binary-xyz".into(),
                args: vec![],
                env: Default::default(),
                url: None,
                connect_timeout_secs: 5,
            })
            .await;
        let statuses = manager.server_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, ProviderStatus::Error);
        assert!(statuses[0].last_error.is_some());
    }

    #[tokio::test]
    async fn connecting_sse_with_blocked_url_marks_error_status() {
        let manager = McpManager::empty();
        manager
            .connect(McpServerConfig {
                id: "local-sse".into(),
                transport: McpTransportKind::Sse,
                command: String::new(),
                args: vec![],
                env: Default::default(),
                url: Some("http://127.0.0.1:9/sse".into()),
                connect_timeout_secs: 5,
            })
            .await;
        let statuses = manager.server_statuses();
        assert_eq!(statuses[0].status, ProviderStatus::Error);
    }

    #[tokio::test]
    async fn disconnect_on_unknown_server_is_a_no_op() {
        let manager = McpManager::empty();
        manager.disconnect("nope").await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn reconnect_unknown_server_is_an_error() {
        let manager = McpManager::empty();
        assert!(manager.reconnect("nope").await.is_err());
    }

    #[test]
    fn remote_provider_list_tools_empty_when_no_servers() {
        let manager = McpManager::empty();
        let defs = RemoteProvider::list_tools(&manager);
        assert!(defs.is_empty());
    }
}
