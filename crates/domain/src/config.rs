use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM completion endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_completion_url")]
    pub completion_endpoint: String,
    #[serde(default = "d_model")]
    pub model: String,
    /// Secondary model used for compaction summaries and titles; falls back to `model`.
    #[serde(default)]
    pub summarizer_model: Option<String>,
    #[serde(default = "d_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "d_true")]
    pub verify_tls: bool,
    #[serde(default = "d_max_tool_iterations")]
    pub max_tool_iterations: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            completion_endpoint: d_completion_url(),
            model: d_model(),
            summarizer_model: None,
            system_prompt: d_system_prompt(),
            api_key_env: None,
            verify_tls: true,
            max_tool_iterations: d_max_tool_iterations(),
        }
    }
}

fn d_completion_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_system_prompt() -> String {
    "You are a helpful local assistant with access to tools.".into()
}
fn d_true() -> bool {
    true
}
fn d_max_tool_iterations() -> usize {
    25
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_data_root")]
    pub data_root: PathBuf,
    /// Name of the primary database file under `data_root` (without extension).
    #[serde(default = "d_db_name")]
    pub database_name: String,
    #[serde(default = "d_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_root: d_data_root(),
            database_name: d_db_name(),
            max_attachment_bytes: d_max_attachment_bytes(),
        }
    }
}

fn d_data_root() -> PathBuf {
    PathBuf::from("./data")
}
fn d_db_name() -> String {
    "personal".into()
}
fn d_max_attachment_bytes() -> u64 {
    10 * 1024 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP front-end
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3210
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "d_true")]
    pub builtin_enabled: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            builtin_enabled: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP / tool providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub transport: McpTransportKind,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "d_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn d_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Sse,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "d_approval_timeout_secs")]
    pub wait_timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: d_approval_timeout_secs(),
        }
    }
}

fn d_approval_timeout_secs() -> u64 {
    300
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "d_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "d_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "d_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: d_poll_interval_ms(),
            retention_secs: d_retention_secs(),
            subscriber_capacity: d_subscriber_capacity(),
        }
    }
}

fn d_poll_interval_ms() -> u64 {
    1500
}
fn d_retention_secs() -> u64 {
    600
}
fn d_subscriber_capacity() -> usize {
    256
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "d_true")]
    pub auto: bool,
    #[serde(default = "d_max_turns")]
    pub max_turns: usize,
    #[serde(default = "d_keep_last_turns")]
    pub keep_last_turns: usize,
    #[serde(default = "d_warn_threshold_tokens")]
    pub warn_threshold_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            max_turns: d_max_turns(),
            keep_last_turns: d_keep_last_turns(),
            warn_threshold_tokens: d_warn_threshold_tokens(),
        }
    }
}

fn d_max_turns() -> usize {
    20
}
fn d_keep_last_turns() -> usize {
    6
}
fn d_warn_threshold_tokens() -> usize {
    12_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "d_log_filter")]
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: d_log_filter(),
        }
    }
}

fn d_log_filter() -> String {
    "info".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if self.llm.completion_endpoint.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "llm.completion_endpoint".into(),
                message: "completion_endpoint must not be empty".into(),
            });
        } else if !self.llm.completion_endpoint.starts_with("http://")
            && !self.llm.completion_endpoint.starts_with("https://")
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "llm.completion_endpoint".into(),
                message: format!(
                    "completion_endpoint must start with http:// or https:// (got \"{}\")",
                    self.llm.completion_endpoint
                ),
            });
        }

        if self.llm.api_key_env.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "llm.api_key_env".into(),
                message: "no api_key_env set; requests will be sent unauthenticated".into(),
            });
        }

        if self.llm.max_tool_iterations == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "llm.max_tool_iterations".into(),
                message: "max_tool_iterations must be greater than 0".into(),
            });
        }

        for server in &self.mcp.servers {
            if server.id.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "mcp.servers[].id".into(),
                    message: "server id must not be empty".into(),
                });
            }
            match server.transport {
                McpTransportKind::Stdio if server.command.is_empty() => {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("mcp.servers[{}].command", server.id),
                        message: "stdio transport requires a command".into(),
                    });
                }
                McpTransportKind::Sse if server.url.is_none() => {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("mcp.servers[{}].url", server.id),
                        message: "sse transport requires a url".into(),
                    });
                }
                _ => {}
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server.port, 3210);
        assert_eq!(cfg.llm.max_tool_iterations, 25);
        assert_eq!(cfg.event_bus.poll_interval_ms, 1500);
        assert_eq!(cfg.approval.wait_timeout_secs, 300);
    }

    #[test]
    fn mcp_server_config_transport_defaults_to_stdio() {
        let raw = r#"{ "id": "fs", "command": "npx" }"#;
        let cfg: McpServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.transport, McpTransportKind::Stdio);
        assert_eq!(cfg.connect_timeout_secs, 30);
    }

    #[test]
    fn mcp_server_config_sse() {
        let raw = r#"{ "id": "remote", "transport": "sse", "url": "http://localhost:8080/sse" }"#;
        let cfg: McpServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.transport, McpTransportKind::Sse);
        assert_eq!(cfg.url.as_deref(), Some("http://localhost:8080/sse"));
    }

    #[test]
    fn full_config_round_trips_through_toml() {
        let cfg = Config::default();
        let toml_str = toml::to_string(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.llm.model, cfg.llm.model);
    }

    #[test]
    fn default_config_has_no_validation_errors_only_missing_key_warning() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
        assert!(issues.iter().any(|i| i.field == "llm.api_key_env"));
    }

    #[test]
    fn empty_completion_endpoint_is_an_error() {
        let mut cfg = Config::default();
        cfg.llm.completion_endpoint = String::new();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "llm.completion_endpoint" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn stdio_mcp_server_without_command_is_an_error() {
        let mut cfg = Config::default();
        cfg.mcp.servers.push(McpServerConfig {
            id: "fs".into(),
            transport: McpTransportKind::Stdio,
            command: String::new(),
            args: vec![],
            env: Default::default(),
            url: None,
            connect_timeout_secs: 30,
        });
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.message.contains("requires a command")));
    }
}
