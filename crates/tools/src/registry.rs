use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::destructive::{contains_shell_metacharacters, is_destructive_command};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The result of a tool invocation, matching SPEC_FULL §4.2's output shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn process(stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit_code,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(&self, arguments: serde_json::Value) -> ToolOutput;
}

/// Asks a human to confirm a destructive action. Implementations must not
/// be called while any registry-internal lock is held.
#[async_trait::async_trait]
pub trait ConfirmCallback: Send + Sync {
    async fn confirm(&self, message: &str) -> bool;
}

/// Bridges to the tool-provider manager without a crate-level dependency
/// cycle between `sa-tools` and `sa-mcp-client`.
#[async_trait::async_trait]
pub trait RemoteProvider: Send + Sync {
    fn list_tools(&self) -> Vec<ToolDefinition>;
    async fn dispatch(&self, tool_name: &str, arguments: serde_json::Value) -> Option<Result<ToolOutput, String>>;
}

/// Name of the built-in shell tool the destructive gate applies to.
pub const SHELL_TOOL_NAME: &str = "shell";

pub struct ToolRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Tool>>>,
    confirm_callback: RwLock<Option<Arc<dyn ConfirmCallback>>>,
    remote: RwLock<Option<Arc<dyn RemoteProvider>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            confirm_callback: RwLock::new(None),
            remote: RwLock::new(None),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.handlers.write().insert(tool.name().to_string(), tool);
    }

    pub fn set_confirm_callback(&self, callback: Arc<dyn ConfirmCallback>) {
        *self.confirm_callback.write() = Some(callback);
    }

    pub fn set_remote_provider(&self, provider: Arc<dyn RemoteProvider>) {
        *self.remote.write() = Some(provider);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        if self.handlers.read().contains_key(name) {
            return true;
        }
        self.remote
            .read()
            .as_ref()
            .map(|r| r.list_tools().iter().any(|t| t.name == name))
            .unwrap_or(false)
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .handlers
            .read()
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        if let Some(remote) = self.remote.read().as_ref() {
            defs.extend(remote.list_tools());
        }
        defs
    }

    /// Dispatches a tool call, applying the destructive gate to the `shell`
    /// tool and the shell-metacharacter filter to remote tool arguments.
    pub async fn dispatch(&self, name: &str, arguments: serde_json::Value) -> ToolOutput {
        let handler = self.handlers.read().get(name).cloned();

        if let Some(handler) = handler {
            if name == SHELL_TOOL_NAME {
                if let Some(command) = arguments.get("command").and_then(|v| v.as_str()) {
                    if is_destructive_command(command) {
                        let callback = self.confirm_callback.read().clone();
                        let confirmed = match callback {
                            Some(cb) => {
                                cb.confirm(&format!("Destructive command: {command}")).await
                            }
                            None => false,
                        };
                        if !confirmed {
                            return ToolOutput {
                                error: Some("Command cancelled by user".to_string()),
                                exit_code: Some(-1),
                                ..Default::default()
                            };
                        }
                    }
                }
            }
            return handler.execute(arguments).await;
        }

        if contains_shell_metacharacters(&arguments) {
            warn!(tool = name, "rejecting remote tool call: shell metacharacters in arguments");
            return ToolOutput::error("arguments contain disallowed shell metacharacters");
        }

        let remote = self.remote.read().clone();
        if let Some(remote) = remote {
            match remote.dispatch(name, arguments).await {
                Some(Ok(output)) => return output,
                Some(Err(e)) => return ToolOutput::error(e),
                None => {}
            }
        }

        ToolOutput::error(format!("unknown tool: {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, arguments: serde_json::Value) -> ToolOutput {
            ToolOutput::text(arguments.to_string())
        }
    }

    struct ShellStub;

    #[async_trait::async_trait]
    impl Tool for ShellStub {
        fn name(&self) -> &str {
            SHELL_TOOL_NAME
        }
        fn description(&self) -> &str {
            "runs a shell command"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> ToolOutput {
            ToolOutput::process("ran".into(), String::new(), Some(0))
        }
    }

    struct AlwaysDeny;
    #[async_trait::async_trait]
    impl ConfirmCallback for AlwaysDeny {
        async fn confirm(&self, _message: &str) -> bool {
            false
        }
    }

    struct AlwaysAllow;
    #[async_trait::async_trait]
    impl ConfirmCallback for AlwaysAllow {
        async fn confirm(&self, _message: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let out = registry.dispatch("echo", serde_json::json!({"a": 1})).await;
        assert_eq!(out.content.unwrap(), "{\"a\":1}");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let out = registry.dispatch("nope", serde_json::json!({})).await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn destructive_shell_command_is_denied_without_confirmation() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ShellStub));
        registry.set_confirm_callback(Arc::new(AlwaysDeny));
        let out = registry
            .dispatch(SHELL_TOOL_NAME, serde_json::json!({"command": "rm -rf /tmp/x"}))
            .await;
        assert_eq!(out.error.as_deref(), Some("Command cancelled by user"));
        assert_eq!(out.exit_code, Some(-1));
    }

    #[tokio::test]
    async fn destructive_shell_command_proceeds_when_confirmed() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ShellStub));
        registry.set_confirm_callback(Arc::new(AlwaysAllow));
        let out = registry
            .dispatch(SHELL_TOOL_NAME, serde_json::json!({"command": "rm -rf /tmp/x"}))
            .await;
        assert!(!out.is_error());
        assert_eq!(out.stdout.as_deref(), Some("ran"));
    }

    #[tokio::test]
    async fn non_destructive_shell_command_skips_gate() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ShellStub));
        registry.set_confirm_callback(Arc::new(AlwaysDeny));
        let out = registry
            .dispatch(SHELL_TOOL_NAME, serde_json::json!({"command": "echo hi"}))
            .await;
        assert!(!out.is_error());
    }
}
