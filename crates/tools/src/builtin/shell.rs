use std::time::Duration;

use tokio::process::Command;

use crate::registry::{Tool, ToolOutput, SHELL_TOOL_NAME};

/// Runs a command through `sh -c`, bounded by a hard wall-clock timeout.
/// The destructive-action gate (SPEC_FULL §4.2) is applied by the registry
/// before this handler ever runs.
pub struct ShellTool {
    timeout: Duration,
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        SHELL_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Runs a shell command and returns its stdout, stderr, and exit code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to execute"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolOutput {
        let Some(command) = arguments.get("command").and_then(|v| v.as_str()) else {
            return ToolOutput::error("missing required argument: command");
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("failed to spawn: {e}")),
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ToolOutput::process(
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
                output.status.code(),
            ),
            Ok(Err(e)) => ToolOutput::error(format!("command failed: {e}")),
            Err(_) => ToolOutput::error("command timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_simple_command() {
        let tool = ShellTool::new();
        let out = tool.execute(serde_json::json!({"command": "echo hi"})).await;
        assert_eq!(out.stdout.as_deref(), Some("hi\n"));
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn missing_command_argument_is_an_error() {
        let tool = ShellTool::new();
        let out = tool.execute(serde_json::json!({})).await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_without_being_an_error() {
        let tool = ShellTool::new();
        let out = tool.execute(serde_json::json!({"command": "exit 3"})).await;
        assert!(!out.is_error());
        assert_eq!(out.exit_code, Some(3));
    }
}
