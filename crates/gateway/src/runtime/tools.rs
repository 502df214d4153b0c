//! Dispatch wrapper around the tool registry that captures pre-mutation
//! shadow copies for the undo ledger (SPEC_FULL §9) before a file-writing
//! tool call executes. `Store::rewind` is the consumer of these copies.

use serde_json::Value;

use sa_tools::ToolOutput;

use crate::state::AppState;

/// Tools whose arguments name a single file path to capture before the
/// call runs. `shell` can touch arbitrary paths and isn't structured
/// enough to capture generically, so it's outside this hook — the
/// destructive-command gate still applies to it separately.
const UNDO_CAPTURED_TOOLS: &[&str] = &["write_file"];

pub async fn dispatch_with_undo_capture(
    state: &AppState,
    conversation_id: &str,
    tool_call_id: &str,
    tool_name: &str,
    arguments: &Value,
) -> ToolOutput {
    if UNDO_CAPTURED_TOOLS.contains(&tool_name) {
        if let Some(path) = arguments.get("path").and_then(|v| v.as_str()) {
            capture_shadow_copy(state, conversation_id, tool_call_id, path).await;
        }
    }
    state.tools.dispatch(tool_name, arguments.clone()).await
}

async fn capture_shadow_copy(state: &AppState, conversation_id: &str, tool_call_id: &str, path: &str) {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(_) => return, // file doesn't exist yet; nothing to restore on rewind
    };
    let dest_dir = state.config.store.data_root.join("undo").join(conversation_id);
    if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
        tracing::warn!(error = %e, "failed to create undo directory");
        return;
    }
    let dest = dest_dir.join(tool_call_id);
    if let Err(e) = tokio::fs::write(&dest, &bytes).await {
        tracing::warn!(error = %e, path = %dest.display(), "failed to write undo shadow copy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sa_domain::config::{Config, LlmConfig};
    use sa_tools::builtin::WriteFileTool;
    use sa_tools::ToolRegistry;

    fn test_state(data_root: std::path::PathBuf) -> AppState {
        let mut config = Config::default();
        config.store.data_root = data_root;
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(WriteFileTool));
        AppState {
            config: Arc::new(config),
            llm: Arc::new(sa_providers::OpenAiCompatProvider::from_config(&LlmConfig::default()).unwrap()),
            store: Arc::new(sa_store::Store::open_in_memory().unwrap()),
            event_bus: Arc::new(sa_eventbus::EventBus::new("test", 16)),
            tools,
            mcp: Arc::new(sa_mcp_client::McpManager::empty()),
            approval: Arc::new(sa_approval::ApprovalBroker::default()),
            cancel_map: Arc::new(crate::runtime::cancel::CancelMap::new()),
        }
    }

    #[tokio::test]
    async fn captures_existing_file_before_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("notes.txt");
        tokio::fs::write(&target, "original").await.unwrap();

        let state = test_state(dir.path().join("data"));
        let args = serde_json::json!({"path": target.to_str().unwrap(), "content": "new"});
        let out = dispatch_with_undo_capture(&state, "conv1", "tc1", "write_file", &args).await;
        assert!(!out.is_error());

        let shadow = state.config.store.data_root.join("undo").join("conv1").join("tc1");
        let restored = tokio::fs::read_to_string(&shadow).await.unwrap();
        assert_eq!(restored, "original");
    }

    #[tokio::test]
    async fn no_shadow_copy_when_file_did_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new.txt");

        let state = test_state(dir.path().join("data"));
        let args = serde_json::json!({"path": target.to_str().unwrap(), "content": "new"});
        dispatch_with_undo_capture(&state, "conv1", "tc1", "write_file", &args).await;

        let shadow = state.config.store.data_root.join("undo").join("conv1").join("tc1");
        assert!(!shadow.exists());
    }
}
