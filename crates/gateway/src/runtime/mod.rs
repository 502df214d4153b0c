//! Core runtime — the orchestrator that ties persistence, prompt building,
//! LLM streaming, and tool dispatch into one deterministic loop.
//!
//! Entry point: [`run_turn`] takes a conversation + user message and returns
//! a stream of [`TurnEvent`]s (SPEC_FULL §4.6).

pub mod approval;
pub mod cancel;
pub mod compact;
pub mod tools;
pub mod turn;

pub use turn::{run_turn, TurnEvent, TurnInput};

use sa_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembles the system prompt: a runtime-context preamble (data root, tool
/// catalogue size) followed by the operator-configured instructions.
pub(super) fn build_system_prompt(state: &AppState) -> String {
    let preamble = format!(
        "You are a local agent runtime with {} tool(s) available. Data root: {}.",
        state.tools.list_tools().len(),
        state.config.store.data_root.display(),
    );
    format!("{preamble}\n\n{}", state.config.llm.system_prompt)
}

/// Model override used for compaction summaries and title generation,
/// falling back to the primary completion model when unset.
pub(super) fn summarizer_model(state: &AppState) -> Option<String> {
    state.config.llm.summarizer_model.clone()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store <-> wire message conversion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Converts persisted [`sa_store::Message`] rows into the provider-agnostic
/// wire [`Message`] list the LLM sees. An assistant row's tool calls are
/// expanded into an assistant `tool_use` message followed by one `tool_result`
/// message per completed call, matching the OpenAI-style interleaving every
/// adapter in `sa-providers` expects.
pub(super) fn store_messages_to_domain(messages: &[sa_store::Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            sa_store::Role::User => out.push(Message::user(msg.content.clone())),
            sa_store::Role::System => out.push(Message::system(msg.content.clone())),
            sa_store::Role::Tool => {
                // Tool-role rows are never produced by this engine (tool
                // results live on the owning assistant message's tool_calls),
                // but the store schema permits them; skip rather than guess.
                continue;
            }
            sa_store::Role::Assistant => {
                let tool_calls: Vec<ToolCall> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| ToolCall {
                        call_id: tc.id.clone(),
                        tool_name: tc.tool_name.clone(),
                        arguments: tc.input.clone(),
                    })
                    .collect();
                out.push(build_assistant_tool_message(&msg.content, &tool_calls));
                for tc in &msg.tool_calls {
                    if let Some(output) = &tc.output {
                        let text = output.as_str().map(str::to_string).unwrap_or_else(|| output.to_string());
                        out.push(Message::tool_result(&tc.id, text));
                    }
                }
            }
        }
    }
    out
}

pub(super) fn build_assistant_tool_message(text: &str, tool_calls: &[ToolCall]) -> Message {
    let mut parts = Vec::new();

    if !text.is_empty() {
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });
    }

    for tc in tool_calls {
        parts.push(ContentPart::ToolUse {
            id: tc.call_id.clone(),
            name: tc.tool_name.clone(),
            input: tc.arguments.clone(),
        });
    }

    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::tool::{ContentPart, MessageContent, Role, ToolCall};
    use sa_store::{ToolCallRecord, ToolCallStatus};

    // ── build_assistant_tool_message ───────────────────────────────

    #[test]
    fn build_tool_msg_text_only() {
        let msg = build_assistant_tool_message("hello", &[]);
        assert_eq!(msg.role, Role::Assistant);
        match &msg.content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                match &parts[0] {
                    ContentPart::Text { text } => assert_eq!(text, "hello"),
                    _ => panic!("expected Text part"),
                }
            }
            _ => panic!("expected Parts content"),
        }
    }

    #[test]
    fn build_tool_msg_tool_calls_only() {
        let calls = vec![ToolCall {
            call_id: "tc_1".into(),
            tool_name: "search".into(),
            arguments: serde_json::json!({"query": "test"}),
        }];
        let msg = build_assistant_tool_message("", &calls);
        match &msg.content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                assert!(matches!(&parts[0], ContentPart::ToolUse { .. }));
            }
            _ => panic!("expected Parts content"),
        }
    }

    #[test]
    fn build_tool_msg_empty_text_not_included() {
        let msg = build_assistant_tool_message("", &[]);
        match &msg.content {
            MessageContent::Parts(parts) => assert!(parts.is_empty()),
            _ => panic!("expected Parts content"),
        }
    }

    // ── store_messages_to_domain ────────────────────────────────────

    fn store_msg(role: sa_store::Role, content: &str, tool_calls: Vec<ToolCallRecord>) -> sa_store::Message {
        sa_store::Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            role,
            content: content.to_string(),
            position: 0,
            created_at: "now".into(),
            tool_calls,
            attachments: vec![],
        }
    }

    #[test]
    fn user_and_system_rows_become_plain_text_messages() {
        let rows = vec![
            store_msg(sa_store::Role::User, "hi", vec![]),
            store_msg(sa_store::Role::System, "be helpful", vec![]),
        ];
        let msgs = store_messages_to_domain(&rows);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::System);
    }

    #[test]
    fn assistant_with_completed_tool_call_expands_to_tool_result() {
        let tc = ToolCallRecord {
            id: "tc_1".into(),
            message_id: "m1".into(),
            tool_name: "shell".into(),
            provider_name: "builtin".into(),
            input: serde_json::json!({"command": "echo hi"}),
            output: Some(serde_json::json!("hi")),
            status: ToolCallStatus::Success,
            created_at: "now".into(),
        };
        let rows = vec![store_msg(sa_store::Role::Assistant, "", vec![tc])];
        let msgs = store_messages_to_domain(&rows);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::Assistant);
        assert_eq!(msgs[1].role, Role::Tool);
        assert_eq!(msgs[1].content.extract_all_text(), "hi");
    }

    #[test]
    fn assistant_with_pending_tool_call_has_no_tool_result() {
        let tc = ToolCallRecord {
            id: "tc_1".into(),
            message_id: "m1".into(),
            tool_name: "shell".into(),
            provider_name: "builtin".into(),
            input: serde_json::json!({}),
            output: None,
            status: ToolCallStatus::Pending,
            created_at: "now".into(),
        };
        let rows = vec![store_msg(sa_store::Role::Assistant, "", vec![tc])];
        let msgs = store_messages_to_domain(&rows);
        assert_eq!(msgs.len(), 1);
    }
}
