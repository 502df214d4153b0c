//! Conversation compaction — collapses old history into a summary so the
//! context window stays healthy across long-running conversations.
//!
//! Compaction appends a marker message (never rewrites existing rows). When
//! loading history for a turn, only messages at or after the most recent
//! marker are sent to the model.

use sa_domain::config::CompactionConfig;
use sa_providers::traits::ChatRequest;
use sa_providers::LlmProvider;
use sa_store::{Message, Role};

/// Prefix identifying a system message as a compaction marker rather than
/// an ordinary system prompt row.
const COMPACTION_MARKER_PREFIX: &str = "[compaction-summary] ";

fn is_compaction_marker(msg: &Message) -> bool {
    msg.role == Role::System && msg.content.starts_with(COMPACTION_MARKER_PREFIX)
}

/// Find the index of the last compaction marker. Returns 0 if none exists.
pub fn compaction_boundary(messages: &[Message]) -> usize {
    for i in (0..messages.len()).rev() {
        if is_compaction_marker(&messages[i]) {
            return i; // include the marker itself; it becomes a system message
        }
    }
    0
}

/// Count user turns since the last compaction marker.
pub fn active_turn_count(messages: &[Message]) -> usize {
    let start = compaction_boundary(messages);
    messages[start..].iter().filter(|m| m.role == Role::User).count()
}

/// Whether auto-compaction should run before the next request.
pub fn should_compact(messages: &[Message], config: &CompactionConfig) -> bool {
    if !config.auto {
        return false;
    }
    active_turn_count(messages) > config.max_turns
}

/// Rough token estimate (chars / 4) used to decide whether to log a
/// context-size warning. Not a tokenizer — good enough to gate a warn log.
pub fn estimate_token_count(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.content.len() / 4).sum()
}

/// Split the active (post-marker) messages into (to_compact, to_keep).
/// `to_keep` holds the last `keep_last_turns` user turns and any trailing
/// assistant/tool messages.
pub fn split_for_compaction(messages: &[Message], keep_last_turns: usize) -> (&[Message], &[Message]) {
    let start = compaction_boundary(messages);
    let active_start = if !messages.is_empty() && start < messages.len() && is_compaction_marker(&messages[start]) {
        start + 1
    } else {
        start
    };
    let active = &messages[active_start..];

    let mut user_count = 0;
    let mut keep_from = 0;
    for (i, msg) in active.iter().enumerate().rev() {
        if msg.role == Role::User {
            user_count += 1;
            if user_count >= keep_last_turns {
                keep_from = i;
                break;
            }
        }
    }

    (&active[..keep_from], &active[keep_from..])
}

/// Generate a compaction summary via a non-streaming completion.
pub async fn generate_summary(
    provider: &dyn LlmProvider,
    messages_to_compact: &[Message],
    model_override: Option<String>,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let conversation = build_conversation_text(messages_to_compact);

    let prompt = format!(
        "You are a conversation summarizer. Summarize the following conversation \
         history into a concise summary that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\
         5. Tool state (running processes, active sessions, pending work)\n\n\
         Be concise but preserve all actionable context. Write in present tense.\n\
         Omit greetings and pleasantries. Focus on substance.\n\n\
         CONVERSATION:\n{conversation}"
    );

    let req = ChatRequest {
        messages: vec![sa_domain::tool::Message::user(&prompt)],
        tools: vec![],
        temperature: Some(0.1),
        max_tokens: Some(2000),
        json_mode: false,
        model: model_override,
    };

    let resp = provider.chat(req).await?;
    Ok(resp.content)
}

/// Run the full compaction flow: split -> summarize -> persist marker.
/// Returns the empty string (and does nothing) when there is nothing to
/// compact yet.
pub async fn run_compaction(
    provider: &dyn LlmProvider,
    store: &sa_store::Store,
    conversation_id: &str,
    messages: &[Message],
    config: &CompactionConfig,
    model_override: Option<String>,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let (to_compact, _to_keep) = split_for_compaction(messages, config.keep_last_turns);
    if to_compact.is_empty() {
        return Ok(String::new());
    }

    let turns_compacted = to_compact.iter().filter(|m| m.role == Role::User).count();
    let summary = generate_summary(provider, to_compact, model_override).await?;

    store.append_message(
        conversation_id,
        Role::System,
        &format!("{COMPACTION_MARKER_PREFIX}{summary}"),
    )?;

    tracing::info!(
        conversation_id,
        turns_compacted,
        summary_len = summary.len(),
        "conversation compacted"
    );

    Ok(summary)
}

fn build_conversation_text(messages: &[Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let role_label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        buf.push_str(role_label);
        buf.push_str(": ");
        if msg.content.len() > 2000 {
            buf.push_str(&msg.content[..1000]);
            buf.push_str(" [...] ");
            buf.push_str(&msg.content[msg.content.len() - 500..]);
        } else {
            buf.push_str(&msg.content);
        }
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "c1".into(),
            role,
            content: content.to_string(),
            position: 0,
            created_at: "now".into(),
            tool_calls: vec![],
            attachments: vec![],
        }
    }

    fn marker(summary: &str) -> Message {
        msg(Role::System, &format!("{COMPACTION_MARKER_PREFIX}{summary}"))
    }

    #[test]
    fn no_compaction_marker() {
        let messages = vec![msg(Role::User, "hello"), msg(Role::Assistant, "hi")];
        assert_eq!(compaction_boundary(&messages), 0);
        assert_eq!(active_turn_count(&messages), 1);
    }

    #[test]
    fn compaction_boundary_after_marker() {
        let messages = vec![
            msg(Role::User, "old"),
            msg(Role::Assistant, "old reply"),
            marker("summary of old conversation"),
            msg(Role::User, "new"),
            msg(Role::Assistant, "new reply"),
        ];
        assert_eq!(compaction_boundary(&messages), 2);
        assert_eq!(active_turn_count(&messages), 1);
    }

    #[test]
    fn should_compact_respects_threshold() {
        let config = CompactionConfig {
            auto: true,
            max_turns: 3,
            keep_last_turns: 1,
            warn_threshold_tokens: 12_000,
        };
        let messages: Vec<_> = (0..4)
            .flat_map(|i| {
                vec![
                    msg(Role::User, &format!("msg {i}")),
                    msg(Role::Assistant, &format!("reply {i}")),
                ]
            })
            .collect();
        assert!(should_compact(&messages, &config)); // 4 turns > 3
    }

    #[test]
    fn split_keeps_last_turns() {
        let messages: Vec<_> = (0..5)
            .flat_map(|i| {
                vec![
                    msg(Role::User, &format!("msg {i}")),
                    msg(Role::Assistant, &format!("reply {i}")),
                ]
            })
            .collect();

        let (to_compact, to_keep) = split_for_compaction(&messages, 2);
        let compact_users: Vec<_> = to_compact
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(compact_users, vec!["msg 0", "msg 1", "msg 2"]);

        let keep_users: Vec<_> = to_keep
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(keep_users, vec!["msg 3", "msg 4"]);
    }

    #[test]
    fn estimate_token_count_is_roughly_chars_over_four() {
        let messages = vec![msg(Role::User, &"a".repeat(400))];
        assert_eq!(estimate_token_count(&messages), 100);
    }
}
