//! Agent turn engine (SPEC_FULL §4.6) — the loop that turns a user message
//! plus conversation history into a stream of [`TurnEvent`]s.
//!
//! One call to [`run_turn`] drives: a streaming completion, tool-call
//! accumulation and dispatch, context compaction, and (on a fresh
//! conversation) fire-and-forget title generation (§4.7). Everything the
//! loop persists goes through [`sa_store::Store`]; everything it emits goes
//! out both the returned channel and the shared event bus.

use std::collections::HashMap;

use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use sa_domain::stream::StreamEvent;
use sa_domain::tool::{Message, ToolCall};
use sa_providers::ChatRequest;
use sa_store::{Role as StoreRole, ToolCallStatus};

use crate::state::AppState;

use super::cancel::CancelToken;
use super::compact;
use super::tools::dispatch_with_undo_capture;
use super::{build_system_prompt, store_messages_to_domain, summarizer_model};

/// Events emitted over the course of one turn (SPEC_FULL §4.6). This table
/// is closed — every signal the engine produces maps onto one of these
/// eight kinds, including warnings (logged via `tracing`, never a variant
/// here) and cancellation (represented as a plain `Done` with no preceding
/// `AssistantMessage`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    Thinking,
    Token { text: String },
    ToolCallStart { id: String, name: String, arguments: Value },
    ToolCallEnd { id: String, status: String, output: Value },
    AssistantMessage { content: String },
    QueuedMessage,
    Error { message: String },
    Done,
}

/// Input to one turn. `follow_ups` is an optional channel a front end can
/// feed mid-stream user messages into (SPEC_FULL §4.6 step 5) — `chat`'s
/// interactive loop wires one up; a one-shot `run` invocation leaves it
/// `None`.
pub struct TurnInput {
    pub conversation_id: String,
    pub user_message: String,
    pub follow_ups: Option<mpsc::Receiver<String>>,
}

/// Spawn the turn loop and return a channel of [`TurnEvent`]s.
pub fn run_turn(state: AppState, input: TurnInput) -> mpsc::Receiver<TurnEvent> {
    let (tx, rx) = mpsc::channel(256);
    let conversation_id = input.conversation_id.clone();
    let cancel = state.cancel_map.register(&conversation_id);
    let span = tracing::info_span!("turn", conversation_id = %conversation_id);

    tokio::spawn(
        async move {
            if let Err(e) = run_turn_inner(&state, input, &tx, &cancel).await {
                tracing::error!(error = %e, "turn failed");
                let _ = tx.send(TurnEvent::Error { message: e.to_string() }).await;
            }
            state.cancel_map.remove(&conversation_id);
        }
        .instrument(span),
    );

    rx
}

async fn run_turn_inner(
    state: &AppState,
    mut input: TurnInput,
    tx: &mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let conversation_id = input.conversation_id.clone();
    let is_fresh_conversation = state.store.list_messages(&conversation_id)?.is_empty();

    state.store.append_message(&conversation_id, StoreRole::User, &input.user_message)?;
    state.event_bus.publish(
        &conversation_id,
        "message.user",
        serde_json::json!({"content": &input.user_message}),
    );

    let _ = tx.send(TurnEvent::Thinking).await;

    let tool_defs = to_domain_tool_defs(state.tools.list_tools());
    let max_iterations = state.config.llm.max_tool_iterations;

    for iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            let _ = tx.send(TurnEvent::Done).await;
            return Ok(());
        }

        let messages = load_context(state, &conversation_id).await?;
        let wire_messages = assemble_wire_messages(state, &messages);

        let req = ChatRequest {
            messages: wire_messages,
            tools: tool_defs.clone(),
            temperature: None,
            max_tokens: None,
            json_mode: false,
            model: None,
        };

        let mut stream = match state.llm.chat_stream(req).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(TurnEvent::Error { message: e.to_string() }).await;
                return Ok(());
            }
        };

        let outcome = drain_completion_stream(&mut stream, tx, cancel).await?;
        let StreamOutcome { text, tool_calls, cancelled } = match outcome {
            Some(o) => o,
            None => return Ok(()), // an Error event was already sent downstream
        };

        if cancelled {
            let _ = tx.send(TurnEvent::Done).await;
            return Ok(());
        }

        if tool_calls.is_empty() {
            state.store.append_message(&conversation_id, StoreRole::Assistant, &text)?;
            state.event_bus.publish(
                &conversation_id,
                "message.assistant",
                serde_json::json!({"content": text}),
            );
            let _ = tx.send(TurnEvent::AssistantMessage { content: text.clone() }).await;

            if is_fresh_conversation {
                spawn_title_generation(state.clone(), conversation_id.clone(), input.user_message.clone(), text);
            }

            drain_follow_ups(state, &conversation_id, &mut input, tx).await?;
            let _ = tx.send(TurnEvent::Done).await;
            return Ok(());
        }

        run_tool_call_round(state, &conversation_id, &text, &tool_calls, tx).await?;

        if iteration + 1 == max_iterations {
            let _ = tx
                .send(TurnEvent::Error {
                    message: format!("tool-call loop exceeded {max_iterations} iterations"),
                })
                .await;
            return Ok(());
        }
    }

    Ok(())
}

/// Load persisted history, running auto-compaction first if the
/// conversation has grown past its configured turn budget (SPEC_FULL §4.6
/// context management). Logs, rather than surfaces, both the warn-threshold
/// and compaction-failure cases — neither has a dedicated `TurnEvent` kind.
async fn load_context(
    state: &AppState,
    conversation_id: &str,
) -> Result<Vec<sa_store::Message>, Box<dyn std::error::Error + Send + Sync>> {
    let mut messages = state.store.list_messages(conversation_id)?;

    if compact::estimate_token_count(&messages) > state.config.compaction.warn_threshold_tokens {
        tracing::warn!(conversation_id, "conversation approaching the context-size warn threshold");
    }

    if compact::should_compact(&messages, &state.config.compaction) {
        let model = summarizer_model(state);
        match compact::run_compaction(
            state.llm.as_ref(),
            &state.store,
            conversation_id,
            &messages,
            &state.config.compaction,
            model,
        )
        .await
        {
            Ok(summary) if !summary.is_empty() => {
                messages = state.store.list_messages(conversation_id)?;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "auto-compaction failed, continuing with full history"),
        }
    }

    Ok(messages)
}

fn assemble_wire_messages(state: &AppState, messages: &[sa_store::Message]) -> Vec<Message> {
    let boundary = compact::compaction_boundary(messages);
    let mut wire = vec![Message::system(build_system_prompt(state))];
    wire.extend(store_messages_to_domain(&messages[boundary..]));
    wire
}

struct StreamOutcome {
    text: String,
    tool_calls: Vec<ToolCall>,
    cancelled: bool,
}

/// Drain one completion stream, emitting `Token` events as text arrives and
/// accumulating tool-call argument fragments. Returns `None` once an
/// `Error` event has already been forwarded downstream (caller should stop
/// without sending anything further).
async fn drain_completion_stream(
    stream: &mut sa_domain::stream::BoxStream<'static, sa_domain::error::Result<StreamEvent>>,
    tx: &mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
) -> Result<Option<StreamOutcome>, Box<dyn std::error::Error + Send + Sync>> {
    let mut text = String::new();
    // Keyed by the `call_id` the provider sends on `ToolCallStarted` —
    // providers are responsible for correlating their own wire-level index
    // or position back to that same call_id on every later `ToolCallDelta`.
    // A delta with a call_id we haven't seen started still opens its own
    // bucket rather than being dropped, so a provider that can't correlate
    // at least produces a recoverable (if misattributed) call instead of
    // losing arguments entirely.
    let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
    let mut tool_calls = Vec::new();

    while let Some(event) = stream.next().await {
        if cancel.is_cancelled() {
            return Ok(Some(StreamOutcome { text, tool_calls, cancelled: true }));
        }

        match event {
            Ok(StreamEvent::Token { text: delta }) => {
                let _ = tx.send(TurnEvent::Token { text: delta.clone() }).await;
                text.push_str(&delta);
            }
            Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                tc_bufs.entry(call_id).or_insert_with(|| (String::new(), String::new())).0 = tool_name;
            }
            Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                tc_bufs
                    .entry(call_id)
                    .or_insert_with(|| (String::new(), String::new()))
                    .1
                    .push_str(&delta);
            }
            Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }) => {
                tc_bufs.remove(&call_id);
                tool_calls.push(ToolCall { call_id, tool_name, arguments });
            }
            Ok(StreamEvent::Done { .. }) => break,
            Ok(StreamEvent::Error { message }) => {
                let _ = tx.send(TurnEvent::Error { message }).await;
                return Ok(None);
            }
            Err(e) => {
                let _ = tx.send(TurnEvent::Error { message: e.to_string() }).await;
                return Ok(None);
            }
        }
    }

    for (call_id, (tool_name, args_buf)) in tc_bufs {
        let arguments = parse_tool_arguments(&call_id, &tool_name, &args_buf);
        tool_calls.push(ToolCall { call_id, tool_name, arguments });
    }

    Ok(Some(StreamOutcome { text, tool_calls, cancelled: false }))
}

fn parse_tool_arguments(call_id: &str, tool_name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                call_id,
                tool = tool_name,
                error = %e,
                "tool call arguments were not valid JSON, defaulting to an empty object"
            );
            Value::Object(Default::default())
        }
    }
}

/// Persist the assistant's tool-calling turn, dispatch every call
/// concurrently, then emit `ToolCallEnd` in the original call order
/// regardless of which call actually finished first.
async fn run_tool_call_round(
    state: &AppState,
    conversation_id: &str,
    assistant_text: &str,
    tool_calls: &[ToolCall],
    tx: &mpsc::Sender<TurnEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let assistant_row = state.store.append_message(conversation_id, StoreRole::Assistant, assistant_text)?;

    for tc in tool_calls {
        state.store.record_tool_call(
            &assistant_row.id,
            Some(&tc.call_id),
            &tc.tool_name,
            "local",
            tc.arguments.clone(),
        )?;
        let _ = tx
            .send(TurnEvent::ToolCallStart {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                arguments: tc.arguments.clone(),
            })
            .await;
    }

    let dispatches = tool_calls
        .iter()
        .map(|tc| dispatch_with_undo_capture(state, conversation_id, &tc.call_id, &tc.tool_name, &tc.arguments));
    let outputs = join_all(dispatches).await;

    for (tc, output) in tool_calls.iter().zip(outputs) {
        let status = if output.is_error() { ToolCallStatus::Error } else { ToolCallStatus::Success };
        let output_value = serde_json::to_value(&output).unwrap_or(Value::Null);
        state.store.complete_tool_call(&tc.call_id, output_value.clone(), status)?;

        let status_str = if output.is_error() { "error" } else { "success" };
        let _ = tx
            .send(TurnEvent::ToolCallEnd {
                id: tc.call_id.clone(),
                status: status_str.to_string(),
                output: output_value,
            })
            .await;
    }

    Ok(())
}

/// Drain any follow-up messages queued by the front end while this turn was
/// running (SPEC_FULL §4.6 step 5). Bare `/`-prefixed lines are front-end
/// commands (`/exit`, `/rewind`, ...), not conversation content — they're
/// dropped here with a warning rather than spliced into the transcript.
async fn drain_follow_ups(
    state: &AppState,
    conversation_id: &str,
    input: &mut TurnInput,
    tx: &mpsc::Sender<TurnEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(rx) = input.follow_ups.as_mut() else {
        return Ok(());
    };
    while let Ok(message) = rx.try_recv() {
        if message.starts_with('/') {
            tracing::warn!(conversation_id, "dropping queued front-end command from turn input");
            continue;
        }
        state.store.append_message(conversation_id, StoreRole::User, &message)?;
        let _ = tx.send(TurnEvent::QueuedMessage).await;
    }
    Ok(())
}

/// Fire-and-forget conversation title generation (SPEC_FULL §4.7). Runs
/// after the first full exchange on a fresh conversation; never delays
/// `Done`, and any failure is swallowed at `debug` with the default title
/// left in place.
fn spawn_title_generation(state: AppState, conversation_id: String, user_message: String, assistant_message: String) {
    tokio::spawn(async move {
        let prompt = format!(
            "Write a short, specific title (3-6 words, no quotes or trailing \
             punctuation) for this exchange.\n\nUser: {user_message}\nAssistant: {assistant_message}"
        );
        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: vec![],
            temperature: Some(0.3),
            max_tokens: Some(20),
            json_mode: false,
            model: summarizer_model(&state),
        };
        match state.llm.chat(req).await {
            Ok(resp) => {
                let title = resp.content.trim();
                if !title.is_empty() {
                    if let Err(e) = state.store.update_conversation_title(&conversation_id, title) {
                        tracing::debug!(error = %e, "failed to persist generated conversation title");
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "title generation failed"),
        }
    });
}

fn to_domain_tool_defs(defs: Vec<sa_tools::ToolDefinition>) -> Vec<sa_domain::tool::ToolDefinition> {
    defs.into_iter()
        .map(|d| sa_domain::tool::ToolDefinition {
            name: d.name,
            description: d.description,
            parameters: d.parameters,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tool_arguments_defaults_empty_string_to_empty_object() {
        assert_eq!(parse_tool_arguments("tc1", "shell", ""), serde_json::json!({}));
    }

    #[test]
    fn parse_tool_arguments_defaults_malformed_json_to_empty_object() {
        assert_eq!(parse_tool_arguments("tc1", "shell", "{not json"), serde_json::json!({}));
    }

    #[test]
    fn parse_tool_arguments_parses_valid_json() {
        let v = parse_tool_arguments("tc1", "shell", r#"{"command":"echo hi"}"#);
        assert_eq!(v, serde_json::json!({"command": "echo hi"}));
    }

    #[test]
    fn to_domain_tool_defs_maps_fields() {
        let src = vec![sa_tools::ToolDefinition {
            name: "shell".into(),
            description: "run a command".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let out = to_domain_tool_defs(src);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "shell");
        assert_eq!(out[0].description, "run a command");
    }
}
