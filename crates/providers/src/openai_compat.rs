//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions contract — which is
//! the single LLM endpoint this repo talks to (SPEC_FULL §6).

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::from_reqwest;
use sa_domain::capability::{LlmCapabilities, ToolSupport};
use sa_domain::config::LlmConfig;
use sa_domain::error::{Error, Result};
use sa_domain::stream::{BoxStream, StreamEvent, Usage};
use sa_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use serde_json::Value;
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for the single configured OpenAI-compatible
/// completion endpoint.
pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new provider from the LLM section of the running config.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = match cfg.api_key_env.as_deref() {
            Some(var) => Some(crate::util::resolve_api_key(Some(var))?.unwrap_or_default()),
            None => None,
        };

        let capabilities = LlmCapabilities {
            supports_tools: ToolSupport::StrictJson,
            supports_streaming: true,
            supports_json_mode: true,
            supports_vision: false,
            context_window_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            base_url: cfg.completion_endpoint.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.model.clone(),
            capabilities,
            client,
        })
    }

    // ── Internal: build authenticated request builder ──────────────

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    // ── Internal: build the JSON body ─────────────────────────────

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => {
            let text = msg.content.extract_all_text();
            serde_json::json!({
                "role": role_to_str(msg.role),
                "content": text,
            })
        }
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => {
            text_parts.push(t.clone());
        }
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    if text_parts.is_empty() {
        obj["content"] = Value::Null;
    } else {
        obj["content"] = Value::String(text_parts.join("\n"));
    }
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Parts(parts) => {
            for part in parts {
                if let ContentPart::ToolResult { tool_use_id, content, .. } = part {
                    return serde_json::json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    });
                }
            }
            serde_json::json!({"role": "tool", "tool_call_id": "", "content": ""})
        }
        MessageContent::Text(t) => serde_json::json!({
            "role": "tool",
            "tool_call_id": "",
            "content": t,
        }),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "openai_compat".into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: "openai_compat".into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let tool_calls = parse_openai_tool_calls(message);
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model,
        finish_reason,
    })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse one SSE data line into zero or more stream events.
///
/// `tool_call_index` correlates a chunk's `index` to the `call_id` seen on
/// that index's first ("started") chunk. OpenAI-compatible servers send the
/// real `id` and `function.name` once, then stream `function.arguments`
/// across further chunks that carry only `index` — without this map those
/// later chunks have no way back to the call they belong to.
fn parse_sse_data(data: &str, tool_call_index: &mut HashMap<u64, String>) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());

    // Usage-only chunk (stream_options.include_usage).
    let Some(choice) = choice else {
        return match v.get("usage").and_then(parse_openai_usage) {
            Some(usage) => vec![Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: None,
            })],
            None => Vec::new(),
        };
    };

    let delta = choice.get("delta").unwrap_or(&Value::Null);

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        let usage = v.get("usage").and_then(parse_openai_usage);
        return vec![Ok(StreamEvent::Done {
            usage,
            finish_reason: Some(fr.to_string()),
        })];
    }

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        let mut events = Vec::new();
        for tc in tc_arr {
            let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                tool_call_index.insert(idx, id.to_string());
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: id.to_string(),
                    tool_name: name.to_string(),
                }));
            }

            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                let call_id = tool_call_index
                    .entry(idx)
                    .or_insert_with(|| idx.to_string())
                    .clone();
                events.push(Ok(StreamEvent::ToolCallDelta {
                    call_id,
                    delta: args.to_string(),
                }));
            }
        }
        return events;
    }

    if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            return vec![Ok(StreamEvent::Error {
                message: format!("unexpected reasoning content: {text}"),
            })];
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            return vec![Ok(StreamEvent::Token { text: text.to_string() })];
        }
    }

    Vec::new()
}

/// Build a parser closure for one `chat_stream` call. The closure owns the
/// index -> call_id map for the lifetime of the stream so tool-call deltas
/// land on the same call their `ToolCallStarted` event opened.
fn make_sse_parser() -> impl FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static {
    let mut tool_call_index: HashMap<u64, String> = HashMap::new();
    move |data: &str| {
        if data.trim() == "[DONE]" {
            return vec![Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            })];
        }
        parse_sse_data(data, &mut tool_call_index)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, false);

        tracing::debug!(url = %url, "openai_compat chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: "openai_compat".into(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, true);

        tracing::debug!(url = %url, "openai_compat stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "openai_compat".into(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        Ok(crate::sse::sse_response_stream(resp, make_sse_parser()))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        "openai_compat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(completion_endpoint: &str) -> LlmConfig {
        LlmConfig {
            completion_endpoint: completion_endpoint.into(),
            model: "test-model".into(),
            summarizer_model: None,
            system_prompt: "test".into(),
            api_key_env: None,
            verify_tls: true,
            max_tool_iterations: 25,
        }
    }

    #[test]
    fn from_config_trims_trailing_slash() {
        let provider = OpenAiCompatProvider::from_config(&cfg("http://localhost:11434/v1/")).unwrap();
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn from_config_errors_on_missing_api_key_env() {
        let mut c = cfg("http://localhost:11434/v1");
        c.api_key_env = Some("SA_TEST_MISSING_KEY_9999".into());
        assert!(OpenAiCompatProvider::from_config(&c).is_err());
    }

    #[test]
    fn build_chat_body_includes_model_and_messages() {
        let provider = OpenAiCompatProvider::from_config(&cfg("http://localhost:11434/v1")).unwrap();
        let req = ChatRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let body = provider.build_chat_body(&req, false);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn parse_chat_response_extracts_content_and_tool_calls() {
        let raw = serde_json::json!({
            "model": "test-model",
            "choices": [{
                "message": {
                    "content": "hello",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "echo", "arguments": "{\"x\":1}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });
        let resp = parse_chat_response(&raw).unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "echo");
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn parse_sse_data_emits_token() {
        let raw = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut index = HashMap::new();
        let mut events = parse_sse_data(raw, &mut index);
        assert_eq!(events.len(), 1);
        let event = events.remove(0).unwrap();
        assert!(matches!(event, StreamEvent::Token { text } if text == "hi"));
    }

    #[test]
    fn parse_sse_data_done_sentinel() {
        let mut parser = make_sse_parser();
        let events = parser("[DONE]");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done { .. })));
    }

    // Regression test: a standard stream sends `id`+`function.name` on the
    // first tool-call chunk and only `index` on later argument chunks. Both
    // must resolve to the same call_id so the engine assembles one call.
    #[test]
    fn parse_sse_data_correlates_index_to_call_id_across_chunks() {
        let mut index = HashMap::new();

        let start = r#"{"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"call_abc","function":{"name":"echo","arguments":""}}
        ]}}]}"#;
        let started = parse_sse_data(start, &mut index);
        assert_eq!(started.len(), 1);
        match started[0].as_ref().unwrap() {
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                assert_eq!(call_id, "call_abc");
                assert_eq!(tool_name, "echo");
            }
            other => panic!("expected ToolCallStarted, got {other:?}"),
        }

        let delta1 = r#"{"choices":[{"delta":{"tool_calls":[
            {"index":0,"function":{"arguments":"{\"x\":"}}
        ]}}]}"#;
        let delta2 = r#"{"choices":[{"delta":{"tool_calls":[
            {"index":0,"function":{"arguments":"1}"}}
        ]}}]}"#;

        for raw in [delta1, delta2] {
            let events = parse_sse_data(raw, &mut index);
            assert_eq!(events.len(), 1);
            match events[0].as_ref().unwrap() {
                StreamEvent::ToolCallDelta { call_id, .. } => assert_eq!(call_id, "call_abc"),
                other => panic!("expected ToolCallDelta, got {other:?}"),
            }
        }
    }

    #[test]
    fn parse_sse_data_handles_multiple_tool_calls_in_one_chunk() {
        let mut index = HashMap::new();
        let raw = r#"{"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"call_a","function":{"name":"first","arguments":""}},
            {"index":1,"id":"call_b","function":{"name":"second","arguments":""}}
        ]}}]}"#;
        let events = parse_sse_data(raw, &mut index);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamEvent::ToolCallStarted { call_id, .. } if call_id == "call_a"
        ));
        assert!(matches!(
            events[1].as_ref().unwrap(),
            StreamEvent::ToolCallStarted { call_id, .. } if call_id == "call_b"
        ));
    }

    #[test]
    fn assistant_message_with_tool_use_serializes_tool_calls() {
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ToolUse {
                id: "c1".into(),
                name: "read_file".into(),
                input: serde_json::json!({"path": "a.txt"}),
            }]),
        };
        let v = assistant_to_openai(&msg);
        assert_eq!(v["tool_calls"][0]["function"]["name"], "read_file");
    }
}
