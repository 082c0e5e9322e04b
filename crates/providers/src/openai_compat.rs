//! OpenAI-compatible adapter.
//!
//! Serves both OpenAI itself and OpenRouter (same chat-completions wire
//! format, different base URL and auth env var). Tool results travel as
//! `role: "tool"` messages on the wire; internally they are user-role
//! tool_result blocks, so this adapter fans one carrier message out into
//! one wire message per block.

use crate::models;
use crate::traits::{LlmClient, LlmRequest, LlmResponse};
use crate::util::{from_reqwest, http_client, resolve_api_key};
use sk_domain::error::{Error, Result};
use sk_domain::message::{ContentBlock, Message, MessageContent, Role, ToolDefinition};
use sk_domain::stream::{BoxStream, LlmStreamEvent, StopReason, Usage};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM client for any OpenAI-compatible chat-completions endpoint.
#[derive(Debug)]
pub struct OpenAiCompatClient {
    provider_id: String,
    base_url: String,
    api_key: String,
    model: String,
    context_limit: u64,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// OpenAI proper.
    pub fn openai(model: impl Into<String>, api_key: Option<&str>) -> Result<Self> {
        Self::new(
            "openai",
            "https://api.openai.com/v1",
            model,
            api_key,
            "OPENAI_API_KEY",
        )
    }

    /// OpenRouter — same wire format, model ids are `vendor/model`.
    pub fn openrouter(model: impl Into<String>, api_key: Option<&str>) -> Result<Self> {
        Self::new(
            "openrouter",
            "https://openrouter.ai/api/v1",
            model,
            api_key,
            "OPENROUTER_API_KEY",
        )
    }

    fn new(
        provider_id: &str,
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<&str>,
        env_var: &str,
    ) -> Result<Self> {
        let model = model.into();
        Ok(Self {
            provider_id: provider_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: resolve_api_key(api_key, env_var)?,
            context_limit: models::context_limit(provider_id, &model),
            model,
            client: http_client()?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn build_chat_body(&self, req: &LlmRequest, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(serde_json::json!({
                "role": "system",
                "content": system,
            }));
        }
        for msg in &req.messages {
            messages.extend(msg_to_openai(msg));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
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

/// One internal message can map to several wire messages (a tool-result
/// carrier becomes one `role: "tool"` message per block).
fn msg_to_openai(msg: &Message) -> Vec<Value> {
    match msg.role {
        Role::Assistant => vec![assistant_to_openai(msg)],
        Role::User => {
            if msg.has_tool_results() {
                tool_results_to_openai(msg)
            } else {
                vec![serde_json::json!({
                    "role": "user",
                    "content": msg.content.extract_all_text(),
                })]
            }
        }
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
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

fn tool_results_to_openai(msg: &Message) -> Vec<Value> {
    let blocks = match &msg.content {
        MessageContent::Blocks(blocks) => blocks,
        MessageContent::Text(_) => return Vec::new(),
    };
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => Some(serde_json::json!({
                "role": "tool",
                "tool_call_id": tool_use_id,
                "content": content,
            })),
            _ => None,
        })
        .collect()
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(provider_id: &str, body: &Value) -> Result<LlmResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: provider_id.to_string(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: provider_id.to_string(),
        message: "no message in choice".into(),
    })?;

    let mut content: Vec<ContentBlock> = Vec::new();
    if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.to_string() });
        }
    }
    content.extend(parse_openai_tool_calls(message));

    let stop_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(StopReason::from_provider)
        .unwrap_or(StopReason::EndTurn);

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let usage = body
        .get("usage")
        .and_then(parse_openai_usage)
        .unwrap_or_default();

    Ok(LlmResponse {
        content,
        stop_reason,
        usage,
        model,
    })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ContentBlock> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let input: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ContentBlock::ToolUse { id, name, input })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: v.get("prompt_tokens")?.as_u64()?,
        output_tokens: v.get("completion_tokens")?.as_u64()?,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streaming state: OpenAI keys tool-call deltas by array index, and the
/// finish chunk may arrive before the usage chunk, so both are held until
/// the stream can emit a single consolidated `Done`.
struct StreamState {
    /// index -> (call id, name, args buffer)
    tool_calls: std::collections::HashMap<u64, (String, String, String)>,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            tool_calls: std::collections::HashMap::new(),
            stop_reason: None,
            usage: None,
        }
    }

    /// Flush assembled tool calls as ToolUseFinished events.
    fn finish_tool_calls(&mut self) -> Vec<Result<LlmStreamEvent>> {
        let mut indices: Vec<u64> = self.tool_calls.keys().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|idx| {
                let (id, name, args) = self.tool_calls.remove(&idx)?;
                let input: Value =
                    serde_json::from_str(&args).unwrap_or(Value::Object(Default::default()));
                Some(Ok(LlmStreamEvent::ToolUseFinished { id, name, input }))
            })
            .collect()
    }
}

fn parse_openai_sse(data: &str, state: &mut StreamState) -> Vec<Result<LlmStreamEvent>> {
    if data.trim() == "[DONE]" {
        let mut events = state.finish_tool_calls();
        events.push(Ok(LlmStreamEvent::Done {
            usage: state.usage,
            stop_reason: state.stop_reason.clone().or(Some(StopReason::EndTurn)),
        }));
        return events;
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
        state.usage = Some(usage);
    }

    let choice = match v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    {
        Some(c) => c,
        None => return Vec::new(),
    };

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        state.stop_reason = Some(StopReason::from_provider(fr));
    }

    let delta = choice.get("delta").unwrap_or(&Value::Null);
    let mut events = Vec::new();

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                events.push(Ok(LlmStreamEvent::ToolUseStarted {
                    id: id.to_string(),
                    name: name.to_string(),
                }));
                state
                    .tool_calls
                    .insert(idx, (id.to_string(), name.to_string(), String::new()));
            }
            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if let Some(entry) = state.tool_calls.get_mut(&idx) {
                    entry.2.push_str(args);
                    events.push(Ok(LlmStreamEvent::ToolUseDelta {
                        id: entry.0.clone(),
                        partial_json: args.to_string(),
                    }));
                }
            }
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(LlmStreamEvent::TextDelta {
                text: text.to_string(),
            }));
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn call(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.provider_id, model = %self.model, "chat call");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.provider_id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.provider_id, &resp_json)
    }

    async fn call_stream(
        &self,
        req: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, true);

        tracing::debug!(provider = %self.provider_id, model = %self.model, "chat stream");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: self.provider_id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_openai_sse(data, &mut state)
        }))
    }

    fn context_limit(&self) -> u64 {
        self.context_limit
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_carrier_fans_out_to_tool_messages() {
        let msg = Message::tool_results(vec![
            ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: "a".into(),
                is_error: false,
            },
            ContentBlock::ToolResult {
                tool_use_id: "call_2".into(),
                content: "b".into(),
                is_error: true,
            },
        ]);
        let wire = msg_to_openai(&msg);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_1");
        assert_eq!(wire[1]["tool_call_id"], "call_2");
    }

    #[test]
    fn assistant_with_tool_use_maps_to_tool_calls() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text { text: "running".into() },
            ContentBlock::ToolUse {
                id: "call_9".into(),
                name: "bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
        ]);
        let wire = msg_to_openai(&msg);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["tool_calls"][0]["id"], "call_9");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "bash");
    }

    #[test]
    fn parse_length_finish_reason_as_max_tokens() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {"content": "partial"},
                "finish_reason": "length",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 100},
        });
        let resp = parse_chat_response("openai", &body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
        assert_eq!(resp.usage.output_tokens, 100);
    }

    #[test]
    fn sse_stream_assembles_tool_call_and_done() {
        let mut state = StreamState::new();

        let started = parse_openai_sse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read_file","arguments":""}}]}}]}"#,
            &mut state,
        );
        assert!(matches!(
            started[0].as_ref().unwrap(),
            LlmStreamEvent::ToolUseStarted { name, .. } if name == "read_file"
        ));

        parse_openai_sse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":\"x\"}"}}]}}]}"#,
            &mut state,
        );
        parse_openai_sse(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            &mut state,
        );
        parse_openai_sse(
            r#"{"choices":[],"usage":{"prompt_tokens":11,"completion_tokens":3}}"#,
            &mut state,
        );

        let done = parse_openai_sse("[DONE]", &mut state);
        assert_eq!(done.len(), 2);
        match done[0].as_ref().unwrap() {
            LlmStreamEvent::ToolUseFinished { id, input, .. } => {
                assert_eq!(id, "call_1");
                assert_eq!(input["path"], "x");
            }
            other => panic!("expected ToolUseFinished, got {other:?}"),
        }
        match done[1].as_ref().unwrap() {
            LlmStreamEvent::Done { usage, stop_reason } => {
                assert_eq!(usage.unwrap().input_tokens, 11);
                assert_eq!(stop_reason.as_ref().unwrap(), &StopReason::ToolUse);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }
}
