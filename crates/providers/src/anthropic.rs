//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use, streaming,
//! and the Anthropic-specific message structure where system text goes in
//! a separate top-level `system` field.

use crate::models;
use crate::traits::{LlmClient, LlmRequest, LlmResponse};
use crate::util::{from_reqwest, http_client, resolve_api_key};
use sk_domain::error::{Error, Result};
use sk_domain::message::{ContentBlock, Message, MessageContent, Role, ToolDefinition};
use sk_domain::stream::{BoxStream, LlmStreamEvent, StopReason, Usage};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM client for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    context_limit: u64,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(model: impl Into<String>, api_key: Option<&str>) -> Result<Self> {
        let model = model.into();
        let api_key = resolve_api_key(api_key, "ANTHROPIC_API_KEY")?;
        Ok(Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            context_limit: models::context_limit("anthropic", &model),
            api_key,
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
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &LlmRequest, stream: bool) -> Value {
        let api_messages: Vec<Value> = req.messages.iter().map(msg_to_anthropic).collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": req.max_tokens,
            "stream": stream,
        });

        if let Some(system) = &req.system {
            body["system"] = Value::String(system.clone());
        }

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_anthropic(msg: &Message) -> Value {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": role,
            "content": t,
        }),
        MessageContent::Blocks(blocks) => {
            let content: Vec<Value> = blocks.iter().map(block_to_anthropic).collect();
            serde_json::json!({
                "role": role,
                "content": content,
            })
        }
    }
}

fn block_to_anthropic(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentBlock::Image { source } => serde_json::json!({
            "type": "image",
            "source": source,
        }),
    }
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_anthropic_response(body: &Value) -> Result<LlmResponse> {
    let empty = Vec::new();
    let content_arr = body
        .get("content")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut content: Vec<ContentBlock> = Vec::new();

    for block in content_arr {
        let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match block_type {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    content.push(ContentBlock::Text { text: t.to_string() });
                }
            }
            "tool_use" => {
                content.push(ContentBlock::ToolUse {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    input: block
                        .get("input")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                });
            }
            _ => {}
        }
    }

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let stop_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(StopReason::from_provider)
        .unwrap_or(StopReason::EndTurn);

    let usage = body
        .get("usage")
        .and_then(parse_anthropic_usage)
        .unwrap_or_default();

    Ok(LlmResponse {
        content,
        stop_reason,
        usage,
        model,
    })
}

fn parse_anthropic_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()?;
    let output = v.get("output_tokens")?.as_u64()?;
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Internal state for assembling tool calls from streaming content blocks.
struct StreamState {
    /// Active tool_use blocks (block index -> (id, name, args buffer)).
    active_tool_uses: std::collections::HashMap<u64, (String, String, String)>,
    /// Input tokens from message_start; output tokens arrive in message_delta.
    usage: Option<Usage>,
    done_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active_tool_uses: std::collections::HashMap::new(),
            usage: None,
            done_emitted: false,
        }
    }
}

/// Parse a single Anthropic SSE data payload and produce zero or more
/// stream events.
fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<LlmStreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    let event_type = v.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_anthropic_usage);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
                if block_type == "tool_use" {
                    let id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    events.push(Ok(LlmStreamEvent::ToolUseStarted {
                        id: id.clone(),
                        name: name.clone(),
                    }));
                    state.active_tool_uses.insert(idx, (id, name, String::new()));
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match delta_type {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(Ok(LlmStreamEvent::TextDelta {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tu) = state.active_tool_uses.get_mut(&idx) {
                                tu.2.push_str(partial);
                                events.push(Ok(LlmStreamEvent::ToolUseDelta {
                                    id: tu.0.clone(),
                                    partial_json: partial.to_string(),
                                }));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some((id, name, args_str)) = state.active_tool_uses.remove(&idx) {
                let input: Value =
                    serde_json::from_str(&args_str).unwrap_or(Value::Object(Default::default()));
                events.push(Ok(LlmStreamEvent::ToolUseFinished { id, name, input }));
            }
        }

        "message_delta" => {
            if let Some(usage_val) = v.get("usage") {
                if let Some(output) = usage_val.get("output_tokens").and_then(|v| v.as_u64()) {
                    if let Some(ref mut u) = state.usage {
                        u.output_tokens = output;
                    }
                }
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(StopReason::from_provider);
            if stop_reason.is_some() {
                state.done_emitted = true;
                events.push(Ok(LlmStreamEvent::Done {
                    usage: state.usage,
                    stop_reason,
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(LlmStreamEvent::Done {
                    usage: state.usage,
                    stop_reason: Some(StopReason::EndTurn),
                }));
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            events.push(Ok(LlmStreamEvent::Error {
                message: msg.to_string(),
            }));
        }

        _ => {
            // ping or unknown event types -- ignore.
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    async fn call(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(req, false);

        tracing::debug!(model = %self.model, url = %url, "anthropic call");

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
                provider: "anthropic".into(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_anthropic_response(&resp_json)
    }

    async fn call_stream(
        &self,
        req: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(req, true);

        tracing::debug!(model = %self.model, url = %url, "anthropic stream");

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
                provider: "anthropic".into(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_anthropic_sse(data, &mut state)
        }))
    }

    fn context_limit(&self) -> u64 {
        self.context_limit
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_block_serializes_in_user_message() {
        let msg = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "42".into(),
            is_error: false,
        }]);
        let v = msg_to_anthropic(&msg);
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"][0]["type"], "tool_result");
        assert_eq!(v["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn parse_response_with_tool_use() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "tu_1", "name": "list_skills", "input": {}},
            ],
            "usage": {"input_tokens": 120, "output_tokens": 30},
        });
        let resp = parse_anthropic_response(&body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.content.len(), 2);
        assert_eq!(resp.usage.input_tokens, 120);
        assert_eq!(resp.text_content(), "Let me check.");
    }

    #[test]
    fn parse_max_tokens_stop_reason() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "max_tokens",
            "content": [],
            "usage": {"input_tokens": 1, "output_tokens": 2},
        });
        let resp = parse_anthropic_response(&body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn sse_tool_use_assembly() {
        let mut state = StreamState::new();

        parse_anthropic_sse(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":10,"output_tokens":1}}}"#,
            &mut state,
        );
        let started = parse_anthropic_sse(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_9","name":"bash"}}"#,
            &mut state,
        );
        assert!(matches!(
            started[0].as_ref().unwrap(),
            LlmStreamEvent::ToolUseStarted { id, .. } if id == "tu_9"
        ));

        parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}"#,
            &mut state,
        );
        parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"ls\"}"}}"#,
            &mut state,
        );

        let finished = parse_anthropic_sse(
            r#"{"type":"content_block_stop","index":0}"#,
            &mut state,
        );
        match finished[0].as_ref().unwrap() {
            LlmStreamEvent::ToolUseFinished { id, name, input } => {
                assert_eq!(id, "tu_9");
                assert_eq!(name, "bash");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("expected ToolUseFinished, got {other:?}"),
        }
    }

    #[test]
    fn sse_message_delta_emits_done_with_usage() {
        let mut state = StreamState::new();
        parse_anthropic_sse(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":50,"output_tokens":0}}}"#,
            &mut state,
        );
        let done = parse_anthropic_sse(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            &mut state,
        );
        match done[0].as_ref().unwrap() {
            LlmStreamEvent::Done { usage, stop_reason } => {
                let u = usage.unwrap();
                assert_eq!(u.input_tokens, 50);
                assert_eq!(u.output_tokens, 7);
                assert_eq!(stop_reason.as_ref().unwrap(), &StopReason::EndTurn);
            }
            other => panic!("expected Done, got {other:?}"),
        }
        // message_stop after a Done must not emit a second Done.
        let stop = parse_anthropic_sse(r#"{"type":"message_stop"}"#, &mut state);
        assert!(stop.is_empty());
    }
}
