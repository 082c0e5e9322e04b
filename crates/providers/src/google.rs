//! Google Gemini adapter.
//!
//! Implements the Gemini `generateContent` and `streamGenerateContent`
//! APIs. Gemini function calls carry no call id, so the adapter
//! synthesizes `{name}#{n}` ids on the way in and recovers the function
//! name from the id when serializing `functionResponse` parts back out.

use crate::models;
use crate::traits::{LlmClient, LlmRequest, LlmResponse};
use crate::util::{from_reqwest, http_client, resolve_api_key};
use sk_domain::error::{Error, Result};
use sk_domain::message::{ContentBlock, Message, MessageContent, Role, ToolDefinition};
use sk_domain::stream::{BoxStream, LlmStreamEvent, StopReason, Usage};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct GoogleClient {
    base_url: String,
    api_key: String,
    model: String,
    context_limit: u64,
    client: reqwest::Client,
}

impl GoogleClient {
    pub fn new(model: impl Into<String>, api_key: Option<&str>) -> Result<Self> {
        let model = model.into();
        Ok(Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: resolve_api_key(api_key, "GOOGLE_API_KEY")?,
            context_limit: models::context_limit("google", &model),
            model,
            client: http_client()?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn build_body(&self, req: &LlmRequest) -> Value {
        let contents: Vec<Value> = req.messages.iter().map(msg_to_gemini).collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": req.max_tokens,
            },
        });

        if let Some(system) = &req.system {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{"text": system}],
            });
        }

        if !req.tools.is_empty() {
            let decls: Vec<Value> = req.tools.iter().map(tool_to_gemini).collect();
            body["tools"] = serde_json::json!([{"functionDeclarations": decls}]);
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Synthesize a call id for a Gemini function call.
fn synth_call_id(name: &str, n: usize) -> String {
    format!("{name}#{n}")
}

/// Recover the function name from a synthesized call id.
fn name_from_call_id(id: &str) -> &str {
    id.split('#').next().unwrap_or(id)
}

fn msg_to_gemini(msg: &Message) -> Value {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "model",
    };

    let parts: Vec<Value> = match &msg.content {
        MessageContent::Text(t) => vec![serde_json::json!({"text": t})],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => serde_json::json!({"text": text}),
                ContentBlock::ToolUse { id: _, name, input } => serde_json::json!({
                    "functionCall": {
                        "name": name,
                        "args": input,
                    }
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => serde_json::json!({
                    "functionResponse": {
                        "name": name_from_call_id(tool_use_id),
                        "response": {
                            "content": content,
                        }
                    }
                }),
                ContentBlock::Image { source } => {
                    let mime = source
                        .get("media_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("image/png");
                    let data = source.get("data").and_then(|v| v.as_str()).unwrap_or("");
                    serde_json::json!({
                        "inlineData": {
                            "mimeType": mime,
                            "data": data,
                        }
                    })
                }
            })
            .collect(),
    };

    serde_json::json!({
        "role": role,
        "parts": parts,
    })
}

fn tool_to_gemini(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.input_schema,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_gemini_response(body: &Value) -> Result<LlmResponse> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "google".into(),
            message: "no candidates in response".into(),
        })?;

    let mut content: Vec<ContentBlock> = Vec::new();
    let mut fc_count = 0usize;

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                content.push(ContentBlock::Text { text: text.to_string() });
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                content.push(ContentBlock::ToolUse {
                    id: synth_call_id(&name, fc_count),
                    name,
                    input: fc
                        .get("args")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                });
                fc_count += 1;
            }
        }
    }

    let has_tool_use = fc_count > 0;
    let stop_reason = match candidate.get("finishReason").and_then(|v| v.as_str()) {
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        Some("STOP") | None => {
            if has_tool_use {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }
        }
        Some(other) => StopReason::Other(other.to_string()),
    };

    let model = body
        .get("modelVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let usage = body
        .get("usageMetadata")
        .and_then(parse_gemini_usage)
        .unwrap_or_default();

    Ok(LlmResponse {
        content,
        stop_reason,
        usage,
        model,
    })
}

fn parse_gemini_usage(v: &Value) -> Option<Usage> {
    let input = v.get("promptTokenCount")?.as_u64()?;
    let output = v
        .get("candidatesTokenCount")
        .and_then(|c| c.as_u64())
        .unwrap_or(0);
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gemini SSE chunks are full `generateContent` JSON fragments; function
/// calls always arrive whole, so they map to Started+Finished pairs.
struct StreamState {
    fc_count: usize,
    usage: Option<Usage>,
    saw_tool_use: bool,
    finish_reason: Option<String>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            fc_count: 0,
            usage: None,
            saw_tool_use: false,
            finish_reason: None,
        }
    }
}

fn parse_gemini_sse(data: &str, state: &mut StreamState) -> Vec<Result<LlmStreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let mut events = Vec::new();

    if let Some(usage) = v.get("usageMetadata").and_then(parse_gemini_usage) {
        state.usage = Some(usage);
    }

    if let Some(candidate) = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    {
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        events.push(Ok(LlmStreamEvent::TextDelta {
                            text: text.to_string(),
                        }));
                    }
                }
                if let Some(fc) = part.get("functionCall") {
                    let name = fc
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("")
                        .to_string();
                    let id = synth_call_id(&name, state.fc_count);
                    state.fc_count += 1;
                    state.saw_tool_use = true;
                    events.push(Ok(LlmStreamEvent::ToolUseStarted {
                        id: id.clone(),
                        name: name.clone(),
                    }));
                    events.push(Ok(LlmStreamEvent::ToolUseFinished {
                        id,
                        name,
                        input: fc
                            .get("args")
                            .cloned()
                            .unwrap_or(Value::Object(Default::default())),
                    }));
                }
            }
        }

        if let Some(fr) = candidate.get("finishReason").and_then(|f| f.as_str()) {
            state.finish_reason = Some(fr.to_string());
            let stop_reason = match fr {
                "MAX_TOKENS" => StopReason::MaxTokens,
                "STOP" => {
                    if state.saw_tool_use {
                        StopReason::ToolUse
                    } else {
                        StopReason::EndTurn
                    }
                }
                other => StopReason::Other(other.to_string()),
            };
            events.push(Ok(LlmStreamEvent::Done {
                usage: state.usage,
                stop_reason: Some(stop_reason),
            }));
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmClient for GoogleClient {
    async fn call(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_body(req);

        tracing::debug!(model = %self.model, "gemini call");

        let resp = self
            .client
            .post(self.generate_url())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: "google".into(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_gemini_response(&resp_json)
    }

    async fn call_stream(
        &self,
        req: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        let body = self.build_body(req);

        tracing::debug!(model = %self.model, "gemini stream");

        let resp = self
            .client
            .post(self.stream_url())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "google".into(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_gemini_sse(data, &mut state)
        }))
    }

    fn context_limit(&self) -> u64 {
        self.context_limit
    }

    fn provider_id(&self) -> &str {
        "google"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_roundtrip() {
        let id = synth_call_id("web_fetch", 2);
        assert_eq!(id, "web_fetch#2");
        assert_eq!(name_from_call_id(&id), "web_fetch");
    }

    #[test]
    fn tool_result_maps_to_function_response_with_name() {
        let msg = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "get_skill#0".into(),
            content: "doc text".into(),
            is_error: false,
        }]);
        let v = msg_to_gemini(&msg);
        assert_eq!(v["role"], "user");
        assert_eq!(v["parts"][0]["functionResponse"]["name"], "get_skill");
    }

    #[test]
    fn parse_function_call_response() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"functionCall": {"name": "list_skills", "args": {}}},
                    ],
                },
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 4},
        });
        let resp = parse_gemini_response(&body).unwrap();
        // STOP plus a function call normalizes to tool_use.
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        match &resp.content[0] {
            ContentBlock::ToolUse { id, name, .. } => {
                assert_eq!(name, "list_skills");
                assert_eq!(id, "list_skills#0");
            }
            other => panic!("expected ToolUse, got {other:?}"),
        }
    }

    #[test]
    fn parse_max_tokens_finish() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "trunc"}]},
                "finishReason": "MAX_TOKENS",
            }],
        });
        let resp = parse_gemini_response(&body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
    }
}
