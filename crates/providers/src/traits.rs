use sk_domain::error::Result;
use sk_domain::message::{ContentBlock, Message, ToolDefinition};
use sk_domain::stream::{BoxStream, LlmStreamEvent, StopReason, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic LLM request.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// System text, passed out-of-band (Anthropic `system` field,
    /// OpenAI system message, Gemini `systemInstruction`).
    pub system: Option<String>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Maximum tokens in the response.
    pub max_tokens: u32,
}

/// A normalized LLM response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Assistant content blocks (text and tool_use).
    pub content: Vec<ContentBlock>,
    /// Why the model stopped.
    pub stop_reason: StopReason,
    /// Token usage counters.
    pub usage: Usage,
    /// The model that produced the response.
    pub model: String,
}

impl LlmResponse {
    /// Joined text of all text blocks.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter implements.
///
/// `call` is the non-streaming path; `call_stream` yields incremental
/// events and finishes with a `Done` carrying consolidated usage.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// Send a request and wait for the full response.
    async fn call(&self, req: &LlmRequest) -> Result<LlmResponse>;

    /// Send a request and return a stream of incremental events.
    async fn call_stream(
        &self,
        req: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>>;

    /// Context-window size for this provider/model pair.
    fn context_limit(&self) -> u64;

    /// Provider identifier ("anthropic", "openai", "openrouter", "google").
    fn provider_id(&self) -> &str;

    /// The configured model name.
    fn model(&self) -> &str;
}
