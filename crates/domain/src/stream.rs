use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage for one LLM call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Why the model stopped generating, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl StopReason {
    /// Normalize a provider stop/finish reason string.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "end_turn" | "stop" | "STOP" => Self::EndTurn,
            "tool_use" | "tool_calls" => Self::ToolUse,
            "max_tokens" | "length" | "MAX_TOKENS" => Self::MaxTokens,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted while streaming one LLM response (provider-agnostic).
///
/// The turn loop assembles these into assistant content blocks: text
/// deltas accumulate into a text block, tool-use events into tool calls.
#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    /// A fragment of assistant text.
    TextDelta { text: String },

    /// A tool_use block has opened.
    ToolUseStarted { id: String, name: String },

    /// Incremental JSON for an open tool_use block's input.
    ToolUseDelta { id: String, partial_json: String },

    /// A tool_use block is complete with parsed input.
    ToolUseFinished { id: String, name: String, input: Value },

    /// The response is finished; carries consolidated usage counters.
    Done {
        usage: Option<Usage>,
        stop_reason: Option<StopReason>,
    },

    /// An in-band provider error frame.
    Error { message: String },
}
