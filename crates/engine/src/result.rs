//! Result and timeline types for one engine run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sk_domain::message::Message;

/// Record of a single LLM API call within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub turn: u32,
    pub timestamp: String,
    pub model: String,
    pub stop_reason: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A single step in the agent's execution timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// "assistant" or "tool".
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
}

impl AgentStep {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
        }
    }

    pub fn tool(name: &str, input: Value, result: &str) -> Self {
        Self {
            role: "tool".into(),
            content: result.to_string(),
            tool_name: Some(name.to_string()),
            tool_input: Some(input),
            tool_result: Some(result.to_string()),
        }
    }
}

/// An output file harvested from a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFile {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub download_url: String,
}

/// Aggregated outcome of one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub answer: String,
    pub steps: Vec<AgentStep>,
    pub llm_calls: Vec<LlmCallRecord>,
    pub total_turns: u32,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub skills_used: Vec<String>,
    pub output_files: Vec<OutputFile>,
    /// The working message list at the end of the run; becomes the
    /// session's next agent context.
    pub final_messages: Vec<Message>,
}
