//! Typed events pushed to the event stream during a run.
//!
//! Each event serializes as one flat JSON object:
//! `{"event_type": "...", "turn": N, ...payload fields}` — the shape the
//! transport forwards to clients one SSE frame at a time.

use serde::Serialize;
use serde_json::Value;

use sk_domain::message::Message;

use crate::result::OutputFile;

#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub turn: u32,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn new(turn: u32, payload: EventPayload) -> Self {
        Self { turn, payload }
    }

    /// The `event_type` discriminant, for logging and tests.
    pub fn event_type(&self) -> &'static str {
        match &self.payload {
            EventPayload::RunStarted { .. } => "run_started",
            EventPayload::TurnStart { .. } => "turn_start",
            EventPayload::TextDelta { .. } => "text_delta",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::OutputFileEvent { .. } => "output_file",
            EventPayload::Assistant { .. } => "assistant",
            EventPayload::TurnComplete { .. } => "turn_complete",
            EventPayload::ContextCompressed { .. } => "context_compressed",
            EventPayload::SteeringReceived { .. } => "steering_received",
            EventPayload::Complete { .. } => "complete",
            EventPayload::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    TurnStart {
        max_turns: u32,
    },
    TextDelta {
        text: String,
    },
    ToolCall {
        tool_name: String,
        tool_input: Value,
    },
    /// `tool_result` carries a truncated preview for UI display.
    ToolResult {
        tool_name: String,
        tool_input: Value,
        tool_result: String,
    },
    #[serde(rename = "output_file")]
    OutputFileEvent {
        #[serde(flatten)]
        file: OutputFile,
    },
    /// Final text produced by the post-budget summary call.
    Assistant {
        content: String,
    },
    TurnComplete {
        messages_snapshot: Vec<Message>,
    },
    ContextCompressed {
        previous_tokens: u64,
        context_limit: u64,
    },
    SteeringReceived {
        message: String,
    },
    Complete {
        success: bool,
        answer: String,
        total_turns: u32,
        total_input_tokens: u64,
        total_output_tokens: u64,
        skills_used: Vec<String>,
        output_files: Vec<OutputFile>,
        final_messages: Vec<Message>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },
}
