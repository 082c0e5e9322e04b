use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by the model (provider-agnostic).
/// Every adapter converts provider-specific tool calls to/from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub input_schema: Value,
}

/// A message in the conversation.
///
/// Tool results travel as user-role messages carrying `tool_result`
/// blocks, mirroring the wire shape the Anthropic Messages API expects.
/// System text is not a message — providers take it as a separate field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        source: Value,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// A user-role message carrying tool results, one block per result.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self::user_blocks(results)
    }

    /// A logical turn starts at a user message whose content is not a
    /// list of tool_result blocks.
    pub fn is_turn_boundary(&self) -> bool {
        self.role == Role::User && !self.has_tool_results()
    }

    pub fn has_tool_results(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. })),
        }
    }

    /// Character length of the serialized content. The compressor uses
    /// this for its chars-per-token estimate.
    pub fn content_chars(&self) -> usize {
        serde_json::to_string(&self.content)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl MessageContent {
    /// Extract and join all plain-text content, returning an owned String.
    ///
    /// For `Text`, returns the string directly. For `Blocks`, joins all
    /// `Text` blocks with `"\n"`; tool and image blocks are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// First text fragment, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_boundary_on_plain_user_message() {
        assert!(Message::user("hello").is_turn_boundary());
    }

    #[test]
    fn tool_result_carrier_is_not_a_boundary() {
        let msg = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "ok".into(),
            is_error: false,
        }]);
        assert!(!msg.is_turn_boundary());
        assert!(msg.has_tool_results());
    }

    #[test]
    fn assistant_message_is_not_a_boundary() {
        assert!(!Message::assistant("hi").is_turn_boundary());
    }

    #[test]
    fn user_blocks_without_tool_results_is_a_boundary() {
        let msg = Message::user_blocks(vec![
            ContentBlock::Image {
                source: serde_json::json!({"type": "base64", "data": "…"}),
            },
            ContentBlock::Text { text: "what is this?".into() },
        ]);
        assert!(msg.is_turn_boundary());
    }

    #[test]
    fn extract_all_text_joins_text_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "line one".into() },
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "bash".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::Text { text: "line two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "line one\nline two");
    }

    #[test]
    fn content_block_serializes_with_type_tag() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "read_file".into(),
            input: serde_json::json!({"file_path": "a.txt"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "read_file");
    }

    #[test]
    fn tool_result_is_error_defaults_false() {
        let json = serde_json::json!({
            "type": "tool_result",
            "tool_use_id": "tu_1",
            "content": "done",
        });
        let block: ContentBlock = serde_json::from_value(json).unwrap();
        match block {
            ContentBlock::ToolResult { is_error, .. } => assert!(!is_error),
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn message_content_untagged_roundtrip() {
        let msg = Message::user("plain");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.content, MessageContent::Text(t) if t == "plain"));
    }
}
