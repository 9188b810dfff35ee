//! Conversation messages shared by every provider family.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

/// Message content: plain text, or the ordered content blocks of a block-indexed provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        index: usize,
        text: String,
    },
    ToolUse {
        index: usize,
        id: String,
        name: String,
        input: Value,
    },
}

impl Content {
    /// Text of the message, joining text blocks in order.
    pub fn text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    ContentBlock::ToolUse { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Tool-call arguments after end-of-turn parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Arguments {
    Parsed(Value),
    /// The model produced an argument string that is not valid JSON.
    Invalid { raw: String, error: String },
}

impl Arguments {
    /// Parse a serialized argument payload. An empty payload means "no arguments".
    pub fn from_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Arguments::Parsed(Value::Object(Default::default()));
        }
        match serde_json::from_str(trimmed) {
            Ok(v) => Arguments::Parsed(v),
            Err(e) => Arguments::Invalid {
                raw: raw.to_string(),
                error: e.to_string(),
            },
        }
    }

    /// Value to send back to a provider; arguments that never parsed go out as an empty object.
    pub fn to_wire(&self) -> Value {
        match self {
            Arguments::Parsed(v) => v.clone(),
            Arguments::Invalid { .. } => Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    /// Provider message id (id-keyed streaming providers only).
    pub id: Option<String>,
    /// Normalized tool calls requested by an assistant turn, in message order.
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool results: the call this result answers.
    pub tool_call_id: Option<String>,
    /// Set on tool results: the tool that produced it.
    pub name: Option<String>,
    pub is_error: bool,
}

impl Message {
    fn new(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            id: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            is_error: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Content::Text(text.into()))
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, Content::Text(text.into()))
    }

    pub fn assistant(content: Content) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(call: &ToolCall, text: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            is_error,
            ..Self::new(Role::Tool, Content::Text(text.into()))
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}
