use super::Family;
use crate::message::{Message, Role, ToolCall};
use futures_core::future::BoxFuture;
use futures_core::stream::BoxStream;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Conversation as sent: the system prompt first, then the stored history.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

impl ChatRequest {
    /// Prefix `history` with a fresh system message; an empty prompt adds nothing.
    pub fn new(model: impl Into<String>, system: &str, history: &[Message], tools: Vec<ToolSpec>) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system.trim().is_empty() {
            messages.push(Message::system(system));
        }
        messages.extend_from_slice(history);
        Self {
            model: model.into(),
            messages,
            tools,
        }
    }

    /// Concatenated system text, for APIs that take it out of band.
    pub fn system_text(&self) -> Option<String> {
        let parts: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Everything except system messages.
    pub fn conversation(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect()
    }
}

/// What the model is told about a tool when tools are bound to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One streamed fragment, already lifted out of the provider's wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Block-indexed deltas (text or tool-call argument fragments).
    Blocks(Vec<BlockDelta>),
    /// A text delta, keyed by the provider's message id when it has one.
    Text { id: Option<String>, text: String },
    /// Complete tool-call descriptors, delivered once at the end of the turn.
    ToolCalls(Vec<ToolCall>),
}

impl Chunk {
    pub fn kind(&self) -> &'static str {
        match self {
            Chunk::Blocks(_) => "block",
            Chunk::Text { .. } => "text",
            Chunk::ToolCalls(_) => "tool-calls",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockDelta {
    pub index: Option<usize>,
    pub kind: BlockKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text(String),
    ToolUse {
        id: Option<String>,
        name: Option<String>,
        partial_json: String,
    },
}

impl BlockDelta {
    pub fn text(index: usize, text: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            kind: BlockKind::Text(text.into()),
        }
    }

    pub fn tool_use(index: usize, id: Option<String>, name: Option<String>, partial_json: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            kind: BlockKind::ToolUse {
                id,
                name,
                partial_json: partial_json.into(),
            },
        }
    }
}

pub type ChunkStream = BoxStream<'static, anyhow::Result<Chunk>>;

/// Provider interface: one streaming chat call.
pub trait Provider {
    fn name(&self) -> &'static str;

    /// How this provider's chunks are keyed and finalized.
    fn family(&self) -> Family;

    /// Start streaming a response.
    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, anyhow::Result<ChunkStream>>;
}
