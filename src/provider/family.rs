//! End-of-turn normalization, one variant per provider family.

use crate::error::ChatError;
use crate::message::{Arguments, Content, ContentBlock, Message, ToolCall};
use crate::stream::{Slot, SlotKey, Turn};
use serde_json::Value;

/// Substituted for an assistant turn that ended without any text.
pub const EMPTY_TEXT_PLACEHOLDER: &str = "(no content)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Content blocks addressed by index; tool arguments stream as JSON fragments.
    BlockIndexed,
    /// One text stream keyed by message id; tool calls arrive complete.
    MessageId,
    /// One text stream rendered into a single fixed slot; tool calls arrive complete.
    FixedSlot,
}

impl Family {
    pub fn finalize(self, turn: Turn) -> Result<Message, ChatError> {
        match self {
            Family::BlockIndexed => finalize_blocks(turn),
            Family::MessageId | Family::FixedSlot => Ok(finalize_text(turn)),
        }
    }
}

fn finalize_blocks(turn: Turn) -> Result<Message, ChatError> {
    let mut blocks = Vec::with_capacity(turn.slots.len());
    let mut calls = Vec::new();

    for (key, slot) in turn.slots {
        let SlotKey::Index(index) = key else {
            return Err(ChatError::MalformedChunk(format!(
                "slot {key} in a block-indexed turn"
            )));
        };
        match slot {
            Slot::Text(text) => blocks.push(ContentBlock::Text { index, text }),
            Slot::ToolUse {
                id,
                name,
                raw_arguments,
            } => {
                if id.is_empty() || name.is_empty() {
                    return Err(ChatError::MalformedChunk(format!(
                        "tool-use block {index} has no id or name"
                    )));
                }
                let arguments = Arguments::from_raw(&raw_arguments);
                let input = match &arguments {
                    Arguments::Parsed(v) => v.clone(),
                    Arguments::Invalid { raw, error } => {
                        tracing::warn!(tool = %name, %error, "tool arguments are not valid JSON");
                        Value::String(raw.clone())
                    }
                };
                blocks.push(ContentBlock::ToolUse {
                    index,
                    id: id.clone(),
                    name: name.clone(),
                    input,
                });
                calls.push(ToolCall {
                    id,
                    name,
                    arguments,
                });
            }
        }
    }

    Ok(Message::assistant(Content::Blocks(blocks))
        .with_id(turn.id)
        .with_tool_calls(calls))
}

fn finalize_text(turn: Turn) -> Message {
    let Turn {
        id,
        mut slots,
        arrival,
        tool_calls,
    } = turn;
    let mut text = String::new();
    for key in &arrival {
        if let Some(Slot::Text(t)) = slots.remove(key) {
            text.push_str(&t);
        }
    }
    if text.is_empty() {
        text = EMPTY_TEXT_PLACEHOLDER.to_string();
    }
    Message::assistant(Content::Text(text))
        .with_id(id)
        .with_tool_calls(tool_calls)
}
