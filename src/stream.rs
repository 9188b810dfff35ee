//! Folding streamed chunks into the assistant message of one turn.

use crate::error::ChatError;
use crate::message::{Message, Role, ToolCall};
use crate::provider::{BlockKind, Chunk, ChunkStream, Family};
use crate::render::Renderer;
use anyhow::Context;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use tokio_stream::StreamExt;

/// Where a fragment lives within the turn being streamed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotKey {
    Index(usize),
    Id(String),
    Fixed,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Index(i) => write!(f, "#{i}"),
            SlotKey::Id(id) => write!(f, "{id}"),
            SlotKey::Fixed => write!(f, "main"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        raw_arguments: String,
    },
}

/// Renderable text that changed during the last merge; `text` is the whole slot so far.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub key: SlotKey,
    pub text: String,
}

/// Everything gathered for a turn, handed to the family for finalization.
#[derive(Debug)]
pub struct Turn {
    pub id: Option<String>,
    pub slots: BTreeMap<SlotKey, Slot>,
    /// Slot keys in the order their first fragment arrived.
    pub arrival: Vec<SlotKey>,
    pub tool_calls: Vec<ToolCall>,
}

/// The not-yet-finalized assistant message of the turn in flight.
#[derive(Debug)]
pub struct Accumulator {
    family: Family,
    turn: Turn,
}

impl Accumulator {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            turn: Turn {
                id: None,
                slots: BTreeMap::new(),
                arrival: Vec::new(),
                tool_calls: Vec::new(),
            },
        }
    }

    pub fn merge(&mut self, chunk: Chunk) -> Result<Vec<Fragment>, ChatError> {
        match (self.family, chunk) {
            (Family::BlockIndexed, Chunk::Blocks(deltas)) => {
                let mut changed: Vec<Fragment> = Vec::new();
                for delta in deltas {
                    let index = delta.index.ok_or_else(|| {
                        ChatError::MalformedChunk("content block delta without index".into())
                    })?;
                    let key = SlotKey::Index(index);
                    if let Some(text) = self.merge_block(key.clone(), delta.kind)? {
                        changed.retain(|f| f.key != key);
                        changed.push(Fragment { key, text });
                    }
                }
                Ok(changed.into_iter().filter(|f| !f.text.is_empty()).collect())
            }
            (Family::MessageId, Chunk::Text { id, text }) => {
                let id = id.ok_or_else(|| {
                    ChatError::MalformedChunk("text delta without message id".into())
                })?;
                if self.turn.id.is_none() {
                    self.turn.id = Some(id.clone());
                }
                Ok(self.append_text(SlotKey::Id(id), &text))
            }
            (Family::FixedSlot, Chunk::Text { id, text }) => {
                if self.turn.id.is_none() {
                    self.turn.id = id;
                }
                Ok(self.append_text(SlotKey::Fixed, &text))
            }
            (Family::MessageId | Family::FixedSlot, Chunk::ToolCalls(calls)) => {
                self.turn.tool_calls.extend(calls);
                Ok(Vec::new())
            }
            (family, chunk) => Err(ChatError::MalformedChunk(format!(
                "{} chunk from a {family:?} provider",
                chunk.kind()
            ))),
        }
    }

    /// Close the turn and let the provider family normalize it into a message.
    pub fn finish(self) -> Result<Message, ChatError> {
        self.family.finalize(self.turn)
    }

    fn append_text(&mut self, key: SlotKey, text: &str) -> Vec<Fragment> {
        let slot = match self.turn.slots.entry(key.clone()) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                self.turn.arrival.push(key.clone());
                v.insert(Slot::Text(String::new()))
            }
        };
        match slot {
            Slot::Text(s) => {
                s.push_str(text);
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![Fragment {
                        key,
                        text: s.clone(),
                    }]
                }
            }
            // Only block-indexed turns hold tool-use slots.
            Slot::ToolUse { .. } => Vec::new(),
        }
    }

    fn merge_block(&mut self, key: SlotKey, kind: BlockKind) -> Result<Option<String>, ChatError> {
        match (self.turn.slots.entry(key), kind) {
            (Entry::Vacant(v), BlockKind::Text(text)) => {
                self.turn.arrival.push(v.key().clone());
                v.insert(Slot::Text(text.clone()));
                Ok(Some(text))
            }
            (
                Entry::Vacant(v),
                BlockKind::ToolUse {
                    id,
                    name,
                    partial_json,
                },
            ) => {
                self.turn.arrival.push(v.key().clone());
                v.insert(Slot::ToolUse {
                    id: id.unwrap_or_default(),
                    name: name.unwrap_or_default(),
                    raw_arguments: partial_json,
                });
                Ok(None)
            }
            (Entry::Occupied(mut o), kind) => {
                let key = o.key().clone();
                match (o.get_mut(), kind) {
                    (Slot::Text(s), BlockKind::Text(text)) => {
                        s.push_str(&text);
                        Ok(Some(s.clone()))
                    }
                    (
                        Slot::ToolUse {
                            id,
                            name,
                            raw_arguments,
                        },
                        BlockKind::ToolUse {
                            id: new_id,
                            name: new_name,
                            partial_json,
                        },
                    ) => {
                        if let Some(new_id) = new_id {
                            *id = new_id;
                        }
                        if let Some(new_name) = new_name {
                            *name = new_name;
                        }
                        raw_arguments.push_str(&partial_json);
                        Ok(None)
                    }
                    _ => Err(ChatError::MalformedChunk(format!(
                        "block {key} changed kind mid-stream"
                    ))),
                }
            }
        }
    }
}

/// Drive a chunk stream to completion, pushing changed fragments to the renderer after every merge.
///
/// Any error aborts the turn; nothing partial is returned.
pub async fn collect_turn(
    family: Family,
    mut chunks: ChunkStream,
    renderer: &mut dyn Renderer,
) -> anyhow::Result<Message> {
    let mut acc = Accumulator::new(family);
    renderer.begin_turn();

    while let Some(item) = chunks.next().await {
        let chunk = item.context("stream chunk error")?;
        for fragment in acc.merge(chunk)? {
            renderer.fragment(Role::Assistant, &fragment.key, &fragment.text);
        }
    }
    renderer.end_turn();

    let message = acc.finish()?;
    tracing::debug!(
        id = ?message.id,
        tool_calls = message.tool_calls.len(),
        "assistant turn complete"
    );
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Arguments, Content, ContentBlock};
    use crate::provider::{BlockDelta, EMPTY_TEXT_PLACEHOLDER};
    use crate::render::testing::{Event, RecordingRenderer};
    use serde_json::json;

    fn stream_of(chunks: Vec<anyhow::Result<Chunk>>) -> ChunkStream {
        Box::pin(tokio_stream::iter(chunks))
    }

    fn text_chunk(id: &str, text: &str) -> Chunk {
        Chunk::Text {
            id: Some(id.into()),
            text: text.into(),
        }
    }

    #[test]
    fn text_per_index_is_concatenated_in_arrival_order() {
        let mut acc = Accumulator::new(Family::BlockIndexed);
        acc.merge(Chunk::Blocks(vec![BlockDelta::text(0, "Hel"), BlockDelta::text(2, "x")]))
            .unwrap();
        acc.merge(Chunk::Blocks(vec![BlockDelta::text(0, "lo")])).unwrap();
        acc.merge(Chunk::Blocks(vec![BlockDelta::text(2, "y"), BlockDelta::text(0, "!")]))
            .unwrap();

        let msg = acc.finish().unwrap();
        assert_eq!(
            msg.content,
            Content::Blocks(vec![
                ContentBlock::Text {
                    index: 0,
                    text: "Hello!".into()
                },
                ContentBlock::Text {
                    index: 2,
                    text: "xy".into()
                },
            ])
        );
    }

    #[test]
    fn fragmented_arguments_parse_like_the_whole_string() {
        let whole = r#"{"query": "weather tokyo", "limit": 3, "tags": ["a", "b"]}"#;
        let expected = serde_json::from_str::<serde_json::Value>(whole).unwrap();

        for pieces in [1, 2, 5, whole.len()] {
            let mut acc = Accumulator::new(Family::BlockIndexed);
            acc.merge(Chunk::Blocks(vec![BlockDelta::tool_use(
                1,
                Some("toolu_1".into()),
                Some("search".into()),
                "",
            )]))
            .unwrap();

            let step = whole.len().div_ceil(pieces);
            let bytes = whole.as_bytes();
            for part in bytes.chunks(step) {
                let part = std::str::from_utf8(part).unwrap();
                acc.merge(Chunk::Blocks(vec![BlockDelta::tool_use(1, None, None, part)]))
                    .unwrap();
            }

            let msg = acc.finish().unwrap();
            assert_eq!(msg.tool_calls.len(), 1);
            assert_eq!(msg.tool_calls[0].arguments, Arguments::Parsed(expected.clone()));
            assert_eq!(msg.tool_calls[0].name, "search");
        }
    }

    #[test]
    fn unparseable_arguments_are_flagged_not_dropped() {
        let mut acc = Accumulator::new(Family::BlockIndexed);
        acc.merge(Chunk::Blocks(vec![BlockDelta::tool_use(
            0,
            Some("toolu_1".into()),
            Some("search".into()),
            "{\"query\":",
        )]))
        .unwrap();

        let msg = acc.finish().unwrap();
        assert!(matches!(msg.tool_calls[0].arguments, Arguments::Invalid { .. }));
    }

    #[test]
    fn missing_index_is_malformed() {
        let mut acc = Accumulator::new(Family::BlockIndexed);
        let err = acc
            .merge(Chunk::Blocks(vec![BlockDelta {
                index: None,
                kind: BlockKind::Text("x".into()),
            }]))
            .unwrap_err();
        assert!(matches!(err, ChatError::MalformedChunk(_)));
    }

    #[test]
    fn block_changing_kind_is_malformed() {
        let mut acc = Accumulator::new(Family::BlockIndexed);
        acc.merge(Chunk::Blocks(vec![BlockDelta::text(0, "hi")])).unwrap();
        let err = acc
            .merge(Chunk::Blocks(vec![BlockDelta::tool_use(0, None, None, "{}")]))
            .unwrap_err();
        assert!(matches!(err, ChatError::MalformedChunk(_)));
    }

    #[test]
    fn chunk_shape_must_match_family() {
        let mut acc = Accumulator::new(Family::BlockIndexed);
        assert!(acc.merge(text_chunk("m1", "x")).is_err());

        let mut acc = Accumulator::new(Family::MessageId);
        assert!(acc.merge(Chunk::Blocks(vec![BlockDelta::text(0, "x")])).is_err());
        assert!(acc
            .merge(Chunk::Text {
                id: None,
                text: "x".into()
            })
            .is_err());
    }

    #[test]
    fn id_keyed_turn_keeps_id_and_complete_tool_calls() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "search".into(),
            arguments: Arguments::Parsed(json!({"query": "x"})),
        };
        let mut acc = Accumulator::new(Family::MessageId);
        let frags = acc.merge(text_chunk("chatcmpl-1", "Sure")).unwrap();
        assert_eq!(frags[0].key, SlotKey::Id("chatcmpl-1".into()));
        acc.merge(text_chunk("chatcmpl-1", ", one sec")).unwrap();
        acc.merge(Chunk::ToolCalls(vec![call.clone()])).unwrap();

        let msg = acc.finish().unwrap();
        assert_eq!(msg.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(msg.content, Content::Text("Sure, one sec".into()));
        assert_eq!(msg.tool_calls, vec![call]);
    }

    #[test]
    fn text_from_several_ids_joins_in_arrival_order() {
        let mut acc = Accumulator::new(Family::MessageId);
        acc.merge(text_chunk("zz", "first ")).unwrap();
        acc.merge(text_chunk("aa", "second")).unwrap();

        let msg = acc.finish().unwrap();
        assert_eq!(msg.id.as_deref(), Some("zz"));
        assert_eq!(msg.content, Content::Text("first second".into()));
    }

    #[test]
    fn empty_text_turn_gets_placeholder() {
        let mut acc = Accumulator::new(Family::MessageId);
        acc.merge(text_chunk("m", "")).unwrap();
        let msg = acc.finish().unwrap();
        assert_eq!(msg.content, Content::Text(EMPTY_TEXT_PLACEHOLDER.into()));
    }

    #[test]
    fn fixed_slot_ignores_ids() {
        let mut acc = Accumulator::new(Family::FixedSlot);
        let a = acc.merge(text_chunk("a", "one ")).unwrap();
        let b = acc.merge(text_chunk("b", "two")).unwrap();
        assert_eq!(a[0].key, SlotKey::Fixed);
        assert_eq!(b[0].text, "one two");
    }

    #[tokio::test]
    async fn renderer_sees_growing_fragments() {
        let chunks = stream_of(vec![
            Ok(Chunk::Blocks(vec![BlockDelta::text(0, "4")])),
            Ok(Chunk::Blocks(vec![BlockDelta::text(0, "2")])),
        ]);
        let mut r = RecordingRenderer::default();
        let msg = collect_turn(Family::BlockIndexed, chunks, &mut r).await.unwrap();

        assert_eq!(msg.text(), "42");
        let texts: Vec<_> = r
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Fragment(_, _, t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["4", "42"]);
    }

    #[tokio::test]
    async fn stream_error_aborts_the_turn() {
        let chunks = stream_of(vec![
            Ok(text_chunk("m", "partial")),
            Err(anyhow::anyhow!("connection reset")),
        ]);
        let mut r = RecordingRenderer::default();
        let err = collect_turn(Family::MessageId, chunks, &mut r)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));
    }
}
