//! Rendering collaborator: where streamed fragments and tool panels go.

use crate::message::{Message, Role};
use crate::stream::SlotKey;
use std::io::Write;

/// Panel payloads longer than this are cut in the line-oriented renderer.
const PANEL_PREVIEW_CHARS: usize = 160;

pub trait Renderer: Send {
    /// A new assistant turn starts streaming; slot keys restart from scratch.
    fn begin_turn(&mut self) {}

    /// `text` is the full accumulated text of the slot, not just the newest delta.
    fn fragment(&mut self, role: Role, key: &SlotKey, text: &str);

    /// Auxiliary output (tool calls and results), shown apart from the chat text.
    fn panel(&mut self, label: &str, payload: &str);

    fn error(&mut self, message: &str);

    fn end_turn(&mut self) {}
}

/// Replay stored history (user and assistant text only).
pub fn replay(messages: &[Message], renderer: &mut dyn Renderer) {
    for m in messages {
        if !matches!(m.role, Role::User | Role::Assistant) {
            continue;
        }
        let text = m.text();
        if text.is_empty() {
            continue;
        }
        renderer.begin_turn();
        renderer.fragment(m.role, &SlotKey::Fixed, &text);
        renderer.end_turn();
    }
}

/// Line-oriented renderer that prints only the new suffix of each growing slot.
pub struct LineRenderer<W: Write + Send> {
    out: W,
    open: Option<(SlotKey, usize)>,
}

impl LineRenderer<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> LineRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, open: None }
    }

    fn close_slot(&mut self) {
        if self.open.take().is_some() {
            writeln!(self.out).ok();
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Renderer for LineRenderer<W> {
    fn begin_turn(&mut self) {
        self.close_slot();
    }

    fn fragment(&mut self, role: Role, key: &SlotKey, text: &str) {
        let printed = match &self.open {
            Some((open, printed)) if open == key && *printed <= text.len() => *printed,
            _ => {
                self.close_slot();
                write!(self.out, "{}: ", role.as_str()).ok();
                0
            }
        };
        // Slots only grow by concatenation, so the old length is a char boundary.
        let tail = text.get(printed..).unwrap_or(text);
        write!(self.out, "{tail}").ok();
        self.out.flush().ok();
        self.open = Some((key.clone(), text.len()));
    }

    fn panel(&mut self, label: &str, payload: &str) {
        self.close_slot();
        let first = payload.lines().next().unwrap_or("");
        let mut preview: String = first.chars().take(PANEL_PREVIEW_CHARS).collect();
        if preview.len() < payload.len() {
            preview.push_str(" …");
        }
        writeln!(self.out, "[{label}] {preview}").ok();
        self.out.flush().ok();
    }

    fn error(&mut self, message: &str) {
        self.close_slot();
        writeln!(self.out, "error: {message}").ok();
        self.out.flush().ok();
    }

    fn end_turn(&mut self) {
        self.close_slot();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Content;

    fn output(r: LineRenderer<Vec<u8>>) -> String {
        String::from_utf8(r.into_inner()).unwrap()
    }

    #[test]
    fn prints_only_new_suffix_per_slot() {
        let mut r = LineRenderer::new(Vec::new());
        r.begin_turn();
        r.fragment(Role::Assistant, &SlotKey::Index(0), "It's ");
        r.fragment(Role::Assistant, &SlotKey::Index(0), "It's sunny");
        r.fragment(Role::Assistant, &SlotKey::Index(2), "Done");
        r.end_turn();
        assert_eq!(output(r), "assistant: It's sunny\nassistant: Done\n");
    }

    #[test]
    fn panels_are_single_line_previews() {
        let mut r = LineRenderer::new(Vec::new());
        r.panel("Tool Result", "line one\nline two");
        assert_eq!(output(r), "[Tool Result] line one …\n");
    }

    #[test]
    fn replay_skips_tool_messages() {
        let mut r = testing::RecordingRenderer::default();
        let call = crate::message::ToolCall {
            id: "1".into(),
            name: "t".into(),
            arguments: crate::message::Arguments::Parsed(serde_json::json!({})),
        };
        replay(
            &[
                Message::user("hi"),
                Message::tool_result(&call, "secret", false),
                Message::assistant(Content::Text("hello".into())),
            ],
            &mut r,
        );
        let frags: Vec<_> = r
            .events
            .iter()
            .filter(|e| matches!(e, testing::Event::Fragment(..)))
            .collect();
        assert_eq!(frags.len(), 2);
    }
}
