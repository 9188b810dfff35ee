use super::{ChatRequest, Chunk, ChunkStream, Family, Provider};
use crate::message::{Arguments, Role, ToolCall};
use futures_core::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Offline provider for trying the loop without credentials.
///
/// Echoes the last user message. A message of the form `!tool_name {json}` asks for that tool
/// instead, and the following turn reports what the tool returned.
#[derive(Debug, Clone)]
pub struct StubProvider {
    drip: Duration,
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            drip: Duration::from_millis(120),
        }
    }

    pub fn with_drip(drip: Duration) -> Self {
        Self { drip }
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn family(&self) -> Family {
        Family::FixedSlot
    }

    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, anyhow::Result<ChunkStream>> {
        let drip = self.drip;

        Box::pin(async move {
            let (text, calls) = respond(&req);
            let (tx, rx) = mpsc::channel::<anyhow::Result<Chunk>>(32);

            tokio::spawn(async move {
                for word in text.split_inclusive(' ') {
                    tokio::time::sleep(drip).await;
                    let chunk = Chunk::Text {
                        id: None,
                        text: word.to_string(),
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                if !calls.is_empty() {
                    let _ = tx.send(Ok(Chunk::ToolCalls(calls))).await;
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as ChunkStream)
        })
    }
}

fn respond(req: &ChatRequest) -> (String, Vec<ToolCall>) {
    let Some(last) = req.messages.last() else {
        return ("Nothing to reply to.".into(), Vec::new());
    };

    match last.role {
        Role::Tool => {
            let name = last.name.as_deref().unwrap_or("tool");
            let verdict = if last.is_error { "failed" } else { "returned" };
            (format!("{name} {verdict}: {}", last.text()), Vec::new())
        }
        _ => {
            let text = last.text();
            match parse_tool_request(&text, req.messages.len()) {
                Some(call) => (format!("Calling {}.", call.name), vec![call]),
                None => (format!("[{}] You said: {text}", req.model), Vec::new()),
            }
        }
    }
}

/// `!name {json}`; the id only has to be unique within the conversation.
fn parse_tool_request(text: &str, seq: usize) -> Option<ToolCall> {
    let rest = text.trim().strip_prefix('!')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some(ToolCall {
        id: format!("stub_{seq}"),
        name: name.to_string(),
        arguments: Arguments::from_raw(args),
    })
}
