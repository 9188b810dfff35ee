mod family;
mod types;

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "bedrock")]
pub mod bedrock;
#[cfg(feature = "google")]
pub mod google;
#[cfg(feature = "openai")]
pub mod openai;
pub mod stub;

pub use family::{Family, EMPTY_TEXT_PLACEHOLDER};
pub use types::{BlockDelta, BlockKind, ChatRequest, Chunk, ChunkStream, Provider, ToolSpec};

use crate::message::{Message, Role};

/// Group each run of consecutive tool results into one batch, for APIs that want all results of
/// an assistant turn in a single user-side message.
pub(crate) fn batch_tool_results(messages: &[Message]) -> Vec<&[Message]> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < messages.len() {
        let mut end = start + 1;
        if messages[start].role == Role::Tool {
            while end < messages.len() && messages[end].role == Role::Tool {
                end += 1;
            }
        }
        out.push(&messages[start..end]);
        start = end;
    }
    out
}

#[cfg(any(feature = "anthropic", feature = "google", feature = "openai"))]
pub(crate) use http::{ensure_success, spawn_sse_stream, SseDecoder};

#[cfg(any(feature = "anthropic", feature = "google", feature = "openai"))]
mod http {
    use super::{Chunk, ChunkStream};
    use crate::sse::{SseEvent, SseParser};
    use anyhow::anyhow;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_stream::StreamExt;

    /// Turns one provider's SSE `data:` payloads into chunks.
    pub(crate) trait SseDecoder: Send + 'static {
        fn data(&mut self, data: &str) -> anyhow::Result<Vec<Chunk>>;

        /// True once the provider signalled the end of the turn in-band.
        fn done(&self) -> bool {
            false
        }

        /// Chunks held back until the stream ends (complete tool calls).
        fn finish(&mut self) -> anyhow::Result<Vec<Chunk>> {
            Ok(Vec::new())
        }
    }

    pub(crate) async fn ensure_success(resp: reqwest::Response, api: &str) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(anyhow!("{api} API error: HTTP {status}: {text}"))
    }

    pub(crate) fn spawn_sse_stream<D: SseDecoder>(resp: reqwest::Response, mut decoder: D) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<anyhow::Result<Chunk>>(64);

        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut parser = SseParser::new();

            'read: while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow!(e).context("network stream error"))).await;
                        return;
                    }
                };

                for ev in parser.push(&bytes) {
                    let decoded = ev.and_then(|ev| decode(&mut decoder, ev));
                    if !forward(&tx, decoded).await {
                        return;
                    }
                    if decoder.done() {
                        break 'read;
                    }
                }
            }

            if let Some(ev) = parser.finish() {
                if !decoder.done() && !forward(&tx, decode(&mut decoder, ev)).await {
                    return;
                }
            }
            let tail = decoder.finish();
            forward(&tx, tail).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    fn decode<D: SseDecoder>(decoder: &mut D, ev: SseEvent) -> anyhow::Result<Vec<Chunk>> {
        match ev {
            SseEvent::Data(data) if data.trim().is_empty() => Ok(Vec::new()),
            SseEvent::Data(data) => decoder.data(&data),
            SseEvent::Other => Ok(Vec::new()),
        }
    }

    /// Send decoded chunks on; false when the stream must stop.
    async fn forward(tx: &mpsc::Sender<anyhow::Result<Chunk>>, decoded: anyhow::Result<Vec<Chunk>>) -> bool {
        match decoded {
            Ok(chunks) => {
                for c in chunks {
                    if tx.send(Ok(c)).await.is_err() {
                        return false;
                    }
                }
                true
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Arguments, Content, ToolCall};

    #[test]
    fn consecutive_tool_results_are_batched() {
        let call = |id: &str| ToolCall {
            id: id.into(),
            name: "t".into(),
            arguments: Arguments::Parsed(serde_json::json!({})),
        };
        let history = vec![
            Message::user("hi"),
            Message::assistant(Content::Text("x".into())),
            Message::tool_result(&call("a"), "1", false),
            Message::tool_result(&call("b"), "2", false),
            Message::assistant(Content::Text("y".into())),
        ];
        let sizes: Vec<usize> = batch_tool_results(&history).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![1, 1, 2, 1]);
    }

    #[test]
    fn request_prefixes_system_prompt_only_when_set() {
        let history = vec![Message::user("hi")];
        let req = ChatRequest::new("m", "Be kind.", &history, Vec::new());
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.system_text().as_deref(), Some("Be kind."));
        assert_eq!(req.conversation(), history);

        let bare = ChatRequest::new("m", "  ", &history, Vec::new());
        assert_eq!(bare.messages, history);
        assert_eq!(bare.system_text(), None);
    }
}
