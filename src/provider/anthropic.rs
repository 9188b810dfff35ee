//! Anthropic Messages API: block-indexed streaming with fragmented tool arguments.

use super::{
    batch_tool_results, ensure_success, spawn_sse_stream, BlockDelta, ChatRequest, Chunk, ChunkStream,
    Family, Provider, SseDecoder, EMPTY_TEXT_PLACEHOLDER,
};
use crate::error::ChatError;
use crate::message::{Content, ContentBlock, Message, Role};
use anyhow::{anyhow, Context};
use futures_core::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    api_base: Url,
}

impl AnthropicProvider {
    pub fn new(http: reqwest::Client, api_key: String, base_url: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            api_key,
            api_base: Url::parse(base_url.unwrap_or(DEFAULT_BASE_URL))
                .context("invalid Anthropic base URL")?,
        })
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        h.insert("x-api-key", HeaderValue::from_str(&self.api_key).map_err(|e| anyhow!(e))?);
        Ok(h)
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn family(&self) -> Family {
        Family::BlockIndexed
    }

    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, anyhow::Result<ChunkStream>> {
        let this = self.clone();

        Box::pin(async move {
            let url = this.api_base.join("v1/messages")?;
            let body = build_request(&req);

            let resp = this
                .http
                .post(url)
                .headers(this.headers()?)
                .json(&body)
                .send()
                .await
                .context("failed to start Anthropic request")?;
            let resp = ensure_success(resp, "Anthropic").await?;

            Ok(spawn_sse_stream(resp, EventDecoder))
        })
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
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
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

fn build_request(req: &ChatRequest) -> MessagesRequest {
    MessagesRequest {
        model: req.model.clone(),
        max_tokens: MAX_TOKENS,
        system: req.system_text(),
        messages: convert_messages(&req.conversation()),
        tools: req
            .tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect(),
        stream: true,
    }
}

fn convert_messages(history: &[Message]) -> Vec<WireMessage> {
    batch_tool_results(history)
        .into_iter()
        .map(|batch| {
            let first = &batch[0];
            match first.role {
                Role::Tool => WireMessage {
                    role: "user",
                    content: batch
                        .iter()
                        .map(|m| WireBlock::ToolResult {
                            tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                            content: m.text(),
                            is_error: m.is_error,
                        })
                        .collect(),
                },
                Role::Assistant => WireMessage {
                    role: "assistant",
                    content: assistant_blocks(first),
                },
                Role::User | Role::System => WireMessage {
                    role: "user",
                    content: vec![WireBlock::Text { text: first.text() }],
                },
            }
        })
        .collect()
}

fn assistant_blocks(m: &Message) -> Vec<WireBlock> {
    let mut out = Vec::new();
    match &m.content {
        Content::Blocks(blocks) => {
            for b in blocks {
                match b {
                    ContentBlock::Text { text, .. } if text.is_empty() => {}
                    ContentBlock::Text { text, .. } => out.push(WireBlock::Text { text: text.clone() }),
                    ContentBlock::ToolUse { id, name, input, .. } => out.push(WireBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: if input.is_object() {
                            input.clone()
                        } else {
                            Value::Object(Default::default())
                        },
                    }),
                }
            }
        }
        // Turns recorded from a text-streaming provider.
        Content::Text(text) => {
            if !text.is_empty() {
                out.push(WireBlock::Text { text: text.clone() });
            }
            for call in &m.tool_calls {
                out.push(WireBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.to_wire(),
                });
            }
        }
    }
    if out.is_empty() {
        out.push(WireBlock::Text {
            text: EMPTY_TEXT_PLACEHOLDER.to_string(),
        });
    }
    out
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: MessageStart },
    ContentBlockStart { index: usize, content_block: StartBlock },
    ContentBlockDelta { index: usize, delta: Delta },
    ContentBlockStop {},
    MessageDelta {},
    MessageStop {},
    Ping {},
    Error { error: ApiError },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

struct EventDecoder;

impl SseDecoder for EventDecoder {
    fn data(&mut self, data: &str) -> anyhow::Result<Vec<Chunk>> {
        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| ChatError::MalformedChunk(format!("Anthropic event: {e}")))?;

        let delta = match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block: StartBlock::Text { text },
            } => BlockDelta::text(index, text),
            StreamEvent::ContentBlockStart {
                index,
                content_block: StartBlock::ToolUse { id, name },
            } => BlockDelta::tool_use(index, Some(id), Some(name), ""),
            StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::TextDelta { text },
            } => BlockDelta::text(index, text),
            StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta { partial_json },
            } => BlockDelta::tool_use(index, None, None, partial_json),
            StreamEvent::MessageStart { message } => {
                tracing::debug!(id = %message.id, "anthropic message started");
                return Ok(Vec::new());
            }
            StreamEvent::Error { error } => {
                return Err(anyhow!("Anthropic stream error ({}): {}", error.kind, error.message))
            }
            StreamEvent::ContentBlockStop {}
            | StreamEvent::MessageDelta {}
            | StreamEvent::MessageStop {}
            | StreamEvent::Ping {} => return Ok(Vec::new()),
        };
        Ok(vec![Chunk::Blocks(vec![delta])])
    }
}
