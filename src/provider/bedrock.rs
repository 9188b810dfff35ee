//! Amazon Bedrock Converse API: block-indexed streaming through the AWS SDK.
//!
//! Credentials and, unless configured, the region come from the standard AWS chain (environment,
//! shared profile, instance role).

use super::{batch_tool_results, BlockDelta, ChatRequest, Chunk, ChunkStream, Family, Provider, ToolSpec, EMPTY_TEXT_PLACEHOLDER};
use crate::error::ChatError;
use crate::message::{self, Content, Message, Role};
use anyhow::anyhow;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::config::Region;
use aws_sdk_bedrockruntime::error::DisplayErrorContext;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ContentBlockStart, ConversationRole, ConverseStreamOutput,
    Message as ConverseMessage, SystemContentBlock, Tool, ToolConfiguration, ToolInputSchema,
    ToolResultBlock, ToolResultContentBlock, ToolResultStatus, ToolSpecification, ToolUseBlock,
};
use aws_sdk_bedrockruntime::Client;
use aws_smithy_types::{Document, Number};
use futures_core::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub struct BedrockProvider {
    region: Option<String>,
    endpoint_url: Option<String>,
    client: Arc<OnceCell<Client>>,
}

impl BedrockProvider {
    pub fn new(region: Option<&str>, endpoint_url: Option<&str>) -> Self {
        Self {
            region: region.map(str::to_string),
            endpoint_url: endpoint_url.map(str::to_string),
            client: Arc::new(OnceCell::new()),
        }
    }

    /// The SDK client, built on first use since loading AWS config is async.
    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async move {
                let region = match &self.region {
                    Some(r) => RegionProviderChain::first_try(Region::new(r.clone())),
                    None => RegionProviderChain::default_provider(),
                }
                .or_else(DEFAULT_REGION);
                let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
                if let Some(url) = &self.endpoint_url {
                    loader = loader.endpoint_url(url.clone());
                }
                Client::new(&loader.load().await)
            })
            .await
    }
}

impl Provider for BedrockProvider {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn family(&self) -> Family {
        Family::BlockIndexed
    }

    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, anyhow::Result<ChunkStream>> {
        let this = self.clone();

        Box::pin(async move {
            let input = build_request(&req)?;
            let output = this
                .client()
                .await
                .converse_stream()
                .model_id(&req.model)
                .set_system(input.system)
                .set_messages(Some(input.messages))
                .set_tool_config(input.tool_config)
                .send()
                .await
                .map_err(|e| anyhow!("Bedrock API error: {}", DisplayErrorContext(&e)))?;

            let mut events = output.stream;
            let (tx, rx) = mpsc::channel::<anyhow::Result<Chunk>>(64);
            tokio::spawn(async move {
                loop {
                    let decoded = match events.recv().await {
                        Ok(Some(event)) => lift(&event).map(chunks).map_err(anyhow::Error::from),
                        Ok(None) => return,
                        Err(e) => Err(anyhow!("Bedrock stream error: {}", DisplayErrorContext(&e))),
                    };
                    match decoded {
                        Ok(out) => {
                            for c in out {
                                if tx.send(Ok(c)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as ChunkStream)
        })
    }
}

struct ConverseInput {
    system: Option<Vec<SystemContentBlock>>,
    messages: Vec<ConverseMessage>,
    tool_config: Option<ToolConfiguration>,
}

fn build_request(req: &ChatRequest) -> anyhow::Result<ConverseInput> {
    Ok(ConverseInput {
        system: req.system_text().map(|s| vec![SystemContentBlock::Text(s)]),
        messages: convert_messages(&req.conversation(), supports_result_status(&req.model))?,
        tool_config: tool_config(&req.tools)?,
    })
}

/// Only Claude models accept a status on tool results; others get the failure in the text.
fn supports_result_status(model: &str) -> bool {
    model.contains("anthropic.claude")
}

fn convert_messages(history: &[Message], result_status: bool) -> anyhow::Result<Vec<ConverseMessage>> {
    batch_tool_results(history)
        .into_iter()
        .map(|batch| {
            let first = &batch[0];
            let (role, content) = match first.role {
                Role::Tool => (
                    ConversationRole::User,
                    batch
                        .iter()
                        .map(|m| tool_result_block(m, result_status))
                        .collect::<anyhow::Result<Vec<_>>>()?,
                ),
                Role::Assistant => (ConversationRole::Assistant, assistant_blocks(first)?),
                Role::User | Role::System => (ConversationRole::User, vec![text_block(first.text())]),
            };
            Ok(ConverseMessage::builder()
                .role(role)
                .set_content(Some(content))
                .build()?)
        })
        .collect()
}

/// Converse rejects blank text blocks.
fn text_block(text: String) -> ContentBlock {
    if text.trim().is_empty() {
        ContentBlock::Text(EMPTY_TEXT_PLACEHOLDER.to_string())
    } else {
        ContentBlock::Text(text)
    }
}

fn tool_use_block(id: &str, name: &str, input: &Value) -> anyhow::Result<ContentBlock> {
    let input = if input.is_object() {
        to_document(input)
    } else {
        Document::Object(Default::default())
    };
    Ok(ContentBlock::ToolUse(
        ToolUseBlock::builder()
            .tool_use_id(id)
            .name(name)
            .input(input)
            .build()?,
    ))
}

fn tool_result_block(m: &Message, result_status: bool) -> anyhow::Result<ContentBlock> {
    let mut text = m.text();
    if m.is_error && !result_status {
        text = format!("Error: {text}");
    }
    let mut block = ToolResultBlock::builder()
        .tool_use_id(m.tool_call_id.clone().unwrap_or_default())
        .content(ToolResultContentBlock::Text(if text.trim().is_empty() {
            EMPTY_TEXT_PLACEHOLDER.to_string()
        } else {
            text
        }));
    if result_status {
        block = block.status(if m.is_error {
            ToolResultStatus::Error
        } else {
            ToolResultStatus::Success
        });
    }
    Ok(ContentBlock::ToolResult(block.build()?))
}

fn assistant_blocks(m: &Message) -> anyhow::Result<Vec<ContentBlock>> {
    let mut out = Vec::new();
    match &m.content {
        Content::Blocks(blocks) => {
            for b in blocks {
                match b {
                    message::ContentBlock::Text { text, .. } if text.trim().is_empty() => {}
                    message::ContentBlock::Text { text, .. } => out.push(ContentBlock::Text(text.clone())),
                    message::ContentBlock::ToolUse { id, name, input, .. } => {
                        out.push(tool_use_block(id, name, input)?)
                    }
                }
            }
        }
        // Turns recorded from a text-streaming provider.
        Content::Text(text) => {
            if !text.trim().is_empty() {
                out.push(ContentBlock::Text(text.clone()));
            }
            for call in &m.tool_calls {
                out.push(tool_use_block(&call.id, &call.name, &call.arguments.to_wire())?);
            }
        }
    }
    if out.is_empty() {
        out.push(ContentBlock::Text(EMPTY_TEXT_PLACEHOLDER.to_string()));
    }
    Ok(out)
}

fn tool_config(tools: &[ToolSpec]) -> anyhow::Result<Option<ToolConfiguration>> {
    if tools.is_empty() {
        return Ok(None);
    }
    let tools = tools
        .iter()
        .map(|t| {
            let description = if t.description.trim().is_empty() {
                &t.name
            } else {
                &t.description
            };
            Ok(Tool::ToolSpec(
                ToolSpecification::builder()
                    .name(&t.name)
                    .description(description)
                    .input_schema(ToolInputSchema::Json(to_document(&t.input_schema)))
                    .build()?,
            ))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Some(ToolConfiguration::builder().set_tools(Some(tools)).build()?))
}

fn to_document(v: &Value) -> Document {
    match v {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => Document::Number(if let Some(u) = n.as_u64() {
            Number::PosInt(u)
        } else if let Some(i) = n.as_i64() {
            Number::NegInt(i)
        } else {
            Number::Float(n.as_f64().unwrap_or_default())
        }),
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(to_document).collect()),
        Value::Object(map) => Document::Object(map.iter().map(|(k, v)| (k.clone(), to_document(v))).collect()),
    }
}

/// A converse-stream event reduced to what the accumulator needs.
#[derive(Debug, Clone, PartialEq)]
enum Event {
    ToolStart { index: usize, id: String, name: String },
    Text { index: usize, text: String },
    ToolInput { index: usize, input: String },
    Skip,
}

fn block_index(raw: i32) -> Result<usize, ChatError> {
    usize::try_from(raw).map_err(|_| ChatError::MalformedChunk(format!("negative content block index {raw}")))
}

fn lift(event: &ConverseStreamOutput) -> Result<Event, ChatError> {
    match event {
        ConverseStreamOutput::ContentBlockStart(e) => match e.start() {
            Some(ContentBlockStart::ToolUse(t)) => Ok(Event::ToolStart {
                index: block_index(e.content_block_index())?,
                id: t.tool_use_id().to_string(),
                name: t.name().to_string(),
            }),
            // Text blocks are opened by their first delta.
            None => Ok(Event::Skip),
            Some(other) => Err(ChatError::MalformedChunk(format!("unsupported block start: {other:?}"))),
        },
        ConverseStreamOutput::ContentBlockDelta(e) => {
            let index = block_index(e.content_block_index())?;
            match e.delta() {
                Some(ContentBlockDelta::Text(text)) => Ok(Event::Text {
                    index,
                    text: text.clone(),
                }),
                Some(ContentBlockDelta::ToolUse(d)) => Ok(Event::ToolInput {
                    index,
                    input: d.input().to_string(),
                }),
                Some(other) => Err(ChatError::MalformedChunk(format!("unsupported delta: {other:?}"))),
                None => Err(ChatError::MalformedChunk(format!("block {index} delta without content"))),
            }
        }
        ConverseStreamOutput::MessageStart(_) | ConverseStreamOutput::ContentBlockStop(_) => Ok(Event::Skip),
        ConverseStreamOutput::MessageStop(e) => {
            tracing::debug!(stop_reason = ?e.stop_reason(), "bedrock message stopped");
            Ok(Event::Skip)
        }
        ConverseStreamOutput::Metadata(_) => Ok(Event::Skip),
        other => Err(ChatError::MalformedChunk(format!("unknown Bedrock event: {other:?}"))),
    }
}

fn chunks(event: Event) -> Vec<Chunk> {
    let delta = match event {
        Event::ToolStart { index, id, name } => BlockDelta::tool_use(index, Some(id), Some(name), ""),
        Event::Text { index, text } => BlockDelta::text(index, text),
        Event::ToolInput { index, input } => BlockDelta::tool_use(index, None, None, input),
        Event::Skip => return Vec::new(),
    };
    vec![Chunk::Blocks(vec![delta])]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Arguments, ToolCall};
    use crate::stream::Accumulator;
    use serde_json::json;

    const CLAUDE: &str = "us.anthropic.claude-3-7-sonnet-20250219-v1:0";
    const NOVA: &str = "us.amazon.nova-micro-v1:0";

    fn lookup() -> ToolCall {
        ToolCall {
            id: "tooluse_1".into(),
            name: "lookup".into(),
            arguments: Arguments::Parsed(json!({"q": "a"})),
        }
    }

    fn history() -> Vec<Message> {
        let call = lookup();
        vec![
            Message::user("look it up"),
            Message::assistant(Content::Text(String::new())).with_tool_calls(vec![call.clone()]),
            Message::tool_result(&call, "found", false),
            Message::tool_result(&call, "broken", true),
        ]
    }

    #[test]
    fn recorded_events_fold_into_text_and_tool_call() {
        let events = vec![
            Event::Skip,
            Event::Text { index: 0, text: "Let me ".into() },
            Event::Text { index: 0, text: "check.".into() },
            Event::Skip,
            Event::ToolStart {
                index: 1,
                id: "tooluse_1".into(),
                name: "lookup".into(),
            },
            Event::ToolInput { index: 1, input: "{\"q\": ".into() },
            Event::ToolInput { index: 1, input: "\"a\"}".into() },
            Event::Skip,
        ];
        let mut acc = Accumulator::new(Family::BlockIndexed);
        for chunk in events.into_iter().flat_map(chunks) {
            acc.merge(chunk).unwrap();
        }
        let msg = acc.finish().unwrap();

        assert_eq!(msg.text(), "Let me check.");
        assert_eq!(msg.tool_calls, vec![lookup()]);
    }

    #[test]
    fn request_groups_tool_results_and_lifts_system() {
        let tools = vec![ToolSpec {
            name: "lookup".into(),
            description: String::new(),
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        }];
        let input = build_request(&ChatRequest::new(CLAUDE, "sys", &history(), tools)).unwrap();

        assert_eq!(input.system, Some(vec![SystemContentBlock::Text("sys".into())]));
        assert_eq!(input.messages.len(), 3);

        let assistant = &input.messages[1];
        assert_eq!(assistant.role(), &ConversationRole::Assistant);
        assert_eq!(assistant.content().len(), 1);
        let call = assistant.content()[0].as_tool_use().unwrap();
        assert_eq!(call.name(), "lookup");
        assert_eq!(call.input(), &to_document(&json!({"q": "a"})));

        let results = &input.messages[2];
        assert_eq!(results.role(), &ConversationRole::User);
        assert_eq!(results.content().len(), 2);
        let failed = results.content()[1].as_tool_result().unwrap();
        assert_eq!(failed.tool_use_id(), "tooluse_1");
        assert_eq!(failed.status(), Some(&ToolResultStatus::Error));

        let config = input.tool_config.unwrap();
        let Tool::ToolSpec(spec) = &config.tools()[0] else {
            panic!("expected a tool spec");
        };
        assert_eq!(spec.description(), Some("lookup"));
    }

    #[test]
    fn nova_gets_failures_in_the_result_text() {
        let messages = convert_messages(&history(), supports_result_status(NOVA)).unwrap();
        let failed = messages[2].content()[1].as_tool_result().unwrap();
        assert_eq!(failed.status(), None);
        assert_eq!(
            failed.content(),
            &[ToolResultContentBlock::Text("Error: broken".into())]
        );
    }

    #[test]
    fn blank_turns_become_placeholder_text() {
        let history = vec![Message::user("  "), Message::assistant(Content::Text(String::new()))];
        let messages = convert_messages(&history, false).unwrap();
        for m in &messages {
            assert_eq!(m.content(), &[ContentBlock::Text(EMPTY_TEXT_PLACEHOLDER.into())]);
        }
    }

    #[test]
    fn json_maps_onto_documents() {
        let doc = to_document(&json!({"n": 3, "neg": -2, "f": 1.5, "list": [true, null, "x"]}));
        let Document::Object(map) = doc else {
            panic!("expected an object");
        };
        assert_eq!(map["n"], Document::Number(Number::PosInt(3)));
        assert_eq!(map["neg"], Document::Number(Number::NegInt(-2)));
        assert_eq!(map["f"], Document::Number(Number::Float(1.5)));
        assert_eq!(
            map["list"],
            Document::Array(vec![Document::Bool(true), Document::Null, Document::String("x".into())])
        );
    }

    #[test]
    fn negative_block_index_is_malformed() {
        assert!(matches!(block_index(-1), Err(ChatError::MalformedChunk(_))));
        assert_eq!(block_index(2).unwrap(), 2);
    }
}
