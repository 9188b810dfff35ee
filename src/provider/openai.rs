//! OpenAI-compatible chat completions (OpenAI, xAI): id-keyed text, tool calls assembled
//! from indexed fragments and delivered once the stream ends.

use super::{
    ensure_success, spawn_sse_stream, ChatRequest, Chunk, ChunkStream, Family, Provider, SseDecoder,
};
use crate::error::ChatError;
use crate::message::{Arguments, Message, Role, ToolCall};
use anyhow::{anyhow, Context};
use futures_core::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1/";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1/";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    name: &'static str,
    http: reqwest::Client,
    api_key: String,
    api_base: Url,
}

impl OpenAiProvider {
    pub fn new(http: reqwest::Client, api_key: String, base_url: Option<&str>) -> anyhow::Result<Self> {
        Self::with_name("openai", http, api_key, base_url.unwrap_or(OPENAI_BASE_URL))
    }

    /// xAI speaks the same protocol on its own endpoint.
    pub fn xai(http: reqwest::Client, api_key: String, base_url: Option<&str>) -> anyhow::Result<Self> {
        Self::with_name("xai", http, api_key, base_url.unwrap_or(XAI_BASE_URL))
    }

    fn with_name(name: &'static str, http: reqwest::Client, api_key: String, base: &str) -> anyhow::Result<Self> {
        // Url::join drops the last path segment unless the base ends in a slash.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        Ok(Self {
            name,
            http,
            api_key,
            api_base: Url::parse(&base).with_context(|| format!("invalid {name} base URL"))?,
        })
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let v = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|e| anyhow!(e))?;
        h.insert(AUTHORIZATION, v);
        Ok(h)
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn family(&self) -> Family {
        Family::MessageId
    }

    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, anyhow::Result<ChunkStream>> {
        let this = self.clone();

        Box::pin(async move {
            let url = this.api_base.join("chat/completions")?;
            let body = build_request(&req);

            let resp = this
                .http
                .post(url)
                .headers(this.headers()?)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("failed to start {} request", this.name))?;
            let resp = ensure_success(resp, this.name).await?;

            Ok(spawn_sse_stream(resp, CompletionDecoder::default()))
        })
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireFunction {
    name: String,
    /// Serialized JSON, as the API expects.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolDef,
}

#[derive(Debug, Serialize)]
struct WireToolDef {
    name: String,
    description: String,
    parameters: Value,
}

fn build_request(req: &ChatRequest) -> CompletionRequest {
    CompletionRequest {
        model: req.model.clone(),
        messages: req.messages.iter().map(to_wire).collect(),
        tools: req
            .tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireToolDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect(),
        stream: true,
    }
}

fn to_wire(m: &Message) -> WireMessage {
    let text = m.text();
    let tool_calls: Vec<WireToolCall> = m
        .tool_calls
        .iter()
        .map(|c| WireToolCall {
            id: c.id.clone(),
            kind: "function",
            function: WireFunction {
                name: c.name.clone(),
                arguments: match &c.arguments {
                    Arguments::Parsed(v) => v.to_string(),
                    Arguments::Invalid { raw, .. } => raw.clone(),
                },
            },
        })
        .collect();

    WireMessage {
        role: m.role.as_str(),
        // An assistant turn that only calls tools carries no content.
        content: if m.role == Role::Assistant && text.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(text)
        },
        tool_calls,
        tool_call_id: m.tool_call_id.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: ChoiceDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct CompletionDecoder {
    pending: BTreeMap<usize, PendingCall>,
    done: bool,
}

impl SseDecoder for CompletionDecoder {
    fn data(&mut self, data: &str) -> anyhow::Result<Vec<Chunk>> {
        if data.trim() == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }
        let chunk: CompletionChunk = serde_json::from_str(data)
            .map_err(|e| ChatError::MalformedChunk(format!("completion chunk: {e}")))?;

        let mut out = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                out.push(Chunk::Text {
                    id: (!chunk.id.is_empty()).then(|| chunk.id.clone()),
                    text,
                });
            }
            for tc in choice.delta.tool_calls {
                let slot = self.pending.entry(tc.index).or_default();
                if let Some(id) = tc.id.filter(|s| !s.is_empty()) {
                    slot.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name.filter(|s| !s.is_empty()) {
                        slot.name = name;
                    }
                    if let Some(args) = f.arguments {
                        slot.arguments.push_str(&args);
                    }
                }
            }
        }
        Ok(out)
    }

    fn done(&self) -> bool {
        self.done
    }

    fn finish(&mut self) -> anyhow::Result<Vec<Chunk>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut calls = Vec::with_capacity(self.pending.len());
        for (index, p) in std::mem::take(&mut self.pending) {
            if p.name.is_empty() {
                return Err(ChatError::MalformedChunk(format!("tool call {index} has no name")).into());
            }
            calls.push(ToolCall {
                id: if p.id.is_empty() {
                    format!("call_{index}")
                } else {
                    p.id
                },
                name: p.name,
                arguments: Arguments::from_raw(&p.arguments),
            });
        }
        Ok(vec![Chunk::ToolCalls(calls)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Content;
    use crate::provider::ToolSpec;
    use crate::stream::Accumulator;
    use serde_json::json;

    fn run(lines: &[&str]) -> Message {
        let mut dec = CompletionDecoder::default();
        let mut acc = Accumulator::new(Family::MessageId);
        for line in lines {
            for chunk in dec.data(line).unwrap() {
                acc.merge(chunk).unwrap();
            }
            if dec.done() {
                break;
            }
        }
        for chunk in dec.finish().unwrap() {
            acc.merge(chunk).unwrap();
        }
        acc.finish().unwrap()
    }

    #[test]
    fn text_is_keyed_by_completion_id() {
        let msg = run(&[
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":"2 + 2 "}}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":"= 4"},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);
        assert_eq!(msg.text(), "2 + 2 = 4");
        assert_eq!(msg.id.as_deref(), Some("chatcmpl-1"));
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn tool_call_fragments_arrive_as_one_descriptor() {
        let msg = run(&[
            r#"{"id":"c2","choices":[{"index":0,"delta":{"role":"assistant","content":null,"tool_calls":[{"index":0,"id":"call_abc","type":"function","function":{"name":"get_weather","arguments":""}}]}}]}"#,
            r#"{"id":"c2","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]}}]}"#,
            r#"{"id":"c2","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Paris\"}"}}]}}]}"#,
            r#"{"id":"c2","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);
        assert_eq!(msg.text(), crate::provider::EMPTY_TEXT_PLACEHOLDER);
        assert_eq!(
            msg.tool_calls,
            vec![ToolCall {
                id: "call_abc".into(),
                name: "get_weather".into(),
                arguments: Arguments::Parsed(json!({"city": "Paris"})),
            }]
        );
    }

    #[test]
    fn nameless_tool_call_is_malformed() {
        let mut dec = CompletionDecoder::default();
        dec.data(r#"{"id":"c","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{}"}}]}}]}"#)
            .unwrap();
        let err = dec.finish().unwrap_err();
        assert!(err.downcast_ref::<ChatError>().is_some());
    }

    #[test]
    fn non_json_payload_is_malformed() {
        let err = CompletionDecoder::default().data("{not json").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatError>(),
            Some(ChatError::MalformedChunk(_))
        ));
    }

    #[test]
    fn request_uses_tool_role_and_string_arguments() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: Arguments::Parsed(json!({"city": "Paris"})),
        };
        let history = vec![
            Message::user("weather?"),
            Message::assistant(Content::Text(String::new())).with_tool_calls(vec![call.clone()]),
            Message::tool_result(&call, "sunny", false),
        ];
        let tools = vec![ToolSpec {
            name: "get_weather".into(),
            description: "weather".into(),
            input_schema: json!({"type": "object"}),
        }];
        let body = build_request(&ChatRequest::new("gpt", "sys", &history, tools));
        let v = serde_json::to_value(&body).unwrap();

        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][2]["content"], Value::Null);
        assert_eq!(v["messages"][2]["tool_calls"][0]["function"]["arguments"], r#"{"city":"Paris"}"#);
        assert_eq!(v["messages"][3]["role"], "tool");
        assert_eq!(v["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(v["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(v["stream"], true);
    }

    #[test]
    fn base_url_without_trailing_slash_keeps_its_path() {
        let p = OpenAiProvider::xai(reqwest::Client::new(), "k".into(), Some("https://api.x.ai/v1")).unwrap();
        assert_eq!(
            p.api_base.join("chat/completions").unwrap().as_str(),
            "https://api.x.ai/v1/chat/completions"
        );
        assert_eq!(p.name(), "xai");
    }
}
