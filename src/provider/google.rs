use super::{
    batch_tool_results, ensure_success, spawn_sse_stream, ChatRequest, Chunk, ChunkStream, Family,
    Provider, SseDecoder, EMPTY_TEXT_PLACEHOLDER,
};
use crate::error::ChatError;
use crate::message::{Message, Role, ToolCall};
use anyhow::Context;
use futures_core::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";

#[derive(Debug, Clone)]
pub struct GoogleProvider {
    http: reqwest::Client,
    api_key: String,
    api_base: Url,
}

impl GoogleProvider {
    pub fn new(http: reqwest::Client, api_key: String, base_url: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            api_key,
            api_base: Url::parse(base_url.unwrap_or(DEFAULT_BASE_URL)).context("invalid Gemini base URL")?,
        })
    }

    fn build_url(&self, model: &str) -> anyhow::Result<Url> {
        // v1beta:streamGenerateContent supports Server-Sent Events with alt=sse.
        // Docs: https://ai.google.dev/api/rest/v1beta/models/streamGenerateContent
        let mut url = self
            .api_base
            .join(&format!("v1beta/models/{model}:streamGenerateContent"))?;
        url.query_pairs_mut()
            .append_pair("key", &self.api_key)
            .append_pair("alt", "sse");
        Ok(url)
    }

    fn headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }
}

impl Provider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn family(&self) -> Family {
        Family::FixedSlot
    }

    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, anyhow::Result<ChunkStream>> {
        let this = self.clone();

        Box::pin(async move {
            let url = this.build_url(&req.model)?;
            let body = build_request(&req);

            let resp = this
                .http
                .post(url)
                .headers(this.headers())
                .json(&body)
                .send()
                .await
                .context("failed to start Gemini request")?;
            let resp = ensure_success(resp, "Gemini").await?;

            Ok(spawn_sse_stream(resp, GenerateDecoder::default()))
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamGenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamGenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

fn build_request(req: &ChatRequest) -> StreamGenerateContentRequest {
    let history = req.conversation();
    let contents = batch_tool_results(&history)
        .into_iter()
        .map(|batch| match batch[0].role {
            Role::Tool => Content {
                role: Some("user".into()),
                parts: batch
                    .iter()
                    .map(|m| Part {
                        function_response: Some(FunctionResponse {
                            name: m.name.clone().unwrap_or_default(),
                            response: if m.is_error {
                                serde_json::json!({ "error": m.text() })
                            } else {
                                serde_json::json!({ "content": m.text() })
                            },
                        }),
                        ..Default::default()
                    })
                    .collect(),
            },
            Role::Assistant => model_content(&batch[0]),
            Role::User | Role::System => Content {
                role: Some("user".into()),
                parts: vec![Part {
                    text: Some(batch[0].text()),
                    ..Default::default()
                }],
            },
        })
        .collect();

    let declarations: Vec<FunctionDeclaration> = req
        .tools
        .iter()
        .map(|t| FunctionDeclaration {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: strip_unsupported_schema_keys(t.input_schema.clone()),
        })
        .collect();

    StreamGenerateContentRequest {
        system_instruction: req.system_text().map(|text| Content {
            role: None,
            parts: vec![Part {
                text: Some(text),
                ..Default::default()
            }],
        }),
        contents,
        tools: if declarations.is_empty() {
            Vec::new()
        } else {
            vec![ToolDeclarations {
                function_declarations: declarations,
            }]
        },
    }
}

fn model_content(m: &Message) -> Content {
    let mut parts = Vec::new();
    let text = m.text();
    if !text.is_empty() {
        parts.push(Part {
            text: Some(text),
            ..Default::default()
        });
    }
    for call in &m.tool_calls {
        parts.push(Part {
            function_call: Some(FunctionCall {
                id: None,
                name: call.name.clone(),
                args: call.arguments.to_wire(),
            }),
            ..Default::default()
        });
    }
    if parts.is_empty() {
        parts.push(Part {
            text: Some(EMPTY_TEXT_PLACEHOLDER.into()),
            ..Default::default()
        });
    }
    Content {
        role: Some("model".into()),
        parts,
    }
}

/// Gemini rejects JSON-Schema keywords outside its OpenAPI subset.
fn strip_unsupported_schema_keys(schema: Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| k != "$schema" && k != "additionalProperties")
                .map(|(k, v)| {
                    let v = if k == "properties" {
                        strip_property_schemas(v)
                    } else {
                        strip_unsupported_schema_keys(v)
                    };
                    (k, v)
                })
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_unsupported_schema_keys).collect()),
        other => other,
    }
}

/// Keys of a `properties` map are parameter names, so only their schemas are cleaned.
fn strip_property_schemas(properties: Value) -> Value {
    match properties {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(name, schema)| (name, strip_unsupported_schema_keys(schema)))
                .collect::<Map<_, _>>(),
        ),
        other => strip_unsupported_schema_keys(other),
    }
}

/// Gemini sends whole function calls; they are held until the turn ends.
#[derive(Default)]
struct GenerateDecoder {
    calls: Vec<ToolCall>,
}

impl SseDecoder for GenerateDecoder {
    fn data(&mut self, data: &str) -> anyhow::Result<Vec<Chunk>> {
        let r: StreamGenerateContentResponse = serde_json::from_str(data)
            .map_err(|e| ChatError::MalformedChunk(format!("Gemini response: {e}")))?;

        let mut text = String::new();
        let parts = r
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default();
        for p in parts {
            if let Some(t) = p.text {
                text.push_str(&t);
            }
            if let Some(fc) = p.function_call {
                let id = fc
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", self.calls.len()));
                self.calls.push(ToolCall {
                    id,
                    name: fc.name,
                    arguments: crate::message::Arguments::Parsed(if fc.args.is_null() {
                        Value::Object(Default::default())
                    } else {
                        fc.args
                    }),
                });
            }
        }

        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Chunk::Text {
            id: r.response_id,
            text,
        }])
    }

    fn finish(&mut self) -> anyhow::Result<Vec<Chunk>> {
        if self.calls.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Chunk::ToolCalls(std::mem::take(&mut self.calls))])
    }
}
