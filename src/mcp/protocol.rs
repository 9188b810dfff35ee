//! JSON-RPC envelopes and the few MCP payloads the client needs.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

pub fn notification(method: &str) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "method": method })
}

pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

#[derive(Debug, Deserialize)]
struct Response {
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// The outcome of request `id` if `message` answers it; `None` for anything else the server
/// sends (notifications, requests, answers to other ids).
pub fn match_response(message: &Value, id: u64) -> Option<anyhow::Result<Value>> {
    let resp: Response = serde_json::from_value(message.clone()).ok()?;
    if resp.id.as_ref().and_then(Value::as_u64) != Some(id) {
        return None;
    }
    if message.get("method").is_some() {
        return None;
    }
    Some(match resp.error {
        Some(e) => Err(anyhow!("MCP error {}: {}", e.code, e.message)),
        None => Ok(resp.result.unwrap_or(Value::Null)),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Deserialize)]
pub struct ToolsList {
    #[serde(default)]
    pub tools: Vec<McpTool>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallResult {
    /// Text blocks joined by newlines; other block types are summarized.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                Some("image") => format!(
                    "[image: {}]",
                    block.get("mimeType").and_then(Value::as_str).unwrap_or("unknown")
                ),
                Some("resource") => format!(
                    "[resource: {}]",
                    block
                        .pointer("/resource/uri")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                ),
                _ => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_are_matched_by_id() {
        let ok = json!({"jsonrpc": "2.0", "id": 3, "result": {"x": 1}});
        assert_eq!(match_response(&ok, 3).unwrap().unwrap(), json!({"x": 1}));
        assert!(match_response(&ok, 4).is_none());

        let note = json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}});
        assert!(match_response(&note, 3).is_none());

        let err = json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -32601, "message": "no such method"}});
        let e = match_response(&err, 5).unwrap().unwrap_err();
        assert!(e.to_string().contains("-32601"));
    }

    #[test]
    fn call_result_text_joins_blocks() {
        let r: CallResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "Sunny"},
                {"type": "text", "text": "21C"},
                {"type": "image", "data": "..", "mimeType": "image/png"}
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(r.text(), "Sunny\n21C\n[image: image/png]");
    }

    #[test]
    fn tool_without_schema_gets_an_empty_object_schema() {
        let t: McpTool = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(t.input_schema["type"], "object");
    }
}
