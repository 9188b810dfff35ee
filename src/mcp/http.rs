use super::protocol::{self, Request};
use crate::sse::{SseEvent, SseParser};
use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_stream::StreamExt;

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable-HTTP transport: every message is a POST; replies come back as JSON or as an SSE stream.
#[derive(Debug)]
pub struct HttpRpc {
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    session_id: Option<String>,
    next_id: u64,
}

impl HttpRpc {
    pub fn new(http: reqwest::Client, url: &str, headers: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes()).with_context(|| format!("invalid header name: {k}"))?;
            let value = HeaderValue::from_str(v).with_context(|| format!("invalid value for header {k}"))?;
            map.insert(name, value);
        }
        Ok(Self {
            http,
            url: url.to_string(),
            headers: map,
            session_id: None,
            next_id: 1,
        })
    }

    pub async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let body = serde_json::to_value(Request::new(id, method, params))?;
        let resp = self.post(&body).await?;

        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_sse {
            return read_sse_reply(resp, id).await;
        }

        let message: Value = resp.json().await.context("invalid JSON-RPC reply")?;
        protocol::match_response(&message, id).unwrap_or_else(|| Err(anyhow!("no reply to MCP request {id}")))
    }

    pub async fn notify(&mut self, method: &str) -> anyhow::Result<()> {
        self.post(&protocol::notification(method)).await.map(|_| ())
    }

    /// End the server-side session; best effort.
    pub async fn shutdown(&mut self) {
        let Some(session) = self.session_id.take() else {
            return;
        };
        let res = self
            .http
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await;
        if let Err(e) = res {
            tracing::debug!(error = %e, url = %self.url, "MCP session delete failed");
        }
    }

    async fn post(&mut self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = &self.session_id {
            req = req.header(SESSION_HEADER, session);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("failed to reach MCP server at {}", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("MCP server error: HTTP {status}: {text}"));
        }
        if let Some(session) = resp.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            self.session_id = Some(session.to_string());
        }
        Ok(resp)
    }
}

async fn read_sse_reply(resp: reqwest::Response, id: u64) -> anyhow::Result<Value> {
    let mut stream = resp.bytes_stream();
    let mut parser = SseParser::new();

    while let Some(item) = stream.next().await {
        let bytes = item.context("MCP event stream error")?;
        for ev in parser.push(&bytes) {
            if let Some(outcome) = reply_in(ev?, id) {
                return outcome;
            }
        }
    }
    if let Some(outcome) = parser.finish().and_then(|ev| reply_in(ev, id)) {
        return outcome;
    }
    Err(anyhow!("MCP event stream ended without a reply to request {id}"))
}

fn reply_in(ev: SseEvent, id: u64) -> Option<anyhow::Result<Value>> {
    let SseEvent::Data(data) = ev else {
        return None;
    };
    let message: Value = serde_json::from_str(&data).ok()?;
    protocol::match_response(&message, id)
}
