use super::http::HttpRpc;
use super::protocol::{self, CallResult, McpTool, ToolsList};
use super::stdio::StdioRpc;
use crate::tools::{Connection, Tool};
use anyhow::{anyhow, Context};
use futures_core::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum Rpc {
    Stdio(StdioRpc),
    Http(HttpRpc),
}

impl Rpc {
    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        match self {
            Rpc::Stdio(r) => r.request(method, params).await,
            Rpc::Http(r) => r.request(method, params).await,
        }
    }

    async fn notify(&mut self, method: &str) -> anyhow::Result<()> {
        match self {
            Rpc::Stdio(r) => r.notify(method).await,
            Rpc::Http(r) => r.notify(method).await,
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Rpc::Stdio(r) => r.shutdown().await,
            Rpc::Http(r) => r.shutdown().await,
        }
    }
}

/// One initialized server session, shared by the tools it serves.
#[derive(Debug, Clone)]
pub struct ServerSession {
    server: Arc<str>,
    rpc: Arc<Mutex<Rpc>>,
}

impl ServerSession {
    pub async fn initialize(server: &str, mut rpc: Rpc) -> anyhow::Result<Self> {
        let init = rpc
            .request("initialize", protocol::initialize_params())
            .await
            .context("initialize failed")?;
        let protocol = init
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("?");
        tracing::debug!(server, protocol, "MCP server initialized");
        rpc.notify("notifications/initialized").await?;

        Ok(Self {
            server: server.into(),
            rpc: Arc::new(Mutex::new(rpc)),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub async fn list_tools(&self) -> anyhow::Result<Vec<McpTool>> {
        let mut rpc = self.rpc.lock().await;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => serde_json::json!({ "cursor": c }),
                None => serde_json::json!({}),
            };
            let page: ToolsList = serde_json::from_value(
                rpc.request("tools/list", params).await.context("tools/list failed")?,
            )
            .context("invalid tools/list result")?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => return Ok(tools),
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<String> {
        let mut rpc = self.rpc.lock().await;
        let raw = rpc
            .request("tools/call", serde_json::json!({ "name": name, "arguments": arguments }))
            .await?;
        let result: CallResult = serde_json::from_value(raw).context("invalid tools/call result")?;
        if result.is_error {
            return Err(anyhow!(result.text()));
        }
        Ok(result.text())
    }

    /// Registry handle that shuts the server down when the turn-cycle ends.
    pub fn connection(&self) -> Box<dyn Connection> {
        Box::new(self.clone())
    }
}

impl Connection for ServerSession {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tracing::debug!(server = %self.server, "closing MCP session");
            self.rpc.lock().await.shutdown().await;
        })
    }
}

/// A tool served by an MCP server.
pub struct McpToolHandle {
    session: ServerSession,
    name: String,
    description: String,
    input_schema: Value,
}

impl McpToolHandle {
    pub fn new(session: ServerSession, tool: McpTool) -> Arc<Self> {
        Arc::new(Self {
            session,
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
        })
    }
}

impl Tool for McpToolHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    fn invoke(&self, arguments: Value) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move {
            self.session
                .call_tool(&self.name, arguments)
                .await
                .with_context(|| format!("{} on {}", self.name, self.session.server()))
        })
    }
}
