#![cfg(feature = "mcp")]

mod http;
mod protocol;
mod stdio;
mod tools;

use crate::cli::McpCommand;
use crate::tools::{ToolRegistry, ToolSource};
use anyhow::Context;
use futures_core::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tools::{McpToolHandle, Rpc, ServerSession};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transport {
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(flatten)]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

pub async fn cmd_mcp(cmd: McpCommand, path: &Path, http: &reqwest::Client) -> anyhow::Result<()> {
    match cmd {
        McpCommand::Add {
            name,
            env,
            command,
            args,
        } => {
            let env = parse_pairs(&env, '=').context("invalid --env")?;
            add(path, name, Transport::Stdio { command, args, env })
        }
        McpCommand::AddHttp { name, url, headers } => {
            let headers = parse_pairs(&headers, ':').context("invalid --header")?;
            add(path, name, Transport::Http { url, headers })
        }
        McpCommand::List => {
            let file = load_from(path)?;
            if file.servers.is_empty() {
                println!("(no MCP servers configured in {})", path.display());
                return Ok(());
            }
            for (name, s) in &file.servers {
                let target = match &s.transport {
                    Transport::Stdio { command, args, .. } => format!("{command} {args:?}"),
                    Transport::Http { url, .. } => url.clone(),
                };
                println!(
                    "{}\t{}\t{}",
                    if s.disabled { "disabled" } else { "enabled" },
                    name,
                    target
                );
            }
            Ok(())
        }
        McpCommand::Remove { name } => {
            let mut file = load_from(path)?;
            if file.servers.remove(&name).is_none() {
                anyhow::bail!("no such server: {name}");
            }
            save_to(path, &file)
        }
        McpCommand::Enable { name } => set_disabled(path, &name, false),
        McpCommand::Disable { name } => set_disabled(path, &name, true),
        McpCommand::Tools => {
            let source = McpToolSource::new(load_from(path)?, http.clone());
            let sessions = source.connect_all().await?;
            if sessions.is_empty() {
                println!("(no enabled MCP servers)");
                return Ok(());
            }
            let mut failure = None;
            for session in &sessions {
                match session.list_tools().await {
                    Ok(tools) => {
                        for t in tools {
                            println!(
                                "{}\t{}\t{}",
                                session.server(),
                                t.name,
                                t.description.as_deref().unwrap_or("")
                            );
                        }
                    }
                    Err(e) => {
                        failure = Some(e.context(format!("failed to list tools from server {}", session.server())));
                        break;
                    }
                }
            }
            for session in sessions {
                crate::tools::Connection::close(session.connection()).await;
            }
            failure.map_or(Ok(()), Err)
        }
    }
}

fn add(path: &Path, name: String, transport: Transport) -> anyhow::Result<()> {
    let mut file = load_from(path)?;
    if file.servers.contains_key(&name) {
        anyhow::bail!("server already exists: {name}");
    }
    file.servers.insert(
        name,
        McpServerConfig {
            transport,
            disabled: false,
        },
    );
    save_to(path, &file)
}

fn set_disabled(path: &Path, name: &str, disabled: bool) -> anyhow::Result<()> {
    let mut file = load_from(path)?;
    let server = file
        .servers
        .get_mut(name)
        .with_context(|| format!("no such server: {name}"))?;
    server.disabled = disabled;
    save_to(path, &file)
}

/// `KEY=VALUE` (or `Name: value`) pairs from the command line.
fn parse_pairs(items: &[String], sep: char) -> anyhow::Result<BTreeMap<String, String>> {
    items
        .iter()
        .map(|item| {
            let (k, v) = item
                .split_once(sep)
                .with_context(|| format!("expected KEY{sep}VALUE, got `{item}`"))?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

pub fn load_from(path: &Path) -> anyhow::Result<McpServersFile> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(McpServersFile::default()),
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("failed to read MCP config: {}", path.display()))
        }
    };

    let parsed: McpServersFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse JSON: {}", path.display()))?;
    Ok(parsed)
}

fn save_to(path: &Path, file: &McpServersFile) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create config dir: {}", dir.display()))?;

    let tmp: PathBuf = {
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "mcp_config.json".to_string());
        path.with_file_name(format!("{name}.tmp"))
    };

    let bytes = serde_json::to_vec_pretty(file).context("failed to encode JSON")?;
    std::fs::write(&tmp, bytes).with_context(|| format!("failed to write: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace: {}", path.display()))?;
    Ok(())
}

/// Connects to every enabled server when a turn-cycle opens its registry.
pub struct McpToolSource {
    servers: Vec<(String, McpServerConfig)>,
    http: reqwest::Client,
}

impl McpToolSource {
    pub fn new(file: McpServersFile, http: reqwest::Client) -> Self {
        Self {
            servers: file.servers.into_iter().filter(|(_, s)| !s.disabled).collect(),
            http,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Initialize a session with every server; on failure the ones already up are shut down.
    async fn connect_all(&self) -> anyhow::Result<Vec<ServerSession>> {
        let mut sessions = Vec::with_capacity(self.servers.len());
        for (name, server) in &self.servers {
            match self.connect(name, server).await {
                Ok(s) => sessions.push(s),
                Err(e) => {
                    for s in sessions {
                        crate::tools::Connection::close(s.connection()).await;
                    }
                    return Err(e.context(format!("failed to connect to MCP server {name}")));
                }
            }
        }
        Ok(sessions)
    }

    async fn connect(&self, name: &str, server: &McpServerConfig) -> anyhow::Result<ServerSession> {
        let rpc = match &server.transport {
            Transport::Stdio { command, args, env } => Rpc::Stdio(stdio::StdioRpc::spawn(command, args, env)?),
            Transport::Http { url, headers } => Rpc::Http(http::HttpRpc::new(self.http.clone(), url, headers)?),
        };
        ServerSession::initialize(name, rpc).await
    }
}

impl ToolSource for McpToolSource {
    fn open(&self) -> BoxFuture<'_, anyhow::Result<ToolRegistry>> {
        Box::pin(async move {
            let mut registry = ToolRegistry::default();
            for session in self.connect_all().await? {
                registry.hold(session.connection());
                match session.list_tools().await {
                    Ok(tools) => {
                        tracing::debug!(server = session.server(), tools = tools.len(), "MCP tools listed");
                        for t in tools {
                            registry.register(McpToolHandle::new(session.clone(), t));
                        }
                    }
                    Err(e) => {
                        let server = session.server().to_string();
                        registry.close().await;
                        return Err(e.context(format!("failed to list tools from server {server}")));
                    }
                }
            }
            Ok(registry)
        })
    }
}
