use super::protocol::{self, Request};
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

/// A server spoken to over its stdin/stdout, one JSON-RPC message per line.
#[derive(Debug)]
pub struct StdioRpc {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioRpc {
    pub fn spawn(command: &str, args: &[String], env: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server: {command} {args:?}"))?;

        let stdin = child.stdin.take().context("child stdin missing")?;
        let stdout = child.stdout.take().context("child stdout missing")?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        })
    }

    pub async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let line = serde_json::to_string(&Request::new(id, method, params)).context("failed to encode JSON")?;
        self.write_line(&line).await?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .context("failed to read from MCP server")?
                .ok_or_else(|| anyhow!("MCP server closed stdout"))?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                tracing::debug!(%line, "ignoring non-JSON output from MCP server");
                continue;
            };
            if let Some(outcome) = protocol::match_response(&message, id) {
                return outcome;
            }
        }
    }

    pub async fn notify(&mut self, method: &str) -> anyhow::Result<()> {
        let line = protocol::notification(method).to_string();
        self.write_line(&line).await
    }

    async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to write to MCP server")?;
        self.stdin.write_all(b"\n").await.context("failed to write to MCP server")?;
        self.stdin.flush().await.ok();
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "failed to stop MCP server");
        }
    }
}
