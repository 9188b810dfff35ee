//! On-disk transcripts: one YAML file per conversation, a sequence of tagged records.

use crate::error::ChatError;
use crate::message::{Arguments, Content, Message, Role, ToolCall};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Persistence collaborator for one conversation.
pub trait Store: Send {
    /// Human-readable location, for logs and the UI.
    fn location(&self) -> String;

    fn load(&self) -> anyhow::Result<Vec<Message>>;

    /// Replace the stored history with `messages`.
    fn save(&self, messages: &[Message]) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Record {
    #[serde(rename = "human")]
    Human { content: Content },
    #[serde(rename = "ai")]
    Ai(AiRecord),
    /// Written by older versions mid-stream; read as a finished assistant turn.
    #[serde(rename = "AIMessageChunk")]
    AiChunk(AiRecord),
    #[serde(rename = "tool")]
    Tool(ToolRecord),
}

#[derive(Debug, Serialize, Deserialize)]
struct AiRecord {
    content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCallRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ToolCallRecord {
    id: String,
    name: String,
    args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ToolRecord {
    content: Content,
    tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    status: Status,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    #[default]
    Success,
    Error,
}

impl From<&ToolCall> for ToolCallRecord {
    fn from(call: &ToolCall) -> Self {
        let (args, args_error) = match &call.arguments {
            Arguments::Parsed(v) => (v.clone(), None),
            Arguments::Invalid { raw, error } => (Value::String(raw.clone()), Some(error.clone())),
        };
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            args,
            args_error,
        }
    }
}

impl From<ToolCallRecord> for ToolCall {
    fn from(r: ToolCallRecord) -> Self {
        let arguments = match r.args_error {
            None => Arguments::Parsed(r.args),
            Some(error) => Arguments::Invalid {
                raw: match r.args {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                error,
            },
        };
        Self {
            id: r.id,
            name: r.name,
            arguments,
        }
    }
}

fn to_record(m: &Message) -> Option<Record> {
    match m.role {
        Role::User => Some(Record::Human {
            content: m.content.clone(),
        }),
        Role::Assistant => Some(Record::Ai(AiRecord {
            content: m.content.clone(),
            id: m.id.clone(),
            tool_calls: m.tool_calls.iter().map(ToolCallRecord::from).collect(),
        })),
        Role::Tool => Some(Record::Tool(ToolRecord {
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone().unwrap_or_default(),
            name: m.name.clone(),
            status: if m.is_error { Status::Error } else { Status::Success },
        })),
        // The system prompt is injected per request and never stored.
        Role::System => None,
    }
}

fn from_record(r: Record) -> Message {
    match r {
        Record::Human { content } => Message {
            content,
            ..Message::user("")
        },
        Record::Ai(ai) | Record::AiChunk(ai) => Message::assistant(ai.content)
            .with_id(ai.id)
            .with_tool_calls(ai.tool_calls.into_iter().map(ToolCall::from).collect()),
        Record::Tool(t) => Message {
            role: Role::Tool,
            content: t.content,
            id: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(t.tool_call_id),
            name: t.name,
            is_error: t.status == Status::Error,
        },
    }
}

pub fn encode(messages: &[Message]) -> anyhow::Result<String> {
    let records: Vec<Record> = messages.iter().filter_map(to_record).collect();
    serde_yaml::to_string(&records).context("failed to encode transcript")
}

/// Decode a transcript. Any unknown record tag or malformed record fails the whole load.
pub fn decode(text: &str) -> Result<Vec<Message>, String> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let records: Vec<Record> = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    Ok(records.into_iter().map(from_record).collect())
}

/// A transcript file on disk.
#[derive(Debug, Clone)]
pub struct TranscriptFile {
    path: PathBuf,
}

impl TranscriptFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A fresh transcript in `dir`, named after the current time.
    pub fn create_in(dir: &Path) -> anyhow::Result<Self> {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .context("system clock is before 1970")?
            .as_secs();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create history dir: {}", dir.display()))?;

        // The empty file reserves the name; other processes starting in the same second skip it.
        let mut n = 0;
        loop {
            let name = match n {
                0 => format!("{secs}.yaml"),
                n => format!("{secs}-{n}.yaml"),
            };
            let path = dir.join(name);
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => {
                    return Err(anyhow::Error::new(e))
                        .with_context(|| format!("failed to create transcript: {}", path.display()))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for TranscriptFile {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> anyhow::Result<Vec<Message>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read transcript: {}", self.path.display()))
            }
        };
        decode(&text).map_err(|reason| {
            ChatError::Transcript {
                path: self.path.clone(),
                reason,
            }
            .into()
        })
    }

    fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create history dir: {}", dir.display()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, encode(messages)?)
            .with_context(|| format!("failed to write: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace: {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), messages = messages.len(), "transcript saved");
        Ok(())
    }
}

/// Most recent transcripts in `dir`, newest first.
pub fn list_recent(dir: &Path, limit: usize) -> anyhow::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("failed to list history dir: {}", dir.display()))
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "yaml") {
            files.push(path);
        }
    }
    files.sort_by_key(|p| std::cmp::Reverse(sort_key(p)));
    files.truncate(limit);
    Ok(files)
}

/// `1712345678-2.yaml` sorts by (1712345678, 2); names that are not timestamps sort first.
fn sort_key(path: &Path) -> (u64, u64, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let (secs, n) = stem.split_once('-').unwrap_or((stem.as_str(), "0"));
    (
        secs.parse().unwrap_or(0),
        n.parse().unwrap_or(0),
        stem.clone(),
    )
}
