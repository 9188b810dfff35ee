use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a turn-cycle. Everything else travels as `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A streamed chunk could not be folded into the turn.
    #[error("malformed stream chunk: {0}")]
    MalformedChunk(String),

    /// The model asked for a tool that is not registered.
    #[error("model requested unknown tool `{0}`")]
    UnknownTool(String),

    #[error("model kept requesting tools after {0} rounds")]
    TooManyToolRounds(usize),

    #[error("invalid transcript {}: {reason}", path.display())]
    Transcript { path: PathBuf, reason: String },
}
