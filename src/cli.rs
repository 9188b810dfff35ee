use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chat with an LLM that can call tools from MCP servers.
#[derive(Debug, Parser)]
#[command(name = "mcp-chat")]
#[command(version)]
#[command(about = "Streaming LLM chat with MCP tools", long_about = None)]
pub struct Args {
    /// Model name, or a preset (built-in such as nova-micro, or from [models] in config.toml)
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Provider: bedrock, google, openai, anthropic, xai or stub (default: config/provider or "google")
    #[arg(long = "provider")]
    pub provider: Option<String>,

    /// Resume (and keep writing to) this transcript file
    #[arg(short = 's', long = "session", value_name = "FILE")]
    pub session: Option<PathBuf>,

    /// Do not connect to any MCP server
    #[arg(long = "no-tools")]
    pub no_tools: bool,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text; when given, run one turn and exit
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an interactive terminal chat UI
    #[cfg(feature = "tui")]
    Tui,

    /// List the most recent transcripts, newest first
    Sessions,

    /// Ask the model for a system prompt suited to the configured tools
    SystemPrompt,

    /// Manage MCP servers (config) and inspect their tools
    #[cfg(feature = "mcp")]
    Mcp {
        #[command(subcommand)]
        cmd: McpCommand,
    },
}

#[cfg(feature = "mcp")]
#[derive(Debug, Subcommand)]
pub enum McpCommand {
    /// Add a stdio server
    Add {
        /// Server name
        name: String,
        /// Environment variable for the server process (KEY=VALUE, repeatable)
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Command to execute (e.g. "uvx")
        command: String,
        /// Remaining args passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Add a streamable-HTTP server
    AddHttp {
        /// Server name
        name: String,
        /// Endpoint URL
        url: String,
        /// Extra request header (Name: value, repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
        headers: Vec<String>,
    },
    /// List configured servers
    List,
    /// Remove a server by name
    Remove { name: String },
    /// Enable a server
    Enable { name: String },
    /// Disable a server
    Disable { name: String },
    /// Print discovered tools from enabled servers
    Tools,
}
