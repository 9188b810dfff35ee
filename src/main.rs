mod app;
mod chat;
mod cli;
mod config;
mod dispatch;
mod error;
mod history;
mod message;
mod paths;
mod prompt;
mod provider;
mod render;
mod session;
mod sse;
mod stream;
mod tools;

#[cfg(feature = "mcp")]
mod mcp;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    init_logging(&args)?;

    // Resolve and create dirs early.
    let config_dir = paths::config_dir()?;
    let _state_dir = paths::state_dir()?;

    let cfg = config::Config::load_optional(config_dir.join("config.toml"))?.unwrap_or_default();
    tracing::debug!(?config_dir, ?cfg, "resolved config");

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let setup = app::Setup::new(
        cfg,
        http,
        args.provider.as_deref(),
        args.model.as_deref(),
        args.no_tools,
    )?;

    match args.cmd {
        #[cfg(feature = "mcp")]
        Some(cli::Command::Mcp { cmd }) => {
            return mcp::cmd_mcp(cmd, &setup.mcp_config, &setup.http).await;
        }
        #[cfg(feature = "tui")]
        Some(cli::Command::Tui) => {
            return tui::run_tui(&setup, args.session.as_deref()).await;
        }
        Some(cli::Command::Sessions) => {
            return app::cmd_sessions(&setup);
        }
        Some(cli::Command::SystemPrompt) => {
            return app::cmd_system_prompt(&setup).await;
        }
        None => {}
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        return app::run_repl(&setup, args.session.as_deref()).await;
    }
    app::run_once(&setup, args.session.as_deref(), &prompt).await
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
}

fn init_logging(args: &cli::Args) -> anyhow::Result<()> {
    #[cfg(feature = "tui")]
    {
        if matches!(args.cmd, Some(cli::Command::Tui)) {
            return init_file_logging();
        }
    }
    #[cfg(not(feature = "tui"))]
    let _ = args;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// The TUI owns the terminal, so logs go to a file under the state dir.
#[cfg(feature = "tui")]
fn init_file_logging() -> anyhow::Result<()> {
    let path = paths::log_path()?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file: {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(std::sync::Arc::new(file))
        .init();
    Ok(())
}
