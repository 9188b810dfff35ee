use anyhow::Context;
use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "mcp-chat";

fn home_dir() -> anyhow::Result<PathBuf> {
    let home = env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home))
}

pub fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// `MCP_CHAT_HOME` roots both config and state, for tests and portable installs.
fn app_home() -> Option<PathBuf> {
    env::var_os("MCP_CHAT_HOME").map(PathBuf::from)
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = app_home() {
        return ensure_dir(&base.join("config"));
    }

    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join(APP_DIR));
    }

    ensure_dir(&home_dir()?.join(".config").join(APP_DIR))
}

pub fn state_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = app_home() {
        return ensure_dir(&base.join("state"));
    }

    if let Some(xdg) = env::var_os("XDG_STATE_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join(APP_DIR));
    }

    ensure_dir(&home_dir()?.join(".local").join("state").join(APP_DIR))
}

/// Transcript directory; a relative configured path is taken relative to the state dir.
pub fn history_dir(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    match configured {
        Some(p) if p.is_absolute() => ensure_dir(p),
        Some(p) => ensure_dir(&state_dir()?.join(p)),
        None => ensure_dir(&state_dir()?.join("chat_history")),
    }
}

/// MCP servers file; a relative configured path is taken relative to the config dir.
pub fn mcp_config_path(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    match configured {
        Some(p) if p.is_absolute() => Ok(p.to_path_buf()),
        Some(p) => Ok(config_dir()?.join(p)),
        None => Ok(config_dir()?.join("mcp_config.json")),
    }
}

#[cfg(feature = "tui")]
pub fn log_path() -> anyhow::Result<PathBuf> {
    Ok(state_dir()?.join("mcp-chat.log"))
}
