use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROVIDER: &str = "google";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Default model, or the name of a preset in `models`.
    pub model: Option<String>,

    /// Provider identifier: bedrock, google, openai, anthropic, xai or stub.
    pub provider: Option<String>,

    /// Where transcripts are written (default: `<state dir>/chat_history`).
    pub chat_history_dir: Option<PathBuf>,

    /// MCP servers file (default: `<config dir>/mcp_config.json`).
    pub mcp_config_file: Option<PathBuf>,

    /// Replaces the built-in system prompt.
    pub system_prompt: Option<String>,

    /// Model calls allowed per turn before giving up.
    pub max_tool_rounds: Option<usize>,

    /// Named provider/model pairs selectable with `--model <preset>`.
    pub models: BTreeMap<String, ModelPreset>,

    pub google: ProviderConfig,
    pub openai: ProviderConfig,
    pub anthropic: ProviderConfig,
    pub xai: ProviderConfig,
    pub bedrock: BedrockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPreset {
    pub provider: String,
    pub model: String,
}

#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

// Config is logged at debug level; keys must never reach the log.
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Bedrock authenticates through the AWS credential chain, so there is no key here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BedrockConfig {
    /// Defaults to the AWS profile or environment region, then us-east-1.
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

/// Presets available without any config, for the models the app was first built around.
const BUILTIN_PRESETS: &[(&str, &str, &str)] = &[
    ("nova-micro", "bedrock", "us.amazon.nova-micro-v1:0"),
    ("nova-lite", "bedrock", "us.amazon.nova-lite-v1:0"),
    ("nova-pro", "bedrock", "us.amazon.nova-pro-v1:0"),
    ("claude-3.7-sonnet-bedrock", "bedrock", "us.anthropic.claude-3-7-sonnet-20250219-v1:0"),
    ("gemini-2.5-pro", "google", "gemini-2.5-pro-exp-03-25"),
    ("gemini-2.0-flash", "google", "gemini-2.0-flash"),
    ("grok-2", "xai", "grok-2-latest"),
];

/// The provider and model a run will use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub provider: String,
    pub model: String,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// CLI flags win over the config file, which wins over built-in defaults. A model name that
    /// matches a preset brings its provider along unless a provider was given explicitly.
    pub fn choose_model(&self, cli_provider: Option<&str>, cli_model: Option<&str>) -> ModelChoice {
        let requested = cli_model.or(self.model.as_deref());

        if let Some(preset) = requested.and_then(|m| self.preset(m)) {
            return ModelChoice {
                provider: cli_provider.unwrap_or(&preset.provider).to_string(),
                model: preset.model.clone(),
            };
        }

        let provider = cli_provider
            .or(self.provider.as_deref())
            .unwrap_or(DEFAULT_PROVIDER)
            .to_string();
        let model = requested
            .map(str::to_string)
            .unwrap_or_else(|| default_model(&provider).to_string());
        ModelChoice { provider, model }
    }

    /// A preset from `[models]`, falling back to the built-in ones.
    pub fn preset(&self, name: &str) -> Option<ModelPreset> {
        self.models.get(name).cloned().or_else(|| {
            BUILTIN_PRESETS
                .iter()
                .find(|(preset, _, _)| *preset == name)
                .map(|(_, provider, model)| ModelPreset {
                    provider: provider.to_string(),
                    model: model.to_string(),
                })
        })
    }

    pub fn preset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        for (name, _, _) in BUILTIN_PRESETS {
            if !self.models.contains_key(*name) {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "google" => Some(&self.google),
            "openai" => Some(&self.openai),
            "anthropic" => Some(&self.anthropic),
            "xai" => Some(&self.xai),
            _ => None,
        }
    }

    /// API key for `provider`: its environment variable first, then the config file.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        self.api_key_with(provider, |var| std::env::var(var).ok())
    }

    fn api_key_with(&self, provider: &str, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        api_key_env(provider)
            .and_then(|var| env(var))
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.provider(provider).and_then(|p| p.api_key.clone()))
    }

    pub fn base_url(&self, provider: &str) -> Option<&str> {
        self.provider(provider).and_then(|p| p.base_url.as_deref())
    }
}

pub fn api_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "google" => Some("GEMINI_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "xai" => Some("XAI_API_KEY"),
        _ => None,
    }
}

pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-4o-mini",
        "anthropic" => "claude-3-5-sonnet-latest",
        "xai" => "grok-2-latest",
        "bedrock" => "us.amazon.nova-micro-v1:0",
        "stub" => "stub",
        _ => "gemini-2.0-flash",
    }
}
