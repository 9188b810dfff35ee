use crate::chat::{Chat, DEFAULT_MAX_TOOL_ROUNDS};
use crate::config::{self, Config, ModelChoice};
use crate::history::{self, Store, TranscriptFile};
use crate::provider::{self, Provider};
use crate::render::{self, LineRenderer, Renderer};
use crate::session::ConversationSession;
use crate::tools::{NoTools, ToolSource};
use crate::{paths, prompt};
use anyhow::Context;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

/// How many transcripts `sessions` lists.
pub const RECENT_SESSIONS: usize = 20;

/// Everything resolved from flags, config file and environment before a chat starts.
#[derive(Debug, Clone)]
pub struct Setup {
    pub cfg: Config,
    pub http: reqwest::Client,
    pub choice: ModelChoice,
    pub history_dir: PathBuf,
    pub mcp_config: PathBuf,
    pub no_tools: bool,
}

impl Setup {
    pub fn new(
        cfg: Config,
        http: reqwest::Client,
        cli_provider: Option<&str>,
        cli_model: Option<&str>,
        no_tools: bool,
    ) -> anyhow::Result<Self> {
        let choice = cfg.choose_model(cli_provider, cli_model);
        let history_dir = paths::history_dir(cfg.chat_history_dir.as_deref())?;
        let mcp_config = paths::mcp_config_path(cfg.mcp_config_file.as_deref())?;
        tracing::debug!(?choice, history_dir = %history_dir.display(), mcp_config = %mcp_config.display(), "resolved setup");
        Ok(Self {
            cfg,
            http,
            choice,
            history_dir,
            mcp_config,
            no_tools,
        })
    }

    pub fn system_prompt(&self) -> &str {
        self.cfg
            .system_prompt
            .as_deref()
            .unwrap_or(prompt::DEFAULT_SYSTEM_PROMPT)
    }

    pub fn chat(&self) -> anyhow::Result<Chat> {
        self.chat_for(&self.choice)
    }

    pub fn chat_for(&self, choice: &ModelChoice) -> anyhow::Result<Chat> {
        let provider = build_provider(&self.http, &self.cfg, &choice.provider)?;
        Ok(Chat::new(provider, self.tools()?, &choice.model, self.system_prompt())
            .with_max_tool_rounds(self.cfg.max_tool_rounds.unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)))
    }

    /// `/model <name>`: a preset brings its provider, anything else is a model of `current_provider`.
    pub fn choice_for(&self, name: &str, current_provider: &str) -> ModelChoice {
        match self.cfg.preset(name) {
            Some(preset) => ModelChoice {
                provider: preset.provider,
                model: preset.model,
            },
            None => ModelChoice {
                provider: current_provider.to_string(),
                model: name.to_string(),
            },
        }
    }

    pub fn tools(&self) -> anyhow::Result<Box<dyn ToolSource>> {
        if self.no_tools {
            return Ok(Box::new(NoTools));
        }
        #[cfg(feature = "mcp")]
        {
            let file = crate::mcp::load_from(&self.mcp_config)?;
            let source = crate::mcp::McpToolSource::new(file, self.http.clone());
            if !source.is_empty() {
                return Ok(Box::new(source));
            }
        }
        tracing::debug!(path = %self.mcp_config.display(), "no MCP servers enabled");
        Ok(Box::new(NoTools))
    }

    /// Resume `resume` if given, otherwise start a new transcript in the history dir.
    pub fn session(&self, resume: Option<&Path>) -> anyhow::Result<ConversationSession> {
        match resume {
            Some(path) => ConversationSession::open(Box::new(TranscriptFile::new(path))),
            None => self.new_session(),
        }
    }

    pub fn new_session(&self) -> anyhow::Result<ConversationSession> {
        Ok(ConversationSession::new(Box::new(TranscriptFile::create_in(&self.history_dir)?)))
    }
}

pub fn build_provider(
    http: &reqwest::Client,
    cfg: &Config,
    provider_name: &str,
) -> anyhow::Result<Box<dyn Provider + Send + Sync>> {
    let base_url = cfg.base_url(provider_name);
    match provider_name {
        "google" => {
            #[cfg(feature = "google")]
            {
                let key = require_key(cfg, provider_name)?;
                Ok(Box::new(provider::google::GoogleProvider::new(http.clone(), key, base_url)?))
            }
            #[cfg(not(feature = "google"))]
            {
                let _ = (http, base_url);
                anyhow::bail!("google provider is not enabled in this build")
            }
        }
        "openai" | "xai" => {
            #[cfg(feature = "openai")]
            {
                let key = require_key(cfg, provider_name)?;
                let p = if provider_name == "xai" {
                    provider::openai::OpenAiProvider::xai(http.clone(), key, base_url)?
                } else {
                    provider::openai::OpenAiProvider::new(http.clone(), key, base_url)?
                };
                Ok(Box::new(p))
            }
            #[cfg(not(feature = "openai"))]
            {
                let _ = (http, base_url);
                anyhow::bail!("{provider_name} provider is not enabled in this build")
            }
        }
        "anthropic" => {
            #[cfg(feature = "anthropic")]
            {
                let key = require_key(cfg, provider_name)?;
                Ok(Box::new(provider::anthropic::AnthropicProvider::new(http.clone(), key, base_url)?))
            }
            #[cfg(not(feature = "anthropic"))]
            {
                let _ = (http, base_url);
                anyhow::bail!("anthropic provider is not enabled in this build")
            }
        }
        "bedrock" | "bedrock_converse" => {
            #[cfg(feature = "bedrock")]
            {
                Ok(Box::new(provider::bedrock::BedrockProvider::new(
                    cfg.bedrock.region.as_deref(),
                    cfg.bedrock.endpoint_url.as_deref(),
                )))
            }
            #[cfg(not(feature = "bedrock"))]
            {
                anyhow::bail!("bedrock provider is not enabled in this build")
            }
        }
        "stub" => Ok(Box::new(provider::stub::StubProvider::new())),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

#[cfg(any(feature = "google", feature = "openai", feature = "anthropic"))]
fn require_key(cfg: &Config, provider_name: &str) -> anyhow::Result<String> {
    cfg.api_key(provider_name).with_context(|| {
        format!(
            "No API key for {provider_name}. Set {} or [{provider_name}] api_key in config.toml",
            config::api_key_env(provider_name).unwrap_or("the provider's API key variable")
        )
    })
}

/// One turn-cycle for a prompt given on the command line.
pub async fn run_once(setup: &Setup, resume: Option<&Path>, prompt: &str) -> anyhow::Result<()> {
    let chat = setup.chat()?;
    let mut session = setup.session(resume)?;
    let mut out = LineRenderer::stdout();
    chat.send(&mut session, prompt, &mut out).await?;
    Ok(())
}

/// Line-based chat on stdin/stdout until EOF or `/quit`.
pub async fn run_repl(setup: &Setup, resume: Option<&Path>) -> anyhow::Result<()> {
    let mut chat = setup.chat()?;
    let mut session = setup.session(resume)?;
    let mut out = LineRenderer::stdout();

    println!(
        "{} / {}  (transcript: {})",
        chat.provider_name(),
        chat.model(),
        session.location()
    );
    println!("Commands: /new  /model [name]  /quit");
    render::replay(session.history(), &mut out);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            println!();
            return Ok(());
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => return Ok(()),
            "/new" => {
                session = setup.new_session()?;
                println!("new chat (transcript: {})", session.location());
                continue;
            }
            "/model" => {
                println!("{} / {}", chat.provider_name(), chat.model());
                println!("presets: {}", setup.cfg.preset_names().join(", "));
                continue;
            }
            _ => {}
        }
        if let Some(name) = input.strip_prefix("/model ") {
            let choice = setup.choice_for(name.trim(), chat.provider_name());
            match setup.chat_for(&choice) {
                Ok(c) => {
                    chat = c;
                    println!("model set to {} / {}", choice.provider, choice.model);
                }
                Err(e) => out.error(&format!("{e:#}")),
            }
            continue;
        }

        if let Err(e) = chat.send(&mut session, input, &mut out).await {
            tracing::warn!(error = %format!("{e:#}"), "turn-cycle failed");
            out.error(&format!("{e:#}"));
        }
    }
}

/// Print the most recent transcripts with the first user message of each.
pub fn cmd_sessions(setup: &Setup) -> anyhow::Result<()> {
    let files = history::list_recent(&setup.history_dir, RECENT_SESSIONS)?;
    if files.is_empty() {
        println!("(no transcripts in {})", setup.history_dir.display());
        return Ok(());
    }
    for path in files {
        println!("{}\t{}", path.display(), session_preview(&path));
    }
    Ok(())
}

fn session_preview(path: &Path) -> String {
    match TranscriptFile::new(path).load() {
        Ok(messages) => {
            let first = messages
                .iter()
                .find(|m| m.role == crate::message::Role::User)
                .map(|m| m.text())
                .unwrap_or_default();
            let line = first.lines().next().unwrap_or("");
            let mut preview: String = line.chars().take(60).collect();
            if preview.len() < line.len() {
                preview.push('…');
            }
            format!("{} messages\t{preview}", messages.len())
        }
        Err(e) => format!("(unreadable: {e:#})"),
    }
}

/// Draft a system prompt for the configured tools. The model's reply streams to stderr and the
/// extracted prompt goes to stdout.
pub async fn cmd_system_prompt(setup: &Setup) -> anyhow::Result<()> {
    let registry = setup.tools()?.open().await.context("failed to open tools")?;
    let specs = registry.specs();
    registry.close().await;
    if specs.is_empty() {
        tracing::warn!("no tools configured; the generated prompt will be generic");
    }

    let provider = build_provider(&setup.http, &setup.cfg, &setup.choice.provider)?;
    let mut progress = LineRenderer::new(std::io::stderr());
    let text = prompt::generate(provider.as_ref(), &setup.choice.model, &specs, &mut progress).await?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_setup(dir: &Path) -> Setup {
        let cfg = Config {
            provider: Some("stub".into()),
            chat_history_dir: Some(dir.join("history")),
            mcp_config_file: Some(dir.join("mcp_config.json")),
            ..Default::default()
        };
        Setup::new(cfg, reqwest::Client::new(), None, None, false).unwrap()
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = build_provider(&reqwest::Client::new(), &Config::default(), "parrot").err().unwrap();
        assert!(err.to_string().contains("parrot"));
    }

    #[cfg(feature = "bedrock")]
    #[test]
    fn bedrock_needs_no_api_key() {
        let p = build_provider(&reqwest::Client::new(), &Config::default(), "bedrock_converse").unwrap();
        assert_eq!(p.name(), "bedrock");
        assert_eq!(p.family(), crate::provider::Family::BlockIndexed);
    }

    #[tokio::test]
    async fn one_shot_with_stub_writes_a_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let setup = stub_setup(dir.path());
        assert_eq!(setup.choice.model, "stub");

        run_once(&setup, None, "hello").await.unwrap();

        let files = history::list_recent(&setup.history_dir, RECENT_SESSIONS).unwrap();
        assert_eq!(files.len(), 1);
        let saved = TranscriptFile::new(&files[0]).load().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].text(), "[stub] You said: hello");
        assert!(session_preview(&files[0]).starts_with("2 messages\thello"));
    }

    #[tokio::test]
    async fn resumed_session_appends_to_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let setup = stub_setup(dir.path());
        let path = dir.path().join("history").join("100.yaml");

        run_once(&setup, Some(&path), "first").await.unwrap();
        run_once(&setup, Some(&path), "second").await.unwrap();

        let saved = TranscriptFile::new(&path).load().unwrap();
        assert_eq!(saved.len(), 4);
        assert_eq!(saved[2].text(), "second");
    }

    #[test]
    fn model_switch_resolves_presets_first() {
        let dir = tempfile::tempdir().unwrap();
        let setup = stub_setup(dir.path());
        assert_eq!(
            setup.choice_for("nova-lite", "stub"),
            ModelChoice {
                provider: "bedrock".into(),
                model: "us.amazon.nova-lite-v1:0".into()
            }
        );
        assert_eq!(setup.choice_for("echo-2", "stub").provider, "stub");
        assert_eq!(setup.chat_for(&setup.choice_for("echo-2", "stub")).unwrap().model(), "echo-2");
    }

    #[test]
    fn configured_system_prompt_replaces_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut setup = stub_setup(dir.path());
        assert_eq!(setup.system_prompt(), prompt::DEFAULT_SYSTEM_PROMPT);
        setup.cfg.system_prompt = Some("Be brief.".into());
        assert_eq!(setup.system_prompt(), "Be brief.");
    }
}
