//! The turn-cycle: stream a reply, run requested tools, feed results back, repeat.

use crate::dispatch::dispatch;
use crate::error::ChatError;
use crate::message::Message;
use crate::provider::{ChatRequest, Provider, ToolSpec};
use crate::render::Renderer;
use crate::session::ConversationSession;
use crate::stream;
use crate::tools::{ToolRegistry, ToolSource};
use anyhow::Context;

/// Model calls allowed in one turn-cycle before it is abandoned.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Streaming,
    Dispatching,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Model calls made.
    pub rounds: usize,
    pub tool_calls: usize,
}

pub struct Chat {
    provider: Box<dyn Provider + Send + Sync>,
    tools: Box<dyn ToolSource>,
    model: String,
    system_prompt: String,
    max_tool_rounds: usize,
}

impl Chat {
    pub fn new(
        provider: Box<dyn Provider + Send + Sync>,
        tools: Box<dyn ToolSource>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            tools,
            model: model.into(),
            system_prompt: system_prompt.into(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one turn-cycle for `input` and persist the session once the model stops asking for tools.
    ///
    /// On error nothing is persisted and the session keeps its previous history.
    pub async fn send(
        &self,
        session: &mut ConversationSession,
        input: &str,
        renderer: &mut dyn Renderer,
    ) -> anyhow::Result<TurnOutcome> {
        let mut history = session.history().to_vec();
        history.push(Message::user(input));

        let registry = self.tools.open().await.context("failed to open tools")?;
        let outcome = self.cycle(&mut history, &registry, renderer).await;
        registry.close().await;
        let outcome = outcome?;

        tracing::info!(
            rounds = outcome.rounds,
            tool_calls = outcome.tool_calls,
            session = %session.location(),
            "turn-cycle complete"
        );
        session
            .commit(history)
            .context("failed to persist transcript")?;
        Ok(outcome)
    }

    async fn cycle(
        &self,
        history: &mut Vec<Message>,
        registry: &ToolRegistry,
        renderer: &mut dyn Renderer,
    ) -> anyhow::Result<TurnOutcome> {
        let specs = registry.specs();
        let mut outcome = TurnOutcome {
            rounds: 0,
            tool_calls: 0,
        };
        let mut state = LoopState::Streaming;

        loop {
            tracing::debug!(?state, rounds = outcome.rounds, "turn-cycle state");
            state = match state {
                LoopState::Streaming => {
                    if outcome.rounds == self.max_tool_rounds {
                        return Err(ChatError::TooManyToolRounds(self.max_tool_rounds).into());
                    }
                    outcome.rounds += 1;
                    let reply = self.stream_reply(history, &specs, renderer).await?;
                    let next = if reply.tool_calls.is_empty() {
                        LoopState::Idle
                    } else {
                        LoopState::Dispatching
                    };
                    history.push(reply);
                    next
                }
                LoopState::Dispatching => {
                    let calls = history
                        .last()
                        .map(|m| m.tool_calls.clone())
                        .unwrap_or_default();
                    outcome.tool_calls += calls.len();
                    let results = dispatch(&calls, registry, renderer).await?;
                    history.extend(results);
                    LoopState::Streaming
                }
                LoopState::Idle => return Ok(outcome),
            };
        }
    }

    async fn stream_reply(
        &self,
        history: &[Message],
        specs: &[ToolSpec],
        renderer: &mut dyn Renderer,
    ) -> anyhow::Result<Message> {
        let req = ChatRequest::new(&self.model, &self.system_prompt, history, specs.to_vec());
        let chunks = self
            .provider
            .stream_chat(req)
            .await
            .with_context(|| format!("{} failed to start streaming", self.provider.name()))?;
        stream::collect_turn(self.provider.family(), chunks, renderer).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::provider::{ChatRequest, Chunk, ChunkStream, Family, Provider};
    use futures_core::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays one scripted chunk list per call and keeps every request it saw.
    pub struct ScriptedProvider {
        pub family: Family,
        pub turns: Mutex<VecDeque<Vec<anyhow::Result<Chunk>>>>,
        pub requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl ScriptedProvider {
        pub fn new(family: Family, turns: Vec<Vec<anyhow::Result<Chunk>>>) -> Self {
            Self {
                family,
                turns: Mutex::new(turns.into()),
                requests: Arc::default(),
            }
        }
    }

    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn family(&self) -> Family {
            self.family
        }

        fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, anyhow::Result<ChunkStream>> {
            self.requests.lock().unwrap().push(req);
            let turn = self.turns.lock().unwrap().pop_front();
            Box::pin(async move {
                let turn = turn.ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
                Ok(Box::pin(tokio_stream::iter(turn)) as ChunkStream)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;
    use crate::message::{Arguments, Content, Role, ToolCall};
    use crate::provider::{BlockDelta, Chunk, Family};
    use crate::render::testing::RecordingRenderer;
    use crate::session::testing::MemoryStore;
    use crate::tools::testing::{FnTool, StaticTools};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const SYSTEM: &str = "You are terse.";

    fn session() -> (ConversationSession, MemoryStore) {
        let store = MemoryStore::default();
        (ConversationSession::new(Box::new(store.clone())), store)
    }

    #[tokio::test]
    async fn plain_answer_ends_after_one_round() {
        let provider = ScriptedProvider::new(
            Family::MessageId,
            vec![vec![Ok(Chunk::Text {
                id: Some("m1".into()),
                text: "4".into(),
            })]],
        );
        let requests = provider.requests.clone();
        let chat = Chat::new(Box::new(provider), Box::new(StaticTools::default()), "m", SYSTEM);
        let (mut session, store) = session();
        let mut r = RecordingRenderer::default();

        let outcome = chat.send(&mut session, "What's 2+2?", &mut r).await.unwrap();

        assert_eq!(outcome, TurnOutcome { rounds: 1, tool_calls: 0 });
        let saves = store.saves.lock().unwrap();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].len(), 2);
        assert_eq!(saves[0][0], Message::user("What's 2+2?"));
        assert_eq!(saves[0][1].role, Role::Assistant);
        assert_eq!(saves[0][1].text(), "4");

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].messages[0], Message::system(SYSTEM));
        assert!(saves[0].iter().all(|m| m.role != Role::System));
    }

    #[tokio::test]
    async fn tool_round_trip_persists_four_entries() {
        let provider = ScriptedProvider::new(
            Family::BlockIndexed,
            vec![
                vec![
                    Ok(Chunk::Blocks(vec![BlockDelta::tool_use(
                        0,
                        Some("toolu_1".into()),
                        Some("search".into()),
                        "",
                    )])),
                    Ok(Chunk::Blocks(vec![BlockDelta::tool_use(0, None, None, "{\"query\": ")])),
                    Ok(Chunk::Blocks(vec![BlockDelta::tool_use(0, None, None, "\"weather tokyo\"}")])),
                ],
                vec![Ok(Chunk::Blocks(vec![BlockDelta::text(
                    0,
                    "It's sunny and 21°C in Tokyo.",
                )]))],
            ],
        );
        let requests = provider.requests.clone();
        let search = FnTool::new("search", |_| Ok("Sunny, 21C".into()));
        let tools = StaticTools {
            tools: vec![search.clone()],
            ..Default::default()
        };
        let closed = tools.closed.clone();
        let chat = Chat::new(Box::new(provider), Box::new(tools), "m", SYSTEM);
        let (mut session, store) = session();
        let mut r = RecordingRenderer::default();

        let outcome = chat
            .send(&mut session, "Weather in Tokyo?", &mut r)
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome { rounds: 2, tool_calls: 1 });
        assert_eq!(
            search.calls.lock().unwrap().as_slice(),
            &[json!({"query": "weather tokyo"})]
        );
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let saved = store.saves.lock().unwrap()[0].clone();
        let roles: Vec<_> = saved.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(saved[1].tool_calls[0].name, "search");
        assert_eq!(saved[2].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(saved[2].text(), "Sunny, 21C");
        assert_eq!(saved[3].text(), "It's sunny and 21°C in Tokyo.");

        // The second model call sees the tool result.
        let second = &requests.lock().unwrap()[1];
        assert_eq!(second.messages.last().unwrap().role, Role::Tool);
        assert_eq!(session.history(), saved.as_slice());
    }

    #[tokio::test]
    async fn failing_tool_is_fed_back_to_the_model() {
        let provider = ScriptedProvider::new(
            Family::MessageId,
            vec![
                vec![
                    Ok(Chunk::Text {
                        id: Some("m1".into()),
                        text: String::new(),
                    }),
                    Ok(Chunk::ToolCalls(vec![ToolCall {
                        id: "call_1".into(),
                        name: "Get_Weather".into(),
                        arguments: Arguments::Parsed(json!({"city": "Oslo"})),
                    }])),
                ],
                vec![Ok(Chunk::Text {
                    id: Some("m2".into()),
                    text: "The weather service is down.".into(),
                })],
            ],
        );
        let requests = provider.requests.clone();
        let tools = StaticTools {
            tools: vec![FnTool::new("get_weather", |_| {
                Err(anyhow::anyhow!("upstream timed out"))
            })],
            ..Default::default()
        };
        let chat = Chat::new(Box::new(provider), Box::new(tools), "m", SYSTEM);
        let (mut session, store) = session();
        let mut r = RecordingRenderer::default();

        chat.send(&mut session, "Weather in Oslo?", &mut r).await.unwrap();

        assert_eq!(requests.lock().unwrap().len(), 2);
        let saved = store.saves.lock().unwrap()[0].clone();
        let results: Vec<_> = saved.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("call_1"));
        assert!(results[0].is_error);
        assert!(results[0].text().contains("upstream timed out"));
        assert_eq!(saved[1].content, Content::Text(crate::provider::EMPTY_TEXT_PLACEHOLDER.into()));
    }

    #[tokio::test]
    async fn unknown_tool_aborts_without_persisting() {
        let provider = ScriptedProvider::new(
            Family::FixedSlot,
            vec![vec![Ok(Chunk::ToolCalls(vec![ToolCall {
                id: "c".into(),
                name: "launch_rockets".into(),
                arguments: Arguments::Parsed(json!({})),
            }]))]],
        );
        let tools = StaticTools::default();
        let closed = tools.closed.clone();
        let chat = Chat::new(Box::new(provider), Box::new(tools), "m", SYSTEM);
        let store = MemoryStore {
            initial: vec![Message::user("old"), Message::assistant(Content::Text("reply".into()))],
            ..Default::default()
        };
        let mut session = ConversationSession::open(Box::new(store.clone())).unwrap();
        let mut r = RecordingRenderer::default();

        let err = chat.send(&mut session, "go", &mut r).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ChatError>(),
            Some(ChatError::UnknownTool(name)) if name == "launch_rockets"
        ));
        assert!(store.saves.lock().unwrap().is_empty());
        assert_eq!(session.history().len(), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_failure_aborts_without_persisting() {
        let provider = ScriptedProvider::new(
            Family::MessageId,
            vec![vec![
                Ok(Chunk::Text {
                    id: Some("m".into()),
                    text: "half an ans".into(),
                }),
                Err(anyhow::anyhow!("connection reset")),
            ]],
        );
        let chat = Chat::new(Box::new(provider), Box::new(StaticTools::default()), "m", SYSTEM);
        let (mut session, store) = session();
        let mut r = RecordingRenderer::default();

        assert!(chat.send(&mut session, "hi", &mut r).await.is_err());
        assert!(store.saves.lock().unwrap().is_empty());
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn endless_tool_requests_hit_the_round_limit() {
        let call_turn = || {
            vec![Ok(Chunk::ToolCalls(vec![ToolCall {
                id: "c".into(),
                name: "noop".into(),
                arguments: Arguments::Parsed(json!({})),
            }]))]
        };
        let provider = ScriptedProvider::new(Family::FixedSlot, (0..5).map(|_| call_turn()).collect());
        let tools = StaticTools {
            tools: vec![FnTool::new("noop", |_| Ok(String::new()))],
            ..Default::default()
        };
        let chat = Chat::new(Box::new(provider), Box::new(tools), "m", SYSTEM).with_max_tool_rounds(3);
        let (mut session, store) = session();
        let mut r = RecordingRenderer::default();

        let err = chat.send(&mut session, "loop", &mut r).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ChatError>(),
            Some(ChatError::TooManyToolRounds(3))
        ));
        assert!(store.saves.lock().unwrap().is_empty());
    }
}
