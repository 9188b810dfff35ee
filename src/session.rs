use crate::history::Store;
use crate::message::Message;

/// One conversation: its stored history and where it is persisted.
///
/// History only changes through [`ConversationSession::commit`], at the end of a finished
/// turn-cycle; a failed cycle leaves it exactly as last persisted.
pub struct ConversationSession {
    store: Box<dyn Store>,
    history: Vec<Message>,
}

impl ConversationSession {
    /// Start empty, ignoring anything already stored.
    pub fn new(store: Box<dyn Store>) -> Self {
        Self {
            store,
            history: Vec::new(),
        }
    }

    /// Resume whatever the store holds.
    pub fn open(store: Box<dyn Store>) -> anyhow::Result<Self> {
        let history = store.load()?;
        tracing::debug!(location = %store.location(), messages = history.len(), "session loaded");
        Ok(Self { store, history })
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Adopt the history of a finished turn-cycle and persist it.
    pub fn commit(&mut self, history: Vec<Message>) -> anyhow::Result<()> {
        self.store.save(&history)?;
        self.history = history;
        Ok(())
    }
}
