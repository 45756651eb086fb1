//! The visible conversation and the rules for folding stream events into it.

use shared::error::StreamError;
use shared::protocol::{ChatMessage, Role, StreamEvent};

pub type TurnId = u64;

/// One thing that happened to an in-flight turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    Event(StreamEvent),
    /// The body ended without a `done` record.
    Ended,
    /// The stream could not be read to the end.
    Failed(StreamError),
}

/// How a turn closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("A response is still streaming")]
    TurnInFlight,
    #[error("Message is empty")]
    EmptyMessage,
}

/// A dismissible notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub message: String,
    pub detail: Option<String>,
}

/// What folding one event did to the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Complete,
    Rollback(StreamError),
}

/// Folds one turn's events into the pending assistant message at the end of
/// `messages`. Once `done` or `error` has been folded the turn is closed and
/// every later event is ignored.
#[derive(Debug, Clone, Default)]
pub struct TurnFold {
    closed: bool,
}

impl TurnFold {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Apply one event. An `error` event removes the pending message.
    pub fn fold(&mut self, messages: &mut Vec<ChatMessage>, event: StreamEvent) -> Step {
        if self.closed {
            tracing::trace!("Ignoring {:?} after the turn closed", event);
            return Step::Continue;
        }
        let step = fold_event(messages, event);
        if step != Step::Continue {
            self.closed = true;
        }
        step
    }
}

fn fold_event(messages: &mut Vec<ChatMessage>, event: StreamEvent) -> Step {
    let pending = match messages.last_mut() {
        Some(msg) if msg.role == Role::Assistant => msg,
        _ => return Step::Continue,
    };
    match event {
        StreamEvent::Sources(sources) => {
            if pending.content.is_empty() && pending.sources.is_none() {
                pending.sources = Some(sources);
            } else {
                tracing::debug!("Ignoring sources that arrived after the answer started");
            }
            Step::Continue
        }
        StreamEvent::Token(text) => {
            if !text.is_empty() {
                pending.content.push_str(&text);
                pending.is_thinking = false;
            }
            Step::Continue
        }
        StreamEvent::Done => Step::Complete,
        StreamEvent::Error(message) => {
            messages.pop();
            Step::Rollback(StreamError::Turn(message))
        }
    }
}

/// Conversation state for the chat pane. At most one turn is open at a time.
#[derive(Debug, Default)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
    open_turn: Option<TurnId>,
    fold: TurnFold,
    last_turn: TurnId,
    notices: Vec<Notice>,
    last_notice: u64,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn is_streaming(&self) -> bool {
        self.open_turn.is_some()
    }

    /// Record the user's message and an empty assistant placeholder.
    pub fn begin_turn(&mut self, text: &str) -> Result<TurnId, SessionError> {
        if self.open_turn.is_some() {
            return Err(SessionError::TurnInFlight);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        self.messages.push(ChatMessage::user(text));
        self.messages.push(ChatMessage::assistant_placeholder());
        self.last_turn += 1;
        self.open_turn = Some(self.last_turn);
        self.fold = TurnFold::new();
        Ok(self.last_turn)
    }

    /// Fold an update into the conversation. Updates for a turn that is no
    /// longer open are dropped. Returns the outcome when this update closed
    /// the turn.
    pub fn apply(&mut self, turn: TurnId, update: TurnUpdate) -> Option<TurnOutcome> {
        if self.open_turn != Some(turn) {
            tracing::trace!("Dropping update for closed turn {}", turn);
            return None;
        }
        let step = match update {
            TurnUpdate::Event(event) => self.fold.fold(&mut self.messages, event),
            TurnUpdate::Ended => Step::Complete,
            TurnUpdate::Failed(err) => {
                self.drop_pending();
                Step::Rollback(err)
            }
        };
        match step {
            Step::Continue => None,
            Step::Complete => {
                self.open_turn = None;
                Some(TurnOutcome::Completed)
            }
            Step::Rollback(err) => {
                self.open_turn = None;
                tracing::warn!("Chat turn {} failed: {}", turn, err);
                self.notify(err.user_message(), Some(err.to_string()));
                Some(TurnOutcome::RolledBack)
            }
        }
    }

    /// Close the open turn at the user's request. A placeholder that never
    /// received text is removed; partial answers stay.
    pub fn cancel_turn(&mut self) -> bool {
        if self.open_turn.take().is_none() {
            return false;
        }
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant && last.content.is_empty() => {
                self.messages.pop();
            }
            Some(last) if last.role == Role::Assistant => last.is_thinking = false,
            _ => {}
        }
        true
    }

    /// Start a new conversation.
    pub fn clear(&mut self) {
        self.open_turn = None;
        self.messages.clear();
    }

    pub fn notify(&mut self, message: impl Into<String>, detail: Option<String>) -> u64 {
        self.last_notice += 1;
        self.notices.push(Notice {
            id: self.last_notice,
            message: message.into(),
            detail,
        });
        self.last_notice
    }

    pub fn dismiss(&mut self, id: u64) {
        self.notices.retain(|n| n.id != id);
    }

    fn drop_pending(&mut self) {
        if matches!(self.messages.last(), Some(m) if m.role == Role::Assistant) {
            self.messages.pop();
        }
    }
}
