//! Reasoning-engine abstraction.
//!
//! The engine is an external collaborator: given a session and a user
//! message it produces a finite, non-restartable sequence of turn events.
//! The sequence is produced incrementally — after yielding a
//! `ToolCallRequest` the stream will not advance until the orchestrator
//! pushes the correlated `ToolCallResult` back in.

pub mod gemini;
pub mod scripted;

use std::fmt;

use crate::core::events::TurnEvent;
use crate::core::session::ConversationSession;
use crate::mcp::ToolCatalog;

pub use gemini::{GeminiClient, GeminiConfig};
pub use scripted::{ScriptedClient, ScriptedTurn};

/// Error categories for reasoning-engine interactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningErrorKind {
    /// Transport failure reaching the engine.
    Http,
    /// API-level error returned by the engine.
    Api,
    /// Response shape outside the event contract.
    Protocol,
}

impl fmt::Display for ReasoningErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasoningErrorKind::Http => write!(f, "http"),
            ReasoningErrorKind::Api => write!(f, "api"),
            ReasoningErrorKind::Protocol => write!(f, "protocol"),
        }
    }
}

/// Structured error from the reasoning engine with kind and details.
#[derive(Debug, Clone)]
pub struct ReasoningError {
    pub kind: ReasoningErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl ReasoningError {
    pub fn new(kind: ReasoningErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ReasoningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ReasoningError {}

/// One turn's lazy event sequence.
pub trait TurnStream: Send {
    /// Pulls the next event; `None` once the turn is exhausted.
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<Option<TurnEvent>, ReasoningError>> + Send;

    /// Feeds a `ToolCallResult` back into the stream's driving context.
    ///
    /// # Errors
    /// `Protocol` when `result` is not a `ToolCallResult` or does not
    /// correlate with an outstanding request.
    fn push_result(&mut self, result: &TurnEvent) -> Result<(), ReasoningError>;
}

/// External reasoning engine: starts one turn at a time.
pub trait ReasoningClient: Send {
    type Stream: TurnStream;

    /// Opens the event stream for one turn. A new call starts a new turn;
    /// streams are never restarted.
    fn begin_turn(
        &self,
        session: &ConversationSession,
        user_message: &str,
        catalog: &ToolCatalog,
    ) -> impl Future<Output = Result<Self::Stream, ReasoningError>> + Send;

    /// Discards any cross-turn context held for the current conversation.
    /// Called when the conversation itself ends.
    fn reset(&self);
}
