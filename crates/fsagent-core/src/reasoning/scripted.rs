//! Deterministic reasoning client for tests and offline runs.
//!
//! Plays back a pre-scripted event sequence per turn and records what the
//! orchestrator pushes back, so tests can assert on the full exchange
//! without a network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{ReasoningClient, ReasoningError, ReasoningErrorKind, TurnStream};
use crate::core::events::TurnEvent;
use crate::core::session::ConversationSession;
use crate::mcp::ToolCatalog;

/// One scripted turn: events to yield, plus an optional error to raise
/// once the script is exhausted.
#[derive(Debug)]
pub struct ScriptedTurn {
    events: VecDeque<TurnEvent>,
    trailing_error: Option<ReasoningError>,
    results: Vec<TurnEvent>,
}

impl ScriptedTurn {
    pub fn new(events: Vec<TurnEvent>) -> Self {
        Self {
            events: events.into(),
            trailing_error: None,
            results: Vec::new(),
        }
    }

    /// Yields the given events, then fails instead of ending cleanly.
    pub fn ending_in_error(events: Vec<TurnEvent>, error: ReasoningError) -> Self {
        Self {
            events: events.into(),
            trailing_error: Some(error),
            results: Vec::new(),
        }
    }

    /// Results pushed back so far, in push order.
    pub fn pushed_results(&self) -> &[TurnEvent] {
        &self.results
    }
}

impl TurnStream for ScriptedTurn {
    async fn next_event(&mut self) -> Result<Option<TurnEvent>, ReasoningError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        match self.trailing_error.take() {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }

    fn push_result(&mut self, result: &TurnEvent) -> Result<(), ReasoningError> {
        if !matches!(result, TurnEvent::ToolCallResult { .. }) {
            return Err(ReasoningError::new(
                ReasoningErrorKind::Protocol,
                "only tool call results can be pushed into the stream",
            ));
        }
        self.results.push(result.clone());
        Ok(())
    }
}

/// Hands out scripted turns in order; shared recording of prompts.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedClient {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// User messages seen so far, one per started turn.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl ReasoningClient for ScriptedClient {
    type Stream = ScriptedTurn;

    async fn begin_turn(
        &self,
        _session: &ConversationSession,
        user_message: &str,
        _catalog: &ToolCatalog,
    ) -> Result<ScriptedTurn, ReasoningError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(user_message.to_string());
        }
        self.turns
            .lock()
            .map_err(|_| {
                ReasoningError::new(ReasoningErrorKind::Protocol, "scripted turns lock poisoned")
            })?
            .pop_front()
            .ok_or_else(|| {
                ReasoningError::new(ReasoningErrorKind::Api, "no scripted turn remaining")
            })
    }

    // Scripts carry no cross-turn context.
    fn reset(&self) {}
}
