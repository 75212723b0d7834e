//! In-memory conversation session state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Key under which the working-directory context value is stored.
pub const CURRENT_DIRECTORY_KEY: &str = "current_directory";

/// Identity and keyed state for one conversation.
///
/// Owned exclusively by the orchestrator; lives for the lifetime of one
/// orchestrator instance and is destroyed on shutdown.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub session_id: Uuid,
    pub user_id: String,
    context_state: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    turns: u64,
}

impl ConversationSession {
    /// Creates a session seeded with the working-directory context value.
    pub fn new(user_id: impl Into<String>, root: &str) -> Self {
        let mut context_state = HashMap::new();
        context_state.insert(CURRENT_DIRECTORY_KEY.to_string(), Value::from(root));
        Self {
            session_id: Uuid::new_v4(),
            user_id: user_id.into(),
            context_state,
            created_at: Utc::now(),
            turns: 0,
        }
    }

    pub fn state(&self, key: &str) -> Option<&Value> {
        self.context_state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.context_state.insert(key.into(), value);
    }

    /// Number of turns completed (including failed ones).
    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn begin_turn(&mut self) -> u64 {
        self.turns += 1;
        self.turns
    }
}
