//! Turn event types shared by the reasoning stream and the transcript.
//!
//! This module defines the contract for events produced during one
//! conversation turn. Events are serializable for logging and replay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event in the ordered sequence a turn produces.
///
/// Order is significant: the transcript preserves arrival order exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A piece of the final answer.
    TextFragment { content: String },

    /// The reasoning engine wants a tool invoked.
    ToolCallRequest {
        id: String,
        name: String,
        arguments: Value,
    },

    /// The outcome of a tool invocation, fed back into the reasoning stream.
    ToolCallResult {
        id: String,
        name: String,
        /// Content blocks returned by the tool server; `None` when the
        /// server sent no response content at all.
        payload: Option<Vec<ContentBlock>>,
        is_error: bool,
    },
}

/// A single content block inside a tool result.
///
/// Mirrors the MCP content block shape: a `type` tag plus an optional
/// `text` field. Blocks of other types (images, resources) are carried
/// through but render as `(no text)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default = "default_block_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

fn default_block_type() -> String {
    "text".to_string()
}

impl ContentBlock {
    /// A plain text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

impl TurnEvent {
    /// Returns the correlation id if this event is a request or result.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            TurnEvent::TextFragment { .. } => None,
            TurnEvent::ToolCallRequest { id, .. } | TurnEvent::ToolCallResult { id, .. } => {
                Some(id)
            }
        }
    }
}
