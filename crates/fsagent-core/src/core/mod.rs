//! Conversation core: events, session state, the turn loop, transcripts.

pub mod events;
pub mod orchestrator;
pub mod session;
pub mod transcript;

pub use events::{ContentBlock, TurnEvent};
pub use orchestrator::{AgentOrchestrator, TurnFailure, TurnOutcome, drive_turn};
pub use session::{CURRENT_DIRECTORY_KEY, ConversationSession};
pub use transcript::{EMPTY_TRANSCRIPT, format_events};
