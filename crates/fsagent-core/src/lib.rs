//! Core library for the filesystem agent: an MCP tool-server channel, a
//! Gemini-backed reasoning loop, and the orchestration between them.

pub mod config;
pub mod core;
pub mod mcp;
pub mod reasoning;

pub use crate::config::Config;
pub use crate::core::{AgentOrchestrator, ConversationSession, TurnEvent};
pub use crate::mcp::{ToolCatalog, ToolChannel};
pub use crate::reasoning::{GeminiClient, GeminiConfig, ScriptedClient};
