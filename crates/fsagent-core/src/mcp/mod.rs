//! MCP tool-server subprocess: wire protocol, stdio channel, tool catalog.

pub mod catalog;
pub mod channel;
pub mod protocol;

pub use catalog::{ToolCatalog, ToolDescriptor};
pub use channel::{
    ChannelError, ChannelErrorKind, ChannelOptions, ServerCommand, ToolChannel, ToolPayload,
};
