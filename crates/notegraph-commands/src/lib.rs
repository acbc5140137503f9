//! Command surface between the host/UI process and the MCP registry.
//!
//! Every operation returns a plain serializable value; registry errors are
//! turned into `{success: false, error}` and never escape.

pub mod bridge;
pub mod commands;

pub use bridge::{BridgeReply, BridgeRequest, HostCommand, serve};
pub use commands::{CommandResponse, McpCommands};
