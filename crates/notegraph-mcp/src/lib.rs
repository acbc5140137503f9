//! MCP (Model Context Protocol) client implementation for Notegraph.
//!
//! Supports stdio-based MCP servers that communicate via newline-delimited
//! JSON-RPC 2.0 messages. Each configured server is spawned as a child process,
//! initialized with a handshake, and its tools are discovered and merged into
//! one namespace by the [`McpManager`].

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod manager;
pub mod pending;
pub mod retry;
pub mod state;
mod transport;

pub use client::{ClientOptions, McpClient, McpToolContent, McpToolInfo, McpToolResult, ServerInfo};
pub use config::{McpConfig, McpServerConfig};
pub use error::McpError;
pub use manager::{McpManager, ServerRunState, ServerStatus};
pub use retry::{Backoff, RetryPolicy};
pub use state::ConnectionState;
