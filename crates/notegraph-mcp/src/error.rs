//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication and the server registry.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid MCP configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("MCP server '{name}' failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("MCP server '{name}' did not become ready within {timeout_ms}ms")]
    StartupTimeout { name: String, timeout_ms: u64 },

    #[error("MCP server '{name}' failed to initialize after {attempts} attempt(s): {source}")]
    HandshakeFailed {
        name: String,
        attempts: u32,
        source: Box<McpError>,
    },

    #[error("MCP server '{name}' failed tool discovery: {source}")]
    DiscoveryFailed {
        name: String,
        source: Box<McpError>,
    },

    #[error("MCP server '{name}' timed out after {timeout_ms}ms waiting for '{method}'")]
    Timeout {
        name: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("MCP server '{name}' disconnected")]
    Disconnected { name: String },

    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("MCP server '{name}' is not connected")]
    ServerNotConnected { name: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Whether resending the same request on the same connection could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            McpError::Disconnected { .. } | McpError::ServerNotConnected { .. }
        )
    }
}
