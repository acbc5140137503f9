//! Configuration types for MCP servers.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level MCP configuration, as found in `mcp.json`.
///
/// Servers are kept in name order so that connect results, and with them the
/// tool-collision winner, are deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables layered over the host environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Per-server request timeout in milliseconds, overriding the client default.
    #[serde(
        default,
        rename = "timeoutMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_ms: Option<u64>,
}

impl McpServerConfig {
    /// A server config with just a command and arguments.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            timeout_ms: None,
        }
    }
}

impl McpConfig {
    /// Parse configuration text. Fails if the JSON is malformed or the
    /// `mcpServers` object is missing.
    pub fn parse(text: &str) -> Result<Self, McpError> {
        serde_json::from_str(text).map_err(|e| McpError::InvalidConfig(e.to_string()))
    }
}
