//! MCP manager: the registry of server connections and their merged tools.
//!
//! A manager is an ordinary value owned by application startup code and
//! shared by handle; there is no global instance. Its maps live behind a
//! mutex that is never held across an await. Reloads and disconnects are
//! serialized by a second lock so none of them can interleave.

use crate::client::{ClientOptions, McpClient, McpToolInfo, McpToolResult};
use crate::config::McpConfig;
use crate::error::McpError;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, MutexGuard, PoisonError};

/// Coarse liveness of a server, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRunState {
    Running,
    Stopped,
}

/// Diagnostic snapshot of one configured server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub status: ServerRunState,
    pub tools: Vec<McpToolInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Registry {
    /// Every server whose connect succeeded, including ones that dropped since.
    servers: BTreeMap<String, Arc<McpClient>>,
    /// Servers whose connect failed, with the error.
    failures: BTreeMap<String, String>,
    /// Tool name -> owning server name.
    tool_index: HashMap<String, String>,
}

impl Registry {
    fn drain(&mut self) -> Vec<Arc<McpClient>> {
        self.tool_index.clear();
        self.failures.clear();
        std::mem::take(&mut self.servers).into_values().collect()
    }
}

/// Manages connections to multiple MCP servers.
pub struct McpManager {
    options: ClientOptions,
    registry: std::sync::Mutex<Registry>,
    reload: tokio::sync::Mutex<()>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl McpManager {
    /// An empty manager; nothing runs until [`load_config`](Self::load_config).
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            registry: std::sync::Mutex::new(Registry::default()),
            reload: tokio::sync::Mutex::new(()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every connection with the servers described by `text`.
    ///
    /// Fails only if the configuration cannot be parsed, in which case the
    /// current connections are left alone. Servers that fail to start are
    /// logged and skipped; the rest are usable.
    pub async fn load_config(&self, text: &str) -> Result<(), McpError> {
        let config = McpConfig::parse(text)?;
        self.load(&config).await;
        Ok(())
    }

    /// Replace every connection with the servers in `config`.
    pub async fn load(&self, config: &McpConfig) {
        let _reload = self.reload.lock().await;

        let previous = self.registry().drain();
        shutdown_all(previous).await;

        let attempts = config.servers.iter().map(|(name, server_config)| async move {
            let result = McpClient::connect(name.clone(), server_config, &self.options).await;
            (name.clone(), result)
        });
        let results = join_all(attempts).await;

        let mut registry = self.registry();
        for (name, result) in results {
            match result {
                Ok(client) => {
                    for tool in client.tools() {
                        if let Some(previous) =
                            registry.tool_index.insert(tool.name.clone(), name.clone())
                        {
                            tracing::warn!(
                                "MCP tool '{}' from server '{}' replaces the one from '{}'",
                                tool.name,
                                name,
                                previous
                            );
                        }
                    }
                    registry.servers.insert(name, Arc::new(client));
                }
                Err(e) => {
                    tracing::warn!("Failed to start MCP server '{}': {}", name, e);
                    registry.failures.insert(name, e.to_string());
                }
            }
        }
        tracing::info!(
            "Loaded MCP configuration: {} of {} servers connected, {} tools",
            registry.servers.len(),
            config.servers.len(),
            registry.tool_index.len()
        );
    }

    /// All tools reachable right now. Tools owned by a server that has since
    /// disconnected are left out.
    pub fn get_all_tools(&self) -> Vec<McpToolInfo> {
        let registry = self.registry();
        let mut tools: Vec<McpToolInfo> = registry
            .tool_index
            .iter()
            .filter_map(|(tool_name, server)| {
                let client = registry.servers.get(server)?;
                if !client.is_connected() {
                    return None;
                }
                client.tools().into_iter().find(|t| &t.name == tool_name)
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Route a tool call to the server that owns the tool.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<McpToolResult, McpError> {
        let client = self.owner_of(tool_name)?;
        client.call_tool(tool_name, arguments).await
    }

    fn owner_of(&self, tool_name: &str) -> Result<Arc<McpClient>, McpError> {
        let registry = self.registry();
        let server = registry
            .tool_index
            .get(tool_name)
            .ok_or_else(|| McpError::ToolNotFound {
                name: tool_name.to_string(),
            })?;
        match registry.servers.get(server) {
            Some(client) if client.is_connected() => Ok(Arc::clone(client)),
            _ => Err(McpError::ServerNotConnected {
                name: server.clone(),
            }),
        }
    }

    /// The connection for `name`, if one was established.
    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.registry().servers.get(name).cloned()
    }

    /// Disconnect one server and forget its tools. Returns whether it was known.
    /// Waits for an in-progress reload to finish first.
    pub async fn disconnect_server(&self, name: &str) -> bool {
        let _reload = self.reload.lock().await;
        let client = {
            let mut registry = self.registry();
            registry.tool_index.retain(|_, owner| owner != name);
            let failed = registry.failures.remove(name).is_some();
            match registry.servers.remove(name) {
                Some(client) => client,
                None => return failed,
            }
        };
        client.disconnect().await;
        true
    }

    /// Disconnect every server and clear the registry. Waits for an
    /// in-progress reload to finish first, so its connections are included.
    pub async fn disconnect_all(&self) {
        let _reload = self.reload.lock().await;
        let clients = self.registry().drain();
        shutdown_all(clients).await;
    }

    /// One entry per configured server, sorted by name.
    pub fn get_statuses(&self) -> Vec<ServerStatus> {
        let registry = self.registry();
        let mut statuses: Vec<ServerStatus> = registry
            .servers
            .iter()
            .map(|(name, client)| {
                let connected = client.is_connected();
                ServerStatus {
                    name: name.clone(),
                    status: if connected {
                        ServerRunState::Running
                    } else {
                        ServerRunState::Stopped
                    },
                    tools: client.tools(),
                    error: client.last_error(),
                    pid: client.pid(),
                    connected_at: client.connected_at(),
                }
            })
            .chain(registry.failures.iter().map(|(name, error)| ServerStatus {
                name: name.clone(),
                status: ServerRunState::Stopped,
                tools: Vec::new(),
                error: Some(error.clone()),
                pid: None,
                connected_at: None,
            }))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Number of servers currently connected.
    pub fn client_count(&self) -> usize {
        self.registry()
            .servers
            .values()
            .filter(|c| c.is_connected())
            .count()
    }
}

async fn shutdown_all(clients: Vec<Arc<McpClient>>) {
    join_all(clients.iter().map(|client| client.disconnect())).await;
}
