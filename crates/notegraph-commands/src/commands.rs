//! The four host operations plus status reporting.

use notegraph_mcp::{McpManager, McpToolInfo, ServerStatus};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;

/// Uniform result shape returned across the host boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            result: None,
            error: None,
        }
    }

    pub fn failed(error: impl Display) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Host-facing handle onto a shared [`McpManager`].
#[derive(Clone)]
pub struct McpCommands {
    manager: Arc<McpManager>,
}

impl McpCommands {
    pub fn new(manager: Arc<McpManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<McpManager> {
        &self.manager
    }

    /// Replace the running servers with the ones described by `config`.
    pub async fn load_config(&self, config: &str) -> CommandResponse {
        match self.manager.load_config(config).await {
            Ok(()) => CommandResponse::ok(),
            Err(e) => {
                tracing::warn!("Rejected MCP configuration: {e}");
                CommandResponse::failed(e)
            }
        }
    }

    pub fn get_tools(&self) -> Vec<McpToolInfo> {
        self.manager.get_all_tools()
    }

    /// Call a tool. A tool that reports `isError` comes back with
    /// `success: false` and its text in `result`.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> CommandResponse {
        match self.manager.call_tool(name, arguments).await {
            Ok(output) => CommandResponse {
                success: output.is_success(),
                result: Some(serde_json::Value::String(output.text())),
                error: None,
            },
            Err(e) => {
                tracing::debug!("MCP tool '{}' failed: {}", name, e);
                CommandResponse::failed(e)
            }
        }
    }

    pub fn get_statuses(&self) -> Vec<ServerStatus> {
        self.manager.get_statuses()
    }

    pub async fn disconnect_all(&self) -> CommandResponse {
        self.manager.disconnect_all().await;
        CommandResponse::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> McpCommands {
        McpCommands::new(Arc::new(McpManager::default()))
    }

    #[test]
    fn response_shapes() {
        let ok = serde_json::to_value(CommandResponse::ok()).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true}));

        let failed = serde_json::to_value(CommandResponse::failed("nope")).unwrap();
        assert_eq!(failed, serde_json::json!({"success": false, "error": "nope"}));
    }

    #[tokio::test]
    async fn malformed_config_is_reported_not_raised() {
        let response = commands().load_config("{not json").await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("Invalid MCP configuration"));
    }

    #[tokio::test]
    async fn missing_servers_key_is_reported() {
        let response = commands().load_config(r#"{"servers":{}}"#).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn empty_config_loads() {
        let commands = commands();
        let response = commands.load_config(r#"{"mcpServers":{}}"#).await;
        assert_eq!(response, CommandResponse::ok());
        assert!(commands.get_tools().is_empty());
        assert!(commands.get_statuses().is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_response() {
        let response = commands()
            .call_tool("nonexistent", serde_json::json!({}))
            .await;
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"success": false, "error": "Tool not found: nonexistent"})
        );
    }

    #[tokio::test]
    async fn broken_server_shows_up_in_statuses_only() {
        let commands = commands();
        let response = commands
            .load_config(r#"{"mcpServers":{"broken":{"command":"nonexistent_command_xyz123"}}}"#)
            .await;
        assert!(response.success);
        assert!(commands.get_tools().is_empty());

        let statuses = serde_json::to_value(commands.get_statuses()).unwrap();
        assert_eq!(statuses[0]["name"], "broken");
        assert_eq!(statuses[0]["status"], "stopped");
        assert!(statuses[0]["error"].is_string());
    }

    #[tokio::test]
    async fn disconnect_all_always_succeeds() {
        let commands = commands();
        assert!(commands.disconnect_all().await.success);
        assert!(commands.disconnect_all().await.success);
    }
}
