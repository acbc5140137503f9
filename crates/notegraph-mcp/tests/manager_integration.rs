//! End-to-end tests for `McpManager` routing, isolation and reload.

use std::sync::Arc;
use std::time::Duration;

use notegraph_mcp::{ClientOptions, McpError, McpManager, RetryPolicy, ServerRunState};
use serde_json::{Value, json};

const MOCK: &str = env!("CARGO_BIN_EXE_mock-mcp-server");

fn manager_options() -> ClientOptions {
    ClientOptions {
        request_timeout: Duration::from_secs(2),
        startup_timeout: Duration::from_secs(5),
        ready_fallback: Duration::from_millis(50),
        initialize_retry: RetryPolicy::linear(2, Duration::from_millis(10)),
        ..ClientOptions::default()
    }
}

fn manager() -> McpManager {
    McpManager::new(manager_options())
}

fn mock(tag: &str, tools: &[&str]) -> Value {
    json!({"command": MOCK, "args": ["--tag", tag, "--tools", tools.join(",")]})
}

fn config(servers: &[(&str, Value)]) -> String {
    let servers: serde_json::Map<String, Value> = servers
        .iter()
        .map(|(name, server)| (name.to_string(), server.clone()))
        .collect();
    json!({ "mcpServers": servers }).to_string()
}

fn tool_names(manager: &McpManager) -> Vec<String> {
    manager.get_all_tools().into_iter().map(|t| t.name).collect()
}

#[tokio::test]
async fn failing_server_does_not_block_the_others() {
    let manager = manager();
    manager
        .load_config(&config(&[
            ("a", mock("a", &["read_file"])),
            ("broken", json!({"command": "nonexistent_command_xyz123"})),
            ("c", mock("c", &["search"])),
        ]))
        .await
        .unwrap();

    assert_eq!(tool_names(&manager), vec!["read_file", "search"]);
    assert_eq!(manager.client_count(), 2);

    let statuses = manager.get_statuses();
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "broken", "c"]);
    assert_eq!(statuses[0].status, ServerRunState::Running);
    assert_eq!(statuses[1].status, ServerRunState::Stopped);
    assert!(statuses[1].error.is_some());
    assert_eq!(statuses[2].tools.len(), 1);

    manager.disconnect_all().await;
}

#[tokio::test]
async fn calls_are_routed_to_the_owning_server() {
    let manager = manager();
    manager
        .load_config(&config(&[
            ("a", mock("a", &["read_file"])),
            ("b", mock("b", &["write_file"])),
        ]))
        .await
        .unwrap();

    assert_eq!(tool_names(&manager), vec!["read_file", "write_file"]);

    let read = manager
        .call_tool("read_file", json!({"path": "/notes/a.md"}))
        .await
        .unwrap();
    assert!(read.text().starts_with("a:read_file\n"));
    assert!(read.text().contains("/notes/a.md"));

    let write = manager.call_tool("write_file", json!({})).await.unwrap();
    assert!(write.text().starts_with("b:write_file"));

    manager.disconnect_all().await;
}

#[tokio::test]
async fn colliding_tool_names_go_to_the_last_server() {
    let manager = manager();
    manager
        .load_config(&config(&[
            ("a", mock("a", &["search", "only_a"])),
            ("b", mock("b", &["search"])),
        ]))
        .await
        .unwrap();

    let names = tool_names(&manager);
    assert_eq!(names.iter().filter(|n| *n == "search").count(), 1);
    assert_eq!(names, vec!["only_a", "search"]);

    let result = manager.call_tool("search", json!({})).await.unwrap();
    assert!(result.text().starts_with("b:search"));

    manager.disconnect_all().await;
}

#[tokio::test]
async fn unknown_tool_touches_no_process() {
    let manager = manager();
    manager
        .load_config(&config(&[("a", mock("a", &["read_file"]))]))
        .await
        .unwrap();

    let err = manager
        .call_tool("nonexistent", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Tool not found: nonexistent");
    assert!(manager.client("a").unwrap().is_connected());

    manager.disconnect_all().await;
}

#[tokio::test]
async fn reload_replaces_every_connection() {
    let manager = manager();
    let text = config(&[
        ("a", mock("a", &["read_file"])),
        ("b", mock("b", &["write_file"])),
    ]);

    manager.load_config(&text).await.unwrap();
    let first_tools = tool_names(&manager);
    let first_a = manager.client("a").unwrap();

    manager.load_config(&text).await.unwrap();
    let second_a = manager.client("a").unwrap();

    assert_eq!(tool_names(&manager), first_tools);
    assert_ne!(first_a.instance_id(), second_a.instance_id());
    assert_ne!(first_a.pid(), second_a.pid());
    assert!(!first_a.is_connected());
    assert!(second_a.is_connected());

    manager.disconnect_all().await;
}

#[tokio::test]
async fn invalid_reload_keeps_existing_connections() {
    let manager = manager();
    manager
        .load_config(&config(&[("a", mock("a", &["read_file"]))]))
        .await
        .unwrap();

    let err = manager.load_config(r#"{"servers": {}}"#).await.unwrap_err();
    assert!(matches!(err, McpError::InvalidConfig(_)));
    assert_eq!(tool_names(&manager), vec!["read_file"]);

    manager.disconnect_all().await;
}

#[tokio::test]
async fn silent_echo_server_contributes_no_tools() {
    let manager = manager();
    manager
        .load_config(&config(&[(
            "fs",
            json!({"command": "echo", "args": [r#"{"jsonrpc":"2.0","id":1,"result":{}}"#]}),
        )]))
        .await
        .unwrap();

    assert!(manager.get_all_tools().is_empty());
    let statuses = manager.get_statuses();
    assert_eq!(statuses[0].status, ServerRunState::Stopped);
    let error = statuses[0].error.as_deref().unwrap();
    assert!(
        error.starts_with("MCP server 'fs' failed tool discovery"),
        "unexpected error: {error}"
    );
}

#[tokio::test]
async fn disconnect_all_waits_for_a_reload_in_progress() {
    let manager = Arc::new(McpManager::new(ClientOptions {
        ready_fallback: Duration::from_millis(300),
        ..manager_options()
    }));
    let text = config(&[("a", mock("a", &["read_file"]))]);

    let loading = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.load_config(&text).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.disconnect_all().await;
    loading.await.unwrap().unwrap();

    assert_eq!(manager.client_count(), 0);
    assert!(manager.get_all_tools().is_empty());
    assert!(manager.get_statuses().is_empty());
}

#[tokio::test]
async fn disconnect_server_waits_for_a_reload_in_progress() {
    let manager = Arc::new(McpManager::new(ClientOptions {
        ready_fallback: Duration::from_millis(300),
        ..manager_options()
    }));
    let text = config(&[
        ("a", mock("a", &["read_file"])),
        ("b", mock("b", &["write_file"])),
    ]);

    let loading = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.load_config(&text).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.disconnect_server("a").await);
    loading.await.unwrap().unwrap();

    assert_eq!(tool_names(&manager), vec!["write_file"]);
    assert!(manager.client("a").is_none());
    manager.disconnect_all().await;
}

#[tokio::test]
async fn crashed_server_reports_not_connected() {
    let manager = manager();
    manager
        .load_config(&config(&[
            ("a", mock("a", &["read_file", "crash"])),
            ("b", mock("b", &["write_file"])),
        ]))
        .await
        .unwrap();

    assert!(manager.call_tool("crash", json!({})).await.is_err());
    let a = manager.client("a").unwrap();
    tokio::time::timeout(Duration::from_secs(2), a.closed())
        .await
        .expect("server a should be detected as gone");

    let err = manager.call_tool("read_file", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::ServerNotConnected { ref name } if name == "a"));
    assert_eq!(tool_names(&manager), vec!["write_file"]);

    let statuses = manager.get_statuses();
    assert_eq!(statuses[0].name, "a");
    assert_eq!(statuses[0].status, ServerRunState::Stopped);
    assert!(statuses[0].tools.is_empty());
    assert_eq!(statuses[1].status, ServerRunState::Running);

    // The other server is unaffected.
    assert!(manager.call_tool("write_file", json!({})).await.is_ok());
    manager.disconnect_all().await;
}

#[tokio::test]
async fn disconnect_server_forgets_its_tools() {
    let manager = manager();
    manager
        .load_config(&config(&[
            ("a", mock("a", &["read_file"])),
            ("b", mock("b", &["write_file"])),
        ]))
        .await
        .unwrap();

    let a = manager.client("a").unwrap();
    assert!(manager.disconnect_server("a").await);
    assert!(!a.is_connected());

    assert_eq!(tool_names(&manager), vec!["write_file"]);
    let err = manager.call_tool("read_file", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::ToolNotFound { .. }));
    assert_eq!(manager.get_statuses().len(), 1);

    manager.disconnect_all().await;
    assert!(manager.get_statuses().is_empty());
    assert!(manager.get_all_tools().is_empty());
}
