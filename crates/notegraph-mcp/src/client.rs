//! MCP client for a single server connection.
//!
//! Handles readiness detection, the MCP protocol handshake (initialize +
//! initialized notification), tool discovery (tools/list), and tool
//! invocation (tools/call). All lifecycle changes go through the
//! [`ConnectionState`] transition table.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
    RequestId,
};
use crate::pending::{Delivery, PendingCalls, Registration};
use crate::retry::RetryPolicy;
use crate::state::{ConnectionState, DisconnectReason, StateEvent};
use crate::transport::{StdioTransport, TransportEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Timing and identity settings shared by every connection.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Default per-request timeout; a server's `timeoutMs` overrides it.
    pub request_timeout: Duration,
    /// Upper bound on the whole spawn-to-ready phase.
    pub startup_timeout: Duration,
    /// How long to wait for any sign of life before assuming the server is
    /// ready anyway. Servers are not required to print anything before their
    /// first response, so this is a heuristic.
    pub ready_fallback: Duration,
    /// Retry policy for the `initialize` request.
    pub initialize_retry: RetryPolicy,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(30_000),
            startup_timeout: Duration::from_millis(30_000),
            ready_fallback: Duration::from_millis(2_000),
            initialize_retry: RetryPolicy::linear(3, Duration::from_millis(1_000)),
            client_name: "notegraph".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Information about a tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Identity a server reported in its `initialize` result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// A content item in a tool result.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum McpToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Resources, audio and anything newer; still present in the raw result.
    #[serde(other)]
    Other,
}

/// Result of calling a tool on an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolResult {
    pub content: Vec<McpToolContent>,
    pub is_error: bool,
    /// The `result` object exactly as the server sent it.
    pub raw: serde_json::Value,
}

impl McpToolResult {
    fn from_value(raw: serde_json::Value) -> Result<Self, McpError> {
        let parsed: ToolCallResult = serde_json::from_value(raw.clone())
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))?;
        Ok(Self {
            content: parsed.content,
            is_error: parsed.is_error,
            raw,
        })
    }

    pub fn is_success(&self) -> bool {
        !self.is_error
    }

    /// All text parts joined by newlines, or the raw result serialized as
    /// JSON when there are none.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| match c {
                McpToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            self.raw.to_string()
        } else {
            parts.join("\n")
        }
    }
}

/// Deserialization helpers for MCP protocol messages.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsListResult {
    tools: Vec<McpToolInfo>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ToolCallResult {
    #[serde(default)]
    content: Vec<McpToolContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    server_info: Option<ServerInfo>,
}

#[derive(Debug, Default)]
struct Details {
    tools: Vec<McpToolInfo>,
    server_info: Option<ServerInfo>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
}

/// State shared between the client handle and its event pump.
struct Shared {
    name: String,
    transport: StdioTransport,
    state: watch::Sender<ConnectionState>,
    pending: Mutex<PendingCalls>,
    details: std::sync::Mutex<Details>,
    request_timeout: Duration,
    /// Set once the process has shown a readiness signal, even if it has
    /// exited since.
    became_ready: AtomicBool,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn details(&self) -> MutexGuard<'_, Details> {
        self.details.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disconnected(&self) -> McpError {
        McpError::Disconnected {
            name: self.name.clone(),
        }
    }

    /// Apply `event` to the state machine. Returns whether the state changed.
    fn advance(&self, event: StateEvent) -> bool {
        self.state.send_if_modified(|state| match state.next(event) {
            Some(next) => {
                tracing::debug!("MCP server '{}': {} -> {}", self.name, state, next);
                if next == ConnectionState::Ready {
                    self.became_ready.store(true, Ordering::SeqCst);
                }
                *state = next;
                true
            }
            None => false,
        })
    }

    /// Enter `Disconnected`: reject every pending call, forget tools, and
    /// kill the process. Later calls are no-ops.
    async fn close(&self, reason: DisconnectReason) {
        if !self.advance(StateEvent::Closed) {
            return;
        }
        if reason.is_failure() {
            tracing::warn!("MCP server '{}' disconnected: {}", self.name, reason);
        } else {
            tracing::info!("MCP server '{}' disconnected", self.name);
        }
        {
            let mut details = self.details();
            details.tools.clear();
            if reason.is_failure() {
                details.last_error = Some(reason.to_string());
            }
        }
        let drained = self.pending.lock().await.close();
        for call in drained {
            call.settle(Err(self.disconnected()));
        }
        self.transport.kill();
    }

    /// Send one request and wait for its response, without retries.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let (id, rx) = {
            let mut pending = self.pending.lock().await;
            let (id, rx) = match pending.register(method) {
                Some(Registration::Waiting(id, rx)) => (id, rx),
                Some(Registration::Answered(id, outcome)) => {
                    tracing::debug!(
                        "MCP server '{}' answered '{}' (id {}) before it was sent",
                        self.name,
                        method,
                        id
                    );
                    return outcome;
                }
                None => return Err(self.disconnected()),
            };
            let line = match serde_json::to_string(&JsonRpcRequest::new(id, method, params)) {
                Ok(line) => line,
                Err(e) => {
                    pending.take(id);
                    return Err(e.into());
                }
            };
            // If the writer is gone the process is going too; the call stays
            // registered so a response already on its way can still settle it.
            if !self.transport.send(line) {
                tracing::debug!(
                    "MCP server '{}': '{}' (id {}) could not be written",
                    self.name,
                    method,
                    id
                );
            }
            (id, rx)
        };

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.disconnected()),
            Err(_) => {
                self.pending.lock().await.take(id);
                Err(McpError::Timeout {
                    name: self.name.clone(),
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a request under `policy`. Returns the number of attempts made
    /// alongside the final outcome.
    async fn request_with_retry(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        policy: &RetryPolicy,
    ) -> (u32, Result<serde_json::Value, McpError>) {
        let mut attempt = 1;
        loop {
            match self.request(method, params.clone()).await {
                Ok(value) => return (attempt, Ok(value)),
                Err(e) if attempt < policy.max_attempts && e.is_retryable() => {
                    let delay = policy.delay_after(attempt);
                    tracing::warn!(
                        "MCP server '{}': '{}' attempt {}/{} failed: {}; retrying in {:?}",
                        self.name,
                        method,
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return (attempt, Err(e)),
            }
        }
    }

    fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        if self.transport.send(line) {
            Ok(())
        } else {
            Err(self.disconnected())
        }
    }

    async fn handle_message(&self, msg: JsonRpcMessage) {
        match msg {
            JsonRpcMessage::Response(resp) => {
                let Some(id) = resp.id.as_ref().and_then(RequestId::as_number) else {
                    tracing::warn!(
                        "Ignoring response without a usable id from MCP server '{}': {:?}",
                        self.name,
                        resp.error
                    );
                    return;
                };
                // Until the handshake is done a server may answer before we
                // have asked; hold such answers for the request they match.
                let buffer_early = matches!(
                    self.state(),
                    ConnectionState::Spawning | ConnectionState::Ready | ConnectionState::Initializing
                );
                let outcome = resp.into_result(&self.name);
                match self.pending.lock().await.deliver(id, outcome, buffer_early) {
                    Delivery::Settled => {
                        tracing::debug!("MCP server '{}' answered id {}", self.name, id);
                    }
                    Delivery::Buffered => tracing::debug!(
                        "Holding early response id {} from MCP server '{}'",
                        id,
                        self.name
                    ),
                    Delivery::Unmatched => tracing::debug!(
                        "Ignoring response for unknown request id {} from MCP server '{}'",
                        id,
                        self.name
                    ),
                }
            }
            JsonRpcMessage::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    JsonRpcResponse::success(id, serde_json::json!({}))
                } else {
                    tracing::debug!(
                        "Rejecting '{}' request from MCP server '{}'",
                        method,
                        self.name
                    );
                    JsonRpcResponse::failure(
                        id,
                        METHOD_NOT_FOUND,
                        format!("Method not found: {method}"),
                    )
                };
                match serde_json::to_string(&reply) {
                    Ok(line) => {
                        self.transport.send(line);
                    }
                    Err(e) => tracing::warn!("Failed to serialize reply: {e}"),
                }
            }
            JsonRpcMessage::Notification { method, .. } => {
                tracing::debug!("Notification '{}' from MCP server '{}'", method, self.name);
            }
        }
    }
}

/// Feed transport events into the state machine until the transport is gone.
async fn pump_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::OutputSeen => {
                shared.advance(StateEvent::OutputSeen);
            }
            TransportEvent::ReadyKeyword => {
                shared.advance(StateEvent::ReadyKeyword);
            }
            TransportEvent::Message(msg) => shared.handle_message(msg).await,
            TransportEvent::StdoutClosed => shared.close(DisconnectReason::StdoutClosed).await,
            TransportEvent::Exited(code) => shared.close(DisconnectReason::Exited(code)).await,
            TransportEvent::Failed(e) => shared.close(DisconnectReason::Transport(e)).await,
        }
    }
    shared
        .close(DisconnectReason::Transport("event stream ended".to_string()))
        .await;
}

async fn wait_while_spawning(mut rx: watch::Receiver<ConnectionState>) -> ConnectionState {
    match rx.wait_for(|s| *s != ConnectionState::Spawning).await {
        Ok(state) => *state,
        Err(_) => ConnectionState::Disconnected,
    }
}

/// Client for a single MCP server.
pub struct McpClient {
    shared: Arc<Shared>,
    instance_id: Uuid,
    pid: Option<u32>,
}

impl McpClient {
    /// Connect to an MCP server: spawn, wait for readiness, handshake,
    /// discover tools. On any failure the process is killed.
    pub async fn connect(
        name: String,
        config: &McpServerConfig,
        options: &ClientOptions,
    ) -> Result<Self, McpError> {
        let (transport, events) = StdioTransport::spawn(&name, config)?;
        let pid = transport.pid();
        let request_timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(options.request_timeout);

        let (state, _) = watch::channel(ConnectionState::Spawning);
        let shared = Arc::new(Shared {
            name,
            transport,
            state,
            pending: Mutex::new(PendingCalls::new()),
            details: std::sync::Mutex::new(Details::default()),
            request_timeout,
            became_ready: AtomicBool::new(false),
        });
        tokio::spawn(pump_events(Arc::clone(&shared), events));

        let client = Self {
            shared,
            instance_id: Uuid::new_v4(),
            pid,
        };

        if let Err(e) = client.establish(options).await {
            client
                .shared
                .close(DisconnectReason::ConnectFailed(e.to_string()))
                .await;
            return Err(e);
        }
        Ok(client)
    }

    async fn establish(&self, options: &ClientOptions) -> Result<(), McpError> {
        let name = &self.shared.name;
        self.wait_until_ready(options).await?;

        // Runs even if the server exited after becoming ready: answers it wrote
        // before exiting still count, and the first unanswerable request
        // reports the loss.
        self.shared.advance(StateEvent::HandshakeStarted);

        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": options.client_name,
                "version": options.client_version,
            }
        });
        let (attempts, outcome) = self
            .shared
            .request_with_retry("initialize", Some(init_params), &options.initialize_retry)
            .await;
        let init = outcome.map_err(|e| McpError::HandshakeFailed {
            name: name.clone(),
            attempts,
            source: Box::new(e),
        })?;

        let init: InitializeResult = serde_json::from_value(init).unwrap_or_else(|e| {
            tracing::warn!("MCP server '{}' sent an unexpected initialize result: {e}", name);
            InitializeResult::default()
        });
        if let Some(info) = &init.server_info {
            tracing::info!(
                "MCP server '{}' is {} {} (protocol {})",
                name,
                info.name,
                info.version,
                init.protocol_version.as_deref().unwrap_or("unknown")
            );
        }

        if let Err(e) = self.shared.notify("notifications/initialized", None) {
            tracing::debug!("MCP server '{}' missed the initialized notification: {}", name, e);
        }

        let completed = self.shared.advance(StateEvent::HandshakeCompleted);
        {
            let mut details = self.shared.details();
            details.server_info = init.server_info;
            if completed {
                details.connected_at = Some(Utc::now());
            }
        }

        let tools = self
            .discover_tools()
            .await
            .map_err(|e| McpError::DiscoveryFailed {
                name: name.clone(),
                source: Box::new(e),
            })?;
        let count = tools.len();
        self.shared.details().tools = tools;
        if !self.is_connected() {
            self.shared.details().tools.clear();
            return Err(self.shared.disconnected());
        }

        tracing::info!("MCP server '{}' connected with {} tools", name, count);
        Ok(())
    }

    /// Race the three readiness signals: output on stdout, a keyword on
    /// stderr, or the fallback delay. The first one wins; the process
    /// exiting first fails the connect.
    async fn wait_until_ready(&self, options: &ClientOptions) -> Result<(), McpError> {
        let name = &self.shared.name;
        let rx = self.shared.state.subscribe();
        let signalled = async {
            tokio::select! {
                state = wait_while_spawning(rx) => state,
                () = tokio::time::sleep(options.ready_fallback) => {
                    tracing::debug!(
                        "MCP server '{}' silent after {:?}, assuming ready",
                        name,
                        options.ready_fallback
                    );
                    self.shared.advance(StateEvent::FallbackElapsed);
                    self.shared.state()
                }
            }
        };

        match tokio::time::timeout(options.startup_timeout, signalled).await {
            Ok(ConnectionState::Disconnected)
                if !self.shared.became_ready.load(Ordering::SeqCst) =>
            {
                Err(McpError::StartupFailed {
                    name: name.clone(),
                    reason: self
                        .last_error()
                        .unwrap_or_else(|| "process exited before becoming ready".to_string()),
                })
            }
            Ok(_) => Ok(()),
            Err(_) => Err(McpError::StartupTimeout {
                name: name.clone(),
                timeout_ms: options.startup_timeout.as_millis() as u64,
            }),
        }
    }

    /// Fetch every page of `tools/list`.
    async fn discover_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
            let result = self.shared.request("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(result).map_err(|e| {
                McpError::Protocol(format!("Failed to parse tools/list response: {e}"))
            })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    /// Call a tool on this server.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<McpToolResult, McpError> {
        if !self.is_connected() {
            return Err(McpError::ServerNotConnected {
                name: self.shared.name.clone(),
            });
        }
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self.shared.request("tools/call", Some(params)).await?;
        McpToolResult::from_value(result)
    }

    /// Send an arbitrary request, retrying according to `policy`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        policy: &RetryPolicy,
    ) -> Result<serde_json::Value, McpError> {
        self.shared.request_with_retry(method, params, policy).await.1
    }

    /// Get the tools exposed by this server. Empty once disconnected.
    pub fn tools(&self) -> Vec<McpToolInfo> {
        self.shared.details().tools.clone()
    }

    /// Get the server name.
    pub fn server_name(&self) -> &str {
        &self.shared.name
    }

    /// Unique id of this connection; a reconnect gets a new one.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.details().server_info.clone()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.shared.details().connected_at
    }

    /// Why the connection last failed, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.shared.details().last_error.clone()
    }

    /// Resolves once the connection has reached `Disconnected`.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Shut down the server connection.
    pub async fn disconnect(&self) {
        self.shared.close(DisconnectReason::Requested).await;
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.shared.transport.kill();
    }
}
