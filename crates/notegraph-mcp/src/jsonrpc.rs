//! JSON-RPC 2.0 types for MCP communication.

use crate::error::McpError;
use serde::{Deserialize, Serialize};

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A request id. We only issue positive numeric ids, but servers may echo
/// them back as strings and may use any id form for their own requests,
/// which is why non-integer ids are kept verbatim rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    Other(serde_json::Value),
}

impl RequestId {
    /// The value of this id as one of our own request ids, if it can be one.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => u64::try_from(*n).ok(),
            RequestId::String(s) => s.parse().ok(),
            RequestId::Other(_) => None,
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn version() -> String {
    "2.0".to_string()
}

impl JsonRpcResponse {
    /// A successful reply to a server-initiated request.
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: version(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// An error reply to a server-initiated request.
    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: version(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Convert into the call outcome seen by the requester.
    pub fn into_result(self, server: &str) -> Result<serde_json::Value, McpError> {
        match self.error {
            Some(err) => Err(McpError::JsonRpc {
                server: server.to_string(),
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// Any message a server can write to its stdout.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Response(JsonRpcResponse),
    Request {
        id: RequestId,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Parse and classify one line of server output.
    pub fn parse(line: &str) -> Result<Self, McpError> {
        let raw: RawMessage = serde_json::from_str(line)?;
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(JsonRpcMessage::Request {
                id,
                method,
                params: raw.params,
            }),
            (Some(method), None) => Ok(JsonRpcMessage::Notification {
                method,
                params: raw.params,
            }),
            (None, id) if id.is_some() || raw.result.is_some() || raw.error.is_some() => {
                Ok(JsonRpcMessage::Response(JsonRpcResponse {
                    jsonrpc: version(),
                    id,
                    result: raw.result,
                    error: raw.error,
                }))
            }
            _ => Err(McpError::Protocol(
                "message is neither a request, notification nor response".to_string(),
            )),
        }
    }
}
