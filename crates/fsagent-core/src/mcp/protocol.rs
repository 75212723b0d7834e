//! Wire protocol for the tool-server subprocess.
//!
//! The server speaks line-delimited JSON-RPC 2.0 over stdio, as defined
//! by the MCP stdio transport. The framing here is an external contract:
//! one JSON object per line, requests correlated by numeric id, and
//! id-less notifications in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
/// Protocol revision sent during the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";

/// An outgoing request with a correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// An outgoing notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
}

impl Notification {
    pub fn initialized() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: NOTIFICATION_INITIALIZED.to_string(),
        }
    }
}

/// Error object inside a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A single incoming message: a correlated response or a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Incoming {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Incoming {
    /// Parses one line of server output.
    ///
    /// # Errors
    /// Returns the serde error when the line is not a JSON object.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// True for server-initiated notifications (no correlation id).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Builds the `initialize` request params.
pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        },
    })
}

/// Builds the `tools/call` params for one invocation.
pub fn call_tool_params(name: &str, arguments: &Value) -> Value {
    serde_json::json!({
        "name": name,
        "arguments": arguments,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Requests serialize to the exact wire shape the server expects.
    #[test]
    fn test_request_wire_shape() {
        let request = Request::new(3, METHOD_CALL_TOOL, Some(call_tool_params(
            "list_directory",
            &json!({"path": "/tmp"}),
        )));

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 3);
        assert_eq!(value["method"], "tools/call");
        assert_eq!(value["params"]["name"], "list_directory");
        assert_eq!(value["params"]["arguments"]["path"], "/tmp");
    }

    /// Params are omitted entirely when absent, not serialized as null.
    #[test]
    fn test_request_without_params_omits_key() {
        let request = Request::new(2, METHOD_LIST_TOOLS, None);
        let raw = serde_json::to_string(&request).unwrap();
        assert!(!raw.contains("params"));
    }

    /// Result and error responses both parse; notifications have no id.
    #[test]
    fn test_incoming_parse_variants() {
        let ok = Incoming::parse(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(ok.id, Some(1));
        assert!(ok.result.is_some());
        assert!(!ok.is_notification());

        let err =
            Incoming::parse(r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no"}}"#)
                .unwrap();
        assert_eq!(err.error.as_ref().unwrap().code, -32601);

        let note = Incoming::parse(
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#,
        )
        .unwrap();
        assert!(note.is_notification());
    }
}
