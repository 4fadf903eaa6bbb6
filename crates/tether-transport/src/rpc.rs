//! JSON-RPC 2.0 envelopes for the MCP calls this client makes.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::ProtocolError;

/// MCP protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";
/// Name of the tool that lists and waits for messages.
pub const MESSAGES_TOOL: &str = "messages";

/// Outgoing request or notification.
#[derive(Clone, Debug, Serialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Request expecting a response.
    #[must_use]
    pub fn call(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    /// Fire-and-forget notification.
    #[must_use]
    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params: None,
        }
    }

    /// `initialize` handshake request.
    #[must_use]
    pub fn initialize(id: u64) -> Self {
        Self::call(
            id,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "tether",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    /// `tools/call` request.
    #[must_use]
    pub fn tool_call(id: u64, name: &str, arguments: Value) -> Self {
        Self::call(
            id,
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
    }
}

/// Incoming message. Requests and notifications from the server decode
/// with `id`/`result`/`error` absent and are skipped by the caller.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcResponse {
    /// Echoed request id.
    #[serde(default)]
    pub id: Option<Value>,
    /// Present only on server-initiated requests and notifications.
    #[serde(default)]
    pub method: Option<String>,
    /// Success payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error payload.
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// JSON-RPC error member.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcErrorBody {
    /// Error code.
    pub code: i64,
    /// Error message.
    #[serde(default)]
    pub message: String,
}

impl RpcResponse {
    /// Whether this response answers request `id`.
    #[must_use]
    pub fn answers(&self, id: u64) -> bool {
        if self.method.is_some() {
            return false;
        }
        match &self.id {
            Some(Value::Number(n)) => n.as_u64() == Some(id),
            Some(Value::String(s)) => s.parse::<u64>().ok() == Some(id),
            _ => false,
        }
    }

    /// The `result` member, or the `error` member as a [`ProtocolError`].
    pub fn into_result(self) -> Result<Value, ProtocolError> {
        if let Some(err) = self.error {
            return Err(ProtocolError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Find the response to `id` among decoded messages (a single object or a batch).
pub fn find_response(body: Value, id: u64) -> Result<RpcResponse, ProtocolError> {
    let messages = match body {
        Value::Array(items) => items,
        other => vec![other],
    };
    for message in messages {
        let resp: RpcResponse = serde_json::from_value(message)?;
        if resp.answers(id) {
            return Ok(resp);
        }
    }
    Err(ProtocolError::MissingResponse(id))
}

/// Unwrap a `tools/call` result into the tool's payload.
///
/// `structuredContent` wins; otherwise text content items are joined with
/// newlines and returned as a JSON string. `isError` results become
/// [`ProtocolError::Tool`].
pub fn tool_payload(result: Value) -> Result<Value, ProtocolError> {
    let texts = || -> String {
        result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|c| c.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|c| c.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    };

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(ProtocolError::Tool(texts()));
    }
    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    if result.get("content").is_some_and(Value::is_array) {
        return Ok(Value::String(texts()));
    }
    Ok(result)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
