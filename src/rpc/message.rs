//! JSON-RPC 2.0 message representations and formatting utilities.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{AppError, Result};

/// JSON-RPC parse error code.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC invalid request code.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC method-not-found code.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC invalid params code.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC internal error code.
pub const INTERNAL_ERROR: i64 = -32603;

/// An incoming JSON-RPC request or notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcRequest {
    /// Protocol version marker; always `"2.0"`.
    pub jsonrpc: String,
    /// Request id; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Parse a request from a raw body.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` when the body is not a well-formed
    /// JSON-RPC request object.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|err| AppError::Rpc(format!("malformed JSON-RPC body: {err}")))?;
        if request.jsonrpc != "2.0" {
            return Err(AppError::Rpc(format!(
                "unsupported jsonrpc version: {}",
                request.jsonrpc
            )));
        }
        Ok(request)
    }

    /// Whether this is a notification (no id, no reply expected).
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Request id rendered as a string, for bookkeeping keys.
    #[must_use]
    pub fn id_key(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The `progressToken` from `params._meta`, when the client asked
    /// for progress reporting.
    #[must_use]
    pub fn progress_token(&self) -> Option<Value> {
        self.params
            .as_ref()
            .and_then(|params| params.get("_meta"))
            .and_then(|meta| meta.get("progressToken"))
            .cloned()
    }
}

/// Build a JSON-RPC success response.
#[must_use]
pub fn result_response(id: Option<&Value>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build a JSON-RPC error response.
#[must_use]
pub fn error_response(id: Option<&Value>, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Build a JSON-RPC notification.
#[must_use]
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Whether a serialized message carries an `error` member.
#[must_use]
pub fn is_error(value: &Value) -> bool {
    value.get("error").is_some()
}
