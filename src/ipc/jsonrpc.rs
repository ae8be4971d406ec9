//! JSON-RPC 2.0 envelopes shared by the client transports and the Core links.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes emitted by the Hub itself.
pub mod codes {
    /// Unknown method or unknown tool.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Core link terminated with the call outstanding.
    pub const LINK_CLOSED: i64 = -32000;
    /// Core did not answer before the call deadline.
    pub const BACKEND_TIMEOUT: i64 = -32001;
    /// Admission rejected (rate limit or per-connection concurrency).
    pub const TOO_MANY_REQUESTS: i64 = 429;
    /// Gated method not enabled.
    pub const FORBIDDEN: i64 = 403;
}

/// An outbound request carrying a numeric id.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// An outbound notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// A response envelope carrying either `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Read an error object a peer sent, tolerating missing or mistyped fields.
    ///
    /// A missing `code` becomes [`codes::INTERNAL_ERROR`]; a missing `message`
    /// becomes empty. A non-object error is carried as the message.
    pub fn from_value(raw: &Value) -> Self {
        let Some(object) = raw.as_object() else {
            let message = match raw {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            return Self::new(codes::INTERNAL_ERROR, message);
        };
        Self {
            code: object
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(codes::INTERNAL_ERROR),
            message: object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: object.get("data").cloned(),
        }
    }
}

/// Any message a peer may send, decoded loosely.
///
/// Requests carry `method`; responses carry `result` or `error`. Both shapes
/// share `id`, which clients may send as a number or a string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Incoming {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    /// Kept raw; see [`RpcError::from_value`].
    #[serde(default)]
    pub error: Option<Value>,
}

impl Incoming {
    /// Numeric id of a response addressed to one of our requests.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_u64)
    }
}
