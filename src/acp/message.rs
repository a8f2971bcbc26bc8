//! JSON-RPC 2.0 message model.
//!
//! `Message` is a closed variant validated at the decode boundary: whether a
//! frame is a request, a response or a notification is decided once, from the
//! presence of `id` / `method` / `result` / `error`, and nothing downstream
//! looks at the raw envelope again.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::acp::error::AcpError;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used by the client side.
pub mod codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Application-defined: the user declined a tool call.
    pub const REQUEST_REJECTED: i64 = -32001;
}

/// Request identifier.
///
/// Ids we assign are always positive integers. Agents may use strings for
/// the requests they initiate, so both forms are accepted inbound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// A JSON-RPC error object: `{code?, message, data?, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Non-standard members some agents add (e.g. `status`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            data: None,
            extra: Map::new(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (code {code})")?;
        }
        if let Some(data) = &self.data {
            match data {
                Value::String(s) => write!(f, ": {s}")?,
                other => write!(f, ": {other}")?,
            }
        }
        if !self.extra.is_empty() {
            write!(f, " {}", Value::Object(self.extra.clone()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// One wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Message::Request(Request {
            id: RequestId::Number(id),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, outcome: Result<Value, RpcError>) -> Self {
        Message::Response(Response { id, outcome })
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    /// Render the wire envelope.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(r) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": r.id,
                "method": r.method,
                "params": r.params,
            }),
            Message::Notification(n) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": n.method,
                "params": n.params,
            }),
            Message::Response(r) => match &r.outcome {
                Ok(result) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "result": result,
                }),
                Err(error) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "error": error,
                }),
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AcpError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    /// Parse one JSON payload into a `Message`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AcpError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| AcpError::Protocol(format!("invalid JSON: {e}")))?;
        Message::try_from(value)
    }
}

/// Envelope as it appears on the wire, before classification.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Distinguishes `"result": null` (present) from an absent `result`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<Value> for Message {
    type Error = AcpError;

    fn try_from(value: Value) -> Result<Self, AcpError> {
        if !value.is_object() {
            return Err(AcpError::Protocol(format!(
                "expected a JSON object, got {value}"
            )));
        }
        let raw: RawMessage = serde_json::from_value(value)
            .map_err(|e| AcpError::Protocol(format!("malformed envelope: {e}")))?;

        if let Some(version) = raw.jsonrpc.as_deref() {
            if version != JSONRPC_VERSION {
                return Err(AcpError::Protocol(format!(
                    "unsupported jsonrpc version {version:?}"
                )));
            }
        }

        let params = raw.params.unwrap_or(Value::Null);
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Message::Request(Request { id, method, params })),
            (None, Some(method)) => Ok(Message::Notification(Notification { method, params })),
            (Some(id), None) => match (raw.result, raw.error) {
                (_, Some(error)) => Ok(Message::response(id, Err(error))),
                (Some(result), None) => Ok(Message::response(id, Ok(result))),
                (None, None) => Err(AcpError::Protocol(format!(
                    "response {id} carries neither result nor error"
                ))),
            },
            (None, None) => match raw.error {
                Some(error) => Err(AcpError::Protocol(format!(
                    "uncorrelated error response: {error}"
                ))),
                None => Err(AcpError::Protocol(
                    "message has neither id nor method".to_string(),
                )),
            },
        }
    }
}
