//! JSON-RPC 2.0 codec for the Agent Client Protocol
//!
//! Pure (de)serialization with no knowledge of transport or semantics.
//! Encodes outbound requests/notifications/responses and classifies inbound
//! messages by field presence. Outbound request ids are monotonically
//! increasing integers; inbound ids (when the agent issues a request to us)
//! are treated as opaque JSON values and echoed back verbatim.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Standard JSON-RPC 2.0 error codes.
pub mod codes {
    /// Invalid JSON was received by the server.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;

    // ACP-specific capability codes, outside the reserved standard range.

    /// An operation exceeded its deadline.
    pub const TIMED_OUT: i64 = -32000;
    /// A referenced resource (file, terminal id) does not exist.
    pub const NOT_FOUND: i64 = -32001;
    /// The resource exists but has the wrong type (e.g. path is a directory).
    pub const WRONG_TYPE: i64 = -32002;
    /// The operating system denied access to the resource.
    pub const PERMISSION_DENIED: i64 = -32003;
    /// File content is not valid text.
    pub const ENCODING_ERROR: i64 = -32004;
}

/// A JSON-RPC error object, carried in error responses and surfaced by
/// capability handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    /// Numeric error code (standard JSON-RPC or ACP-specific).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error with a code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Shorthand for an invalid-params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    /// Shorthand for a method-not-found error.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// A classified inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Peer-initiated request: has both `method` and `id`. The id is an
    /// opaque token that must be echoed back in the response untouched.
    Request {
        /// Opaque request id from the peer.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters (object or null).
        params: Value,
    },
    /// Notification: has `method` but no `id`. Never receives a reply.
    Notification {
        /// Method name.
        method: String,
        /// Parameters (object or null).
        params: Value,
    },
    /// Successful response to one of our requests.
    Response {
        /// The id of the request being answered.
        id: Value,
        /// Result payload.
        result: Value,
    },
    /// Error response to one of our requests.
    Error {
        /// The id of the request being answered (may be null for
        /// request-independent errors).
        id: Value,
        /// The error object.
        error: RpcError,
    },
    /// Input that is not valid JSON or not a recognizable JSON-RPC shape.
    /// Classified rather than raised so the read loop can skip and continue.
    Malformed {
        /// Why classification failed.
        reason: String,
    },
}

/// Classify a single newline-delimited message.
///
/// Classification is by field presence: `{method, id}` is a request,
/// `{method}` without id is a notification, `{id, result}` is a response,
/// `{id, error}` is an error response. Anything else is `Malformed`.
#[must_use]
pub fn decode(line: &str) -> Message {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Message::Malformed {
                reason: format!("invalid JSON: {e}"),
            }
        }
    };

    let Some(obj) = value.as_object() else {
        return Message::Malformed {
            reason: "not a JSON object".to_string(),
        };
    };

    let method = obj.get("method").and_then(Value::as_str);
    let has_id = obj.contains_key("id");

    if let Some(method) = method {
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if has_id {
            return Message::Request {
                id: obj["id"].clone(),
                method: method.to_string(),
                params,
            };
        }
        return Message::Notification {
            method: method.to_string(),
            params,
        };
    }

    if has_id {
        if let Some(error) = obj.get("error") {
            return match serde_json::from_value::<RpcError>(error.clone()) {
                Ok(error) => Message::Error {
                    id: obj["id"].clone(),
                    error,
                },
                Err(e) => Message::Malformed {
                    reason: format!("malformed error object: {e}"),
                },
            };
        }
        if let Some(result) = obj.get("result") {
            return Message::Response {
                id: obj["id"].clone(),
                result: result.clone(),
            };
        }
    }

    Message::Malformed {
        reason: "no method, result, or error field".to_string(),
    }
}

/// Allocator for outbound request ids.
///
/// Ids start at 1 and are never reused within a transport client's lifetime.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: AtomicU64,
}

impl RequestIds {
    /// Create an allocator starting at id 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Encode a request, allocating the next id. Returns the id and the
    /// serialized message (no trailing newline).
    pub fn encode_request(&self, method: &str, params: &Value) -> (u64, String) {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        (id, message.to_string())
    }
}

/// Encode a notification. The id field is absent, always — that is what
/// distinguishes it from a request on the wire.
#[must_use]
pub fn encode_notification(method: &str, params: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Encode a successful response to a peer request, echoing its id verbatim.
#[must_use]
pub fn encode_response(id: &Value, result: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
    .to_string()
}

/// Encode an error response to a peer request, echoing its id verbatim.
#[must_use]
pub fn encode_error_response(id: &Value, error: &RpcError) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
    .to_string()
}
