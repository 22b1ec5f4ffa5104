//! Client-facing JSON-RPC 2.0 message shapes. Distinct from [`acp_relay_core::jsonrpc`],
//! which only ever inspects opaque `serde_json::Value`s crossing the bridge —
//! these types are what the HTTP and WebSocket handlers build and parse at
//! the edge of the relay (§4.5, §4.6, §4.7).

use acp_relay_core::errors::jsonrpc_codes;
use acp_relay_core::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An incoming client request. `params` defaults to `Value::Null` so a
/// method with no parameters still parses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub result: Value,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result,
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: &'static str,
    pub error: JsonRpcErrorData,
    pub id: Value,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            error: JsonRpcErrorData {
                code,
                message: message.into(),
            },
            id,
        }
    }

    /// Build the caller-visible error for a [`RelayError`], using its own
    /// `code()` mapping (§7).
    pub fn from_relay_error(id: Value, err: &RelayError) -> Self {
        Self::new(id, err.code(), err.to_string())
    }

    pub fn invalid_params(id: Value, message: impl Into<String>) -> Self {
        Self::new(id, jsonrpc_codes::INVALID_PARAMS, message.into())
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::new(
            id,
            jsonrpc_codes::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    pub fn parse_error(id: Value, message: impl Into<String>) -> Self {
        Self::new(id, jsonrpc_codes::PARSE_ERROR, message.into())
    }

    pub fn internal_error(id: Value, message: impl Into<String>) -> Self {
        Self::new(id, jsonrpc_codes::INTERNAL_ERROR, message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_relay_core::errors::SessionError;
    use serde_json::json;

    #[test]
    fn relay_error_carries_its_own_code() {
        let err = RelayError::Session(SessionError::NotFound("sess_x".into()));
        let response = JsonRpcErrorResponse::from_relay_error(json!(7), &err);
        assert_eq!(response.error.code, jsonrpc_codes::SESSION_NOT_FOUND);
        assert_eq!(response.id, json!(7));
    }

    #[test]
    fn request_parses_with_missing_params() {
        let raw = r#"{"jsonrpc":"2.0","method":"session/list","id":1}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "session/list");
        assert!(req.params.is_null());
    }
}
