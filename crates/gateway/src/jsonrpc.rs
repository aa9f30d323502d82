//! JSON-RPC 2.0 envelope types (§6 "Transport"). No framework precedent in
//! the teacher's stack for this wire shape (it speaks gRPC); these are plain
//! serde structs in the pack's general style of hand-rolled wire types.

use gateway_core::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One inbound JSON-RPC 2.0 request (HTTP body or one stdio line).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`; not enforced strictly, mirroring most JSON-RPC servers.
    #[serde(default)]
    pub jsonrpc: String,
    /// Method name: `initialize`, `tools/list`, `tools/call`.
    pub method: String,
    /// Method parameters, method-shaped.
    #[serde(default)]
    pub params: JsonValue,
    /// Echoed back on the response; absent on a notification.
    #[serde(default)]
    pub id: Option<JsonValue>,
}

/// One outbound JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Present on success, absent on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    /// Present on error, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Echoes the request's `id`.
    pub id: JsonValue,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// Standard or domain-specific (`-32000..-32099`) error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Extra structured detail (e.g. `pending_id` for `needs_approval`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl JsonRpcResponse {
    /// Build a success response for `id`.
    #[must_use]
    pub fn success(id: JsonValue, result: JsonValue) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }

    /// Build an error response for `id` from a [`GatewayError`], carrying any
    /// extra `data` (e.g. a pending approval id) alongside it.
    #[must_use]
    pub fn from_gateway_error(id: JsonValue, err: &GatewayError, data: Option<JsonValue>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError { code: err.json_rpc_code(), message: err.to_string(), data }),
            id,
        }
    }

    /// Build a bare parse/protocol error response (no request `id` was
    /// recoverable, so `id` is JSON `null` per the JSON-RPC 2.0 spec).
    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError { code: -32700, message: message.into(), data: None }),
            id: JsonValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_omits_error_field() {
        let resp = JsonRpcResponse::success(JsonValue::from(1), serde_json::json!({"ok": true}));
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("error").is_none());
        assert!(v.get("result").is_some());
    }

    #[test]
    fn gateway_error_carries_domain_code() {
        let resp = JsonRpcResponse::from_gateway_error(
            JsonValue::from(1),
            &GatewayError::BudgetExceeded,
            None,
        );
        assert_eq!(resp.error.unwrap().code, -32006);
    }
}
