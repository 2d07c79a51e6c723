//! JSON-RPC 2.0 message types
//!
//! Newline-delimited UTF-8 JSON on stdio or a Unix socket; the same
//! framing is used by the client host and the server facade.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

// Standard error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Application range: task not found / not terminal
pub const TASK_NOT_FOUND: i64 = -32001;
pub const TASK_NOT_READY: i64 = -32002;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    /// Absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn call(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
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

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any incoming frame before classification
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Frame {
    /// A frame without a method is a response to one of our requests.
    pub fn is_response(&self) -> bool {
        self.method.is_none()
    }

    pub fn into_response(self) -> Option<Response> {
        if !self.is_response() {
            return None;
        }
        Some(Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: self.id.unwrap_or(Value::Null),
            result: self.result,
            error: self.error,
        })
    }

    pub fn into_request(self) -> Option<Request> {
        let method = self.method?;
        Some(Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: self.id,
            method,
            params: self.params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_serialisation() {
        let request = Request::call(7, "tools/list", json!({}));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["id"], 7);
        assert_eq!(wire["method"], "tools/list");
    }

    #[test]
    fn test_notification_has_no_id() {
        let request = Request::notification("notifications/initialized", None);
        let wire = serde_json::to_string(&request).unwrap();
        assert!(!wire.contains("\"id\""));
        assert!(!wire.contains("\"params\""));
    }

    #[test]
    fn test_frame_classification() {
        let response: Frame =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap();
        assert!(response.is_response());
        assert!(response.into_response().is_some());

        let request: Frame =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":2,"method":"tools/call"}"#).unwrap();
        assert!(!request.is_response());
        assert_eq!(request.into_request().unwrap().method, "tools/call");
    }

    #[test]
    fn test_error_response() {
        let response = Response::failure(json!(3), METHOD_NOT_FOUND, "no such method");
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["error"]["code"], METHOD_NOT_FOUND);
        assert!(wire.get("result").is_none());
    }
}
