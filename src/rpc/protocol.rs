//! JSON-RPC 2.0 protocol types.
//!
//! Implements the JSON-RPC 2.0 specification for request/response messaging,
//! plus the notification used to stream partial output of a call.
//! See: https://www.jsonrpc.org/specification

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::engine::UserInfo;

/// JSON-RPC 2.0 request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be exactly "2.0"
    pub jsonrpc: String,
    /// Procedure name to invoke
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Request identifier. If None, this is a notification (no response expected).
    #[serde(default)]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response object. Always the last message of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    /// Result on success (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Echoed from the request
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-to-client message without an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Anything a server writes on a connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
}

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Server-defined error codes
pub const QUERY_FAILED: i32 = -32000;
pub const SHUTTING_DOWN: i32 = -32001;

/// Method of the notification carrying one chunk of partial output.
pub const PROGRESS_METHOD: &str = "query.progress";

/// Parameters of the `query` procedure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryParams {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    /// Output format, TabSeparated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub settings: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    /// Milliseconds between output blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive_delay: Option<u64>,
}

impl QueryParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// Terminal success payload of the `query` procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub query_id: String,
    /// Output not already sent as progress
    pub output: String,
    pub progress_messages: u64,
}

/// Params of a progress notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    /// Id of the request this output belongs to
    pub id: Value,
    /// 1-based position among this call's progress messages
    pub seq: u64,
    pub output: String,
}

/// `data` of an error that ends a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallErrorData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    pub progress_messages: u64,
}

impl Response {
    /// Create a success response with the given result.
    pub fn success(id: Value, result: impl Serialize) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn error_with_data(
        id: Value,
        code: i32,
        message: impl Into<String>,
        data: impl Serialize,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            }),
            id,
        }
    }

    /// Create a parse error response (used when request ID is unknown).
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn shutting_down(id: Value) -> Self {
        Self::error(id, SHUTTING_DOWN, "Server is shutting down")
    }
}

impl Notification {
    pub fn progress(id: Value, seq: u64, output: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: PROGRESS_METHOD.to_string(),
            params: Some(serde_json::to_value(Progress { id, seq, output }).unwrap_or(Value::Null)),
        }
    }
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Check if this request is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Validate the request conforms to JSON-RPC 2.0.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_request() {
        let json = r#"{"jsonrpc":"2.0","method":"query","params":{"query":"SELECT 1","query_id":"123"},"id":1}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert_eq!(req.method, "query");
        assert_eq!(req.id, Some(Value::Number(1.into())));
        assert!(req.validate().is_ok());

        let params: QueryParams = serde_json::from_value(req.params.unwrap()).unwrap();
        assert_eq!(params.query, "SELECT 1");
        assert_eq!(params.query_id.as_deref(), Some("123"));
        assert!(params.settings.is_empty());
    }

    #[test]
    fn test_parse_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert!(req.is_notification());
        assert!(req.params.is_none());
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let req = Request {
            jsonrpc: "1.0".into(),
            method: "query".into(),
            params: None,
            id: Some(Value::Null),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_serialize_error_response() {
        let resp = Response::method_not_found(Value::String("abc".into()), "unknown.method");
        let json = serde_json::to_string(&resp).unwrap();

        assert!(json.contains(r#""code":-32601"#));
        assert!(json.contains("Method not found"));
        assert!(!json.contains("result"));
    }

    #[test]
    fn test_server_message_discriminates() {
        let progress = serde_json::to_string(&Notification::progress(
            Value::Number(7.into()),
            1,
            "0\n1".into(),
        ))
        .unwrap();
        let ServerMessage::Notification(notification) =
            serde_json::from_str(&progress).unwrap()
        else {
            panic!("expected a notification");
        };
        assert_eq!(notification.method, PROGRESS_METHOD);
        let params: Progress = serde_json::from_value(notification.params.unwrap()).unwrap();
        assert_eq!(params.seq, 1);
        assert_eq!(params.output, "0\n1");

        let done = serde_json::to_string(&Response::success(Value::Number(7.into()), "ok")).unwrap();
        assert!(matches!(
            serde_json::from_str(&done).unwrap(),
            ServerMessage::Response(_)
        ));
    }

    #[test]
    fn test_query_params_skip_defaults() {
        let json = serde_json::to_string(&QueryParams::new("SELECT 1")).unwrap();
        assert_eq!(json, r#"{"query":"SELECT 1"}"#);
    }
}
