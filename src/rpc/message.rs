//! JSON bodies carried inside NRPC frames.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome code of a call as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum RpcStatus {
    Ok,
    BadRequest,
    NoSuchService,
    NoSuchMethod,
    ServerError,
    Timeout,
}

impl RpcStatus {
    pub fn code(&self) -> u16 {
        match self {
            RpcStatus::Ok => 200,
            RpcStatus::BadRequest => 400,
            RpcStatus::NoSuchService => 404,
            RpcStatus::NoSuchMethod => 405,
            RpcStatus::ServerError => 500,
            RpcStatus::Timeout => 504,
        }
    }
}

impl From<RpcStatus> for u16 {
    fn from(status: RpcStatus) -> u16 {
        status.code()
    }
}

impl TryFrom<u16> for RpcStatus {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(RpcStatus::Ok),
            400 => Ok(RpcStatus::BadRequest),
            404 => Ok(RpcStatus::NoSuchService),
            405 => Ok(RpcStatus::NoSuchMethod),
            500 => Ok(RpcStatus::ServerError),
            504 => Ok(RpcStatus::Timeout),
            other => Err(format!("unknown status code {}", other)),
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Body of a `Request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_mapping_name: String,
    #[serde(default)]
    pub version: String,
    pub method_name: String,
    /// Arguments keyed by parameter name.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Deadline the client applies, in the signed-milliseconds convention.
    #[serde(default)]
    pub timeout_ms: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attachments: HashMap<String, String>,
}

/// Body of a `Response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: RpcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl RpcResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            status: RpcStatus::Ok,
            message: None,
            data,
        }
    }

    pub fn error(status: RpcStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            data: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_is_numeric_on_the_wire() {
        let body = serde_json::to_value(RpcResponse::error(RpcStatus::NoSuchMethod, "nope")).unwrap();
        assert_eq!(body, json!({"status": 405, "message": "nope", "data": null}));

        let parsed: RpcResponse = serde_json::from_value(json!({"status": 200, "data": "hi"})).unwrap();
        assert_eq!(parsed, RpcResponse::ok(json!("hi")));

        assert!(serde_json::from_value::<RpcResponse>(json!({"status": 299})).is_err());
    }

    #[test]
    fn request_defaults() {
        let parsed: RpcRequest =
            serde_json::from_value(json!({"request_mapping_name": "_ping", "method_name": "ping"})).unwrap();
        assert!(parsed.args.is_empty());
        assert_eq!(parsed.timeout_ms, 0);
        assert_eq!(parsed.version, "");
    }
}
