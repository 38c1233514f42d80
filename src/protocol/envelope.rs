//! Envelope types: the JSON unit exchanged over every transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Request ID (can be string or number).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

/// A wire-level error attached to a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The JSON unit exchanged over any transport.
///
/// Exactly one of `method` (request/notification) or `result`/`error`
/// (response) is present on a valid envelope. A missing `id` marks a
/// notification: no response is expected or produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Classification of an envelope after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Notification,
    Response,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Default::default()
        }
    }

    /// Build a notification envelope (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Default::default()
        }
    }

    /// Build a success response correlated to `id`.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Default::default()
        }
    }

    /// Build an error response correlated to `id`.
    pub fn error_response(id: RequestId, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            ..Default::default()
        }
    }

    /// Classify the envelope, rejecting shapes the protocol forbids.
    pub fn kind(&self) -> Result<EnvelopeKind> {
        let has_body = self.result.is_some() || self.error.is_some();
        match (&self.method, has_body) {
            (Some(_), false) => Ok(if self.id.is_some() {
                EnvelopeKind::Request
            } else {
                EnvelopeKind::Notification
            }),
            (None, true) => Ok(EnvelopeKind::Response),
            (Some(_), true) => Err(Error::Protocol(
                "envelope carries both method and result/error".to_string(),
            )),
            (None, false) => Err(Error::Protocol(
                "envelope carries neither method nor result/error".to_string(),
            )),
        }
    }

    /// True for a response envelope (success or error).
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// True for a notification envelope.
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Convert a response envelope into the caller-facing result.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(Error::server(err.code, err.message));
        }
        self.result
            .ok_or_else(|| Error::Protocol("response without result or error".to_string()))
    }
}

/// Standard JSON-RPC error codes, plus the policy-denial range.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const AUTH_DENIED: i32 = -32001;
    pub const RATE_LIMITED: i32 = -32002;
}
