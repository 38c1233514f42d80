//! Error types for the MCP transport and session layer.

use thiserror::Error;

/// Result type alias for transport and session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    // ===== Connection Errors =====
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    // ===== Request Errors =====
    #[error("Timeout: no response within {ms} ms")]
    Timeout { ms: u64 },

    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    // ===== Policy Errors =====
    #[error("Authentication denied: {0}")]
    AuthDenied(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a server error from a wire error code and message.
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Check if this error indicates the connection itself is unusable.
    ///
    /// Timeouts and per-message protocol errors leave the connection alive;
    /// everything in the connection family forces a reconnect.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionClosed | Self::Io(_) | Self::WebSocket(_)
        ) || matches!(self, Self::Http(e) if e.is_connect() || e.is_timeout())
    }

    /// Check if the caller may retry after waiting (transient denials).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// The JSON-RPC error code this error maps to on the wire.
    pub fn wire_code(&self) -> i32 {
        use crate::protocol::envelope::error_codes;
        match self {
            Self::Protocol(_) => error_codes::PARSE_ERROR,
            Self::UnknownMethod(_) | Self::ToolNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) | Self::ResourceNotFound(_) | Self::PromptNotFound(_) => {
                error_codes::INVALID_PARAMS
            }
            Self::AuthDenied(_) => error_codes::AUTH_DENIED,
            Self::RateLimited(_) => error_codes::RATE_LIMITED,
            Self::Server { code, .. } => *code,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}
