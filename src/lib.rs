//! MCP transport and session layer for agent tooling.
//!
//! This crate implements the wire plumbing between an agent process and the
//! MCP servers whose tools it invokes, on both ends of the connection:
//!
//! 1. **Protocol layer** (`protocol`) - envelope model, NDJSON and SSE codecs
//! 2. **Transport layer** (`transport`) - stdio, SSE, HTTP streaming (with a
//!    buffered fallback), and WebSocket, behind one trait with automatic
//!    selection from the target URL or command
//! 3. **Client layer** (`client`) - handshake, capability discovery and
//!    caching, correlated calls with per-request timeouts, keyed pooling
//! 4. **Server layer** (`server`) - per-connection sessions, an ordered
//!    security-policy chain (API key, rate limiting), handler dispatch, and
//!    idle eviction
//!
//! # Wire model
//!
//! Every transport moves the same JSON envelope: a request (`id` +
//! `method`), a notification (`method` only), or a response (`id` +
//! `result`/`error`). Requests issued on one connection resolve exactly
//! once each, correlated by `id`, regardless of response order.

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientPool, ClientState, McpClient};
pub use config::{ClientOptions, ServerConfig};
pub use error::{Error, Result};
pub use server::McpServer;
pub use transport::{TransportKind, TransportSelector};

/// Crate version reported in handshakes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
