//! Transport layer: one trait, four wire implementations.
//!
//! Every transport moves [`Envelope`]s across one physical channel and
//! exposes the same contract: `start()` yields an incoming receiver and an
//! outgoing sender, `state()` observes the monotonic lifecycle, `stop()`
//! tears the channel down. A mid-stream disconnect drops the incoming
//! receiver's sender side; the owner sees the stream end, marks the
//! transport `closed`, and fails whatever was in flight. Transports never
//! auto-retry; reconnection is the client's job.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

pub mod http_streaming;
pub mod select;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub use http_streaming::HttpStreamingTransport;
pub use select::TransportSelector;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Depth of the per-transport envelope channels.
pub(crate) const CHANNEL_CAPACITY: usize = 100;

/// Supported transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Sse,
    HttpStreaming,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::HttpStreaming => "http-streaming",
            Self::WebSocket => "websocket",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "http-streaming" | "http_streaming" | "http" => Ok(Self::HttpStreaming),
            "websocket" | "ws" => Ok(Self::WebSocket),
            other => Err(Error::UnsupportedTransport(other.to_string())),
        }
    }
}

/// Transport lifecycle states. Transitions are monotonic: a dropped
/// connection ends at `Closed` and a fresh transport must be built to
/// connect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Shared, forward-only state cell observed by the transport owner and its
/// spawned read/write tasks.
#[derive(Debug, Clone, Default)]
pub struct StateCell {
    inner: Arc<AtomicU8>,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> TransportState {
        match self.inner.load(Ordering::Acquire) {
            0 => TransportState::Disconnected,
            1 => TransportState::Connecting,
            2 => TransportState::Ready,
            3 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }

    /// Advance to `state` if it is further along than the current one.
    /// Backward transitions are ignored, keeping the lifecycle monotonic.
    pub fn advance(&self, state: TransportState) {
        self.inner
            .fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// Channel pair returned by [`Transport::start`].
#[derive(Debug)]
pub struct TransportChannels {
    /// Envelopes received from the peer. The stream ending means the
    /// connection is gone.
    pub incoming: mpsc::Receiver<Envelope>,
    /// Envelopes to send to the peer.
    pub outgoing: mpsc::Sender<Envelope>,
}

/// Contract shared by all transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which wire this transport speaks.
    fn kind(&self) -> TransportKind;

    /// Observable lifecycle state.
    fn state(&self) -> TransportState;

    /// Open the physical channel and return the envelope channel pair.
    async fn start(&mut self) -> Result<TransportChannels>;

    /// Close the physical channel. Idempotent.
    async fn stop(&mut self) -> Result<()>;
}
