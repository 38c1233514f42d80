//! SSE transport: long-lived event stream in, HTTP POSTs out.
//!
//! SSE is receive-only, so outbound envelopes travel as individual POSTs to
//! the same endpoint. Responses may arrive either in a POST's own body or
//! on the event stream; both paths feed the incoming channel and the owner
//! correlates strictly by envelope `id`, never by which HTTP exchange
//! carried the bytes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{codec, Envelope, SseDecoder};
use crate::transport::{
    StateCell, Transport, TransportChannels, TransportKind, TransportState, CHANNEL_CAPACITY,
};

/// Session identity header shared with the server.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport over a server-sent-event stream plus per-request POSTs.
pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    state: StateCell,
    session_id: Arc<Mutex<Option<String>>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            state: StateCell::new(),
            session_id: Arc::new(Mutex::new(None)),
            reader: None,
            writer: None,
        }
    }

    /// The session id issued by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    fn apply_headers(
        mut request: reqwest::RequestBuilder,
        headers: &HashMap<String, String>,
        session_id: &Arc<Mutex<Option<String>>>,
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(session) = session_id.lock().unwrap().as_deref() {
            request = request.header(SESSION_ID_HEADER, session);
        }
        request
    }

    fn capture_session_id(response: &reqwest::Response, session_id: &Arc<Mutex<Option<String>>>) {
        if let Some(value) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *session_id.lock().unwrap() = Some(value.to_string());
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn start(&mut self) -> Result<TransportChannels> {
        self.state.advance(TransportState::Connecting);

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let request = Self::apply_headers(
            client.get(&self.url).header("Accept", "text/event-stream"),
            &self.headers,
            &self.session_id,
        );
        let response = request
            .send()
            .await
            .map_err(|e| Error::Connection(format!("SSE connect failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "SSE connect failed: HTTP {}",
                response.status()
            )));
        }
        Self::capture_session_id(&response, &self.session_id);

        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

        // Reader task: event stream → envelopes.
        let state = self.state.clone();
        let stream_tx = incoming_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            'read: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("SSE stream ended: {}", e);
                        break;
                    }
                };
                for item in decoder.push(&chunk) {
                    match item {
                        Ok(envelope) => {
                            if stream_tx.send(envelope).await.is_err() {
                                break 'read;
                            }
                        }
                        Err(e) => warn!("skipping malformed SSE event: {}", e),
                    }
                }
            }
            for item in decoder.finish() {
                if let Ok(envelope) = item {
                    let _ = stream_tx.send(envelope).await;
                }
            }
            state.advance(TransportState::Closed);
        }));

        // Writer task: one POST per outbound envelope. A response body that
        // parses as an envelope is fed back through the same incoming
        // channel so correlation stays id-based.
        let url = self.url.clone();
        let headers = self.headers.clone();
        let session_id = self.session_id.clone();
        let state = self.state.clone();
        self.writer = Some(tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                let body = match serde_json::to_string(&envelope) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("failed to encode envelope: {}", e);
                        continue;
                    }
                };
                trace!("SSE posting: {}", body);
                let request = Self::apply_headers(
                    client
                        .post(&url)
                        .header("Content-Type", "application/json"),
                    &headers,
                    &session_id,
                )
                .body(body);

                let response = match request.send().await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("SSE POST failed, closing: {}", e);
                        break;
                    }
                };
                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND
                    || status == reqwest::StatusCode::GONE
                {
                    // The server no longer knows this session.
                    debug!("SSE session gone (HTTP {}), closing", status);
                    break;
                }
                if !status.is_success() {
                    warn!("SSE POST rejected: HTTP {}", status);
                    continue;
                }
                if let Some(value) = response
                    .headers()
                    .get(SESSION_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                {
                    *session_id.lock().unwrap() = Some(value.to_string());
                }

                let bytes = match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                let text = String::from_utf8_lossy(&bytes);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Ok(envelope) = codec::decode_line(trimmed) {
                    if incoming_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
            }
            state.advance(TransportState::Closed);
        }));

        self.state.advance(TransportState::Ready);
        Ok(TransportChannels {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        })
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.advance(TransportState::Closing);
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        if let Some(handle) = self.writer.take() {
            handle.abort();
        }
        self.state.advance(TransportState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Port 1 is essentially never listening.
        let mut transport = SseTransport::new("http://127.0.0.1:1/sse".to_string(), HashMap::new());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_initial_state() {
        let transport = SseTransport::new("http://host/sse".to_string(), HashMap::new());
        assert_eq!(transport.kind(), TransportKind::Sse);
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(transport.session_id(), None);
    }
}
