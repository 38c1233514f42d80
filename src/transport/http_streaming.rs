//! HTTP streaming transport: one chunked POST used bidirectionally.
//!
//! The client writes NDJSON request lines into the POST body stream while
//! reading NDJSON response lines from the response body stream. The
//! buffered fallback variant issues one POST per envelope and collects the
//! full response body; it exists for peers and runtimes that cannot stream
//! a request body, behaves identically at the protocol level, and is
//! selected only by the explicit `fallback_mode` flag.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{codec, Envelope, NdjsonDecoder};
use crate::transport::{
    StateCell, Transport, TransportChannels, TransportKind, TransportState, CHANNEL_CAPACITY,
};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bidirectional chunked NDJSON transport with a buffered fallback.
pub struct HttpStreamingTransport {
    url: String,
    headers: HashMap<String, String>,
    fallback_mode: bool,
    state: StateCell,
    tasks: Vec<JoinHandle<()>>,
}

impl HttpStreamingTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            fallback_mode: false,
            state: StateCell::new(),
            tasks: Vec::new(),
        }
    }

    /// Switch to the buffered request/response variant.
    pub fn with_fallback_mode(mut self, fallback_mode: bool) -> Self {
        self.fallback_mode = fallback_mode;
        self
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name {}: {}", name, e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid header value: {}", e)))?;
            default_headers.insert(name, value);
        }
        Ok(reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(default_headers)
            .build()?)
    }

    async fn start_streaming(&mut self) -> Result<TransportChannels> {
        let client = self.build_client()?;
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

        // Outgoing envelopes become the chunked request body as they are
        // enqueued; the request stays open for the life of the connection.
        let body_stream = ReceiverStream::new(outgoing_rx).map(|envelope| {
            codec::encode_line(&envelope)
                .map(String::into_bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        });

        let response = client
            .post(&self.url)
            .header("Content-Type", NDJSON_CONTENT_TYPE)
            .header("Accept", NDJSON_CONTENT_TYPE)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await
            .map_err(|e| Error::Connection(format!("HTTP streaming connect failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "HTTP streaming connect failed: HTTP {}",
                response.status()
            )));
        }

        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = NdjsonDecoder::new();

            'read: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("HTTP response stream ended: {}", e);
                        break;
                    }
                };
                for item in decoder.push(&chunk) {
                    match item {
                        Ok(envelope) => {
                            trace!("http-streaming received envelope");
                            if incoming_tx.send(envelope).await.is_err() {
                                break 'read;
                            }
                        }
                        Err(e) => warn!("skipping malformed NDJSON line: {}", e),
                    }
                }
            }
            for item in decoder.finish() {
                if let Ok(envelope) = item {
                    let _ = incoming_tx.send(envelope).await;
                }
            }
            state.advance(TransportState::Closed);
        }));

        Ok(TransportChannels {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        })
    }

    async fn start_buffered(&mut self) -> Result<TransportChannels> {
        let client = self.build_client()?;
        let url = self.url.clone();
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                let line = match codec::encode_line(&envelope) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("failed to encode envelope: {}", e);
                        continue;
                    }
                };
                let response = match client
                    .post(&url)
                    .header("Content-Type", NDJSON_CONTENT_TYPE)
                    .header("Accept", NDJSON_CONTENT_TYPE)
                    .body(line)
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("buffered POST failed, closing: {}", e);
                        break;
                    }
                };
                if !response.status().is_success() {
                    warn!("buffered POST rejected: HTTP {}", response.status());
                    continue;
                }

                // No streaming here: collect the whole body, then decode
                // every line it carries.
                let bytes = match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!("buffered body read failed: {}", e);
                        break;
                    }
                };
                let mut decoder = NdjsonDecoder::new();
                let mut items = decoder.push(&bytes);
                items.extend(decoder.finish());
                for item in items {
                    match item {
                        Ok(envelope) => {
                            if incoming_tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("skipping malformed NDJSON line: {}", e),
                    }
                }
            }
            state.advance(TransportState::Closed);
        }));

        Ok(TransportChannels {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        })
    }
}

#[async_trait]
impl Transport for HttpStreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpStreaming
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn start(&mut self) -> Result<TransportChannels> {
        self.state.advance(TransportState::Connecting);
        let channels = if self.fallback_mode {
            self.start_buffered().await?
        } else {
            self.start_streaming().await?
        };
        self.state.advance(TransportState::Ready);
        Ok(channels)
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.advance(TransportState::Closing);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state.advance(TransportState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_and_kind() {
        let transport =
            HttpStreamingTransport::new("https://host/api".to_string(), HashMap::new());
        assert_eq!(transport.kind(), TransportKind::HttpStreaming);
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(!transport.fallback_mode);
    }

    #[test]
    fn test_fallback_flag() {
        let transport = HttpStreamingTransport::new("https://host/api".to_string(), HashMap::new())
            .with_fallback_mode(true);
        assert!(transport.fallback_mode);
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let mut headers = HashMap::new();
        headers.insert("bad header name".to_string(), "v".to_string());
        let transport = HttpStreamingTransport::new("https://host/api".to_string(), headers);
        assert!(matches!(
            transport.build_client().unwrap_err(),
            Error::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_streaming_connect_refused() {
        let mut transport =
            HttpStreamingTransport::new("http://127.0.0.1:1/mcp".to_string(), HashMap::new());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
