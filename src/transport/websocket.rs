//! WebSocket transport: one envelope per text frame.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::Envelope;
use crate::transport::{
    StateCell, Transport, TransportChannels, TransportKind, TransportState, CHANNEL_CAPACITY,
};

/// Full-duplex socket transport. The socket's own framing replaces line
/// framing: each text frame carries exactly one JSON envelope.
pub struct WebSocketTransport {
    url: String,
    headers: HashMap<String, String>,
    state: StateCell,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            state: StateCell::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn start(&mut self) -> Result<TransportChannels> {
        self.state.advance(TransportState::Connecting);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid websocket url: {}", e)))?;
        for (name, value) in &self.headers {
            let header_name: tokio_tungstenite::tungstenite::http::header::HeaderName = name
                .parse()
                .map_err(|_| Error::Config(format!("invalid header name: {}", name)))?;
            let header_value = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid header value for {}", name)))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| Error::Connection(format!("websocket connect failed: {}", e)))?;
        let (mut sink, mut stream) = socket.split();

        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

        // Reader task: frames → envelopes.
        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        trace!("websocket received: {}", text);
                        match serde_json::from_str::<Envelope>(&text)
                            .map_err(|e| Error::Protocol(e.to_string()))
                            .and_then(|env| env.kind().map(|_| env))
                        {
                            Ok(envelope) => {
                                if incoming_tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("skipping malformed frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("websocket closed by peer");
                        break;
                    }
                    Ok(_) => {
                        // Ping/pong are handled by the library; binary
                        // frames are not part of the protocol.
                    }
                    Err(e) => {
                        debug!("websocket stream error: {}", e);
                        break;
                    }
                }
            }
            state.advance(TransportState::Closed);
        }));

        // Writer task: envelopes → frames.
        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode envelope: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!("websocket send failed: {}", e);
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
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
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state.advance(TransportState::Closed);
        Ok(())
    }
}
