//! HTTP server surface: NDJSON streaming, SSE, WebSocket, health, metrics.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{codec, Envelope, NdjsonDecoder};
use crate::server::session::AuthContext;
use crate::server::McpServer;
use crate::transport::sse::SESSION_ID_HEADER;
use crate::transport::CHANNEL_CAPACITY;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Shared state behind every route.
#[derive(Clone)]
pub struct HttpState {
    server: McpServer,
    /// Outgoing stream of each live SSE session, keyed by session id.
    sse_sinks: Arc<DashMap<String, mpsc::Sender<Envelope>>>,
}

/// Build the router for an MCP server.
pub fn router(server: McpServer) -> Router {
    let state = HttpState {
        server,
        sse_sinks: Arc::new(DashMap::new()),
    };
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/mcp", post(mcp_stream))
        .route("/sse", get(sse_connect).post(sse_post))
        .route("/ws", get(ws_connect))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(server: McpServer, bind: &str) -> Result<()> {
    let sweeper = server.sessions().spawn_sweeper();
    let app = router(server);

    info!("Starting HTTP server on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;

    sweeper.abort();
    Ok(())
}

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "server": state.server.name(),
        "version": crate::VERSION,
    }))
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    state.server.metrics().to_prometheus()
}

/// Bidirectional NDJSON streaming: one POST per connection, request lines
/// decoded as they arrive, response lines streamed back as handlers finish.
async fn mcp_stream(
    State(state): State<HttpState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Body,
) -> impl IntoResponse {
    let server = state.server.clone();
    let session = server
        .sessions()
        .create(auth_context(&headers, query.as_deref()));
    let session_id = session.id().to_string();
    let cancel = session.cancellation();

    let (sink_tx, sink_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

    // Request-side pump: decode the body as it streams in and dispatch
    // each envelope off the loop.
    let pump_server = server.clone();
    tokio::spawn(async move {
        let mut data = body.into_data_stream();
        let mut decoder = NdjsonDecoder::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = data.next() => {
                    let Some(Ok(chunk)) = chunk else { break };
                    for item in decoder.push(&chunk) {
                        match item {
                            Ok(envelope) => {
                                let server = pump_server.clone();
                                let session = Arc::clone(&session);
                                let sink = sink_tx.clone();
                                tokio::spawn(async move {
                                    server.process(&session, envelope, &sink).await;
                                });
                            }
                            Err(e) => warn!("skipping malformed line: {}", e),
                        }
                    }
                }
            }
        }
        debug!(session_id = %session.id(), "NDJSON connection closed");
        pump_server.sessions().remove(session.id());
    });

    let out = ReceiverStream::new(sink_rx).map(|envelope| {
        codec::encode_line(&envelope)
            .map(String::into_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    });

    (
        [
            ("content-type", NDJSON_CONTENT_TYPE.to_string()),
            (SESSION_ID_HEADER, session_id),
        ],
        Body::from_stream(out),
    )
}

/// Open the receive side of an SSE session. The session id is issued in
/// the `mcp-session-id` response header; responses to envelopes POSTed for
/// this session arrive here as terminal events.
async fn sse_connect(
    State(state): State<HttpState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let server = state.server.clone();
    let session = server
        .sessions()
        .create(auth_context(&headers, query.as_deref()));
    let session_id = session.id().to_string();
    let cancel = session.cancellation();

    let (sink_tx, mut sink_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
    state.sse_sinks.insert(session_id.clone(), sink_tx);

    // Forward session output into the event stream until eviction or the
    // client hangs up.
    let (event_tx, event_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
    let sinks = Arc::clone(&state.sse_sinks);
    let forward_id = session_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = sink_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if event_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
            }
        }
        sinks.remove(&forward_id);
        server.sessions().remove(&forward_id);
        debug!(session_id = %forward_id, "SSE connection closed");
    });

    let stream = ReceiverStream::new(event_rx).map(|envelope| Event::default().json_data(&envelope));

    (
        [(SESSION_ID_HEADER, session_id)],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}

/// Outbound half of an SSE session: accepts one envelope and answers on
/// the session's event stream.
async fn sse_post(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> Response {
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing mcp-session-id header" })),
        )
            .into_response();
    };

    let Some(session) = state.server.sessions().get(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown session" })),
        )
            .into_response();
    };
    let Some(sink) = state
        .sse_sinks
        .get(&session_id)
        .map(|entry| entry.value().clone())
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session has no open event stream" })),
        )
            .into_response();
    };

    let server = state.server.clone();
    tokio::spawn(async move {
        server.process(&session, envelope, &sink).await;
    });
    StatusCode::ACCEPTED.into_response()
}

/// WebSocket endpoint: one envelope per text frame, full duplex.
async fn ws_connect(
    State(state): State<HttpState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = auth_context(&headers, query.as_deref());
    ws.on_upgrade(move |socket| handle_ws(state, auth, socket))
}

async fn handle_ws(state: HttpState, auth: AuthContext, socket: WebSocket) {
    let server = state.server.clone();
    let session = server.sessions().create(auth);
    let cancel = session.cancellation();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink_tx, mut sink_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = sink_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode envelope: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match codec::decode_line(text.as_str()) {
                    Ok(envelope) => {
                        let server = server.clone();
                        let session = Arc::clone(&session);
                        let sink = sink_tx.clone();
                        tokio::spawn(async move {
                            server.process(&session, envelope, &sink).await;
                        });
                    }
                    Err(e) => warn!("skipping malformed frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket error: {}", e);
                    break;
                }
            }
        }
    }

    server.sessions().remove(session.id());
    drop(sink_tx);
    writer.await.ok();
}

/// Pull the presented credential out of the connection: `x-api-key`
/// header, `Authorization: Bearer`, or an `api_key` query parameter.
fn auth_context(headers: &HeaderMap, query: Option<&str>) -> AuthContext {
    let from_headers = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(String::from)
        });
    let from_query = query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("api_key="))
            .map(String::from)
    });
    AuthContext {
        api_key: from_headers.or(from_query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_from_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret".parse().unwrap());
        assert_eq!(
            auth_context(&headers, None).api_key.as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn test_auth_from_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer token-1".parse().unwrap());
        assert_eq!(
            auth_context(&headers, None).api_key.as_deref(),
            Some("token-1")
        );
    }

    #[test]
    fn test_auth_from_query_parameter() {
        let headers = HeaderMap::new();
        assert_eq!(
            auth_context(&headers, Some("x=1&api_key=qk")).api_key.as_deref(),
            Some("qk")
        );
    }

    #[test]
    fn test_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "from-header".parse().unwrap());
        assert_eq!(
            auth_context(&headers, Some("api_key=from-query"))
                .api_key
                .as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn test_no_credential() {
        assert!(auth_context(&HeaderMap::new(), None).api_key.is_none());
    }
}
