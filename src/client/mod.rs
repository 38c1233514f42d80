//! MCP client: handshake, capability discovery, and correlated calls.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::protocol::envelope::error_codes;
use crate::protocol::types::{
    ClientInfo, GetPromptResult, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, Prompt, ReadResourceResult, ResourceDescriptor, Tool,
    ToolResult, MCP_VERSION,
};
use crate::protocol::{Envelope, RequestId};
use crate::transport::{
    HttpStreamingTransport, SseTransport, StdioTransport, Transport, TransportKind,
    TransportSelector, WebSocketTransport,
};

pub mod pending;
pub mod pool;

pub use pending::PendingRequestTable;
pub use pool::ClientPool;

/// Capacity of the notification fan-out channel.
const NOTIFICATION_CAPACITY: usize = 64;

/// Client lifecycle states. Monotonic, like the transport lifecycle: a
/// closed client is never reused, a new instance must be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Initialized = 2,
    Ready = 3,
    Closing = 4,
    Closed = 5,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Initialized => "initialized",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Default)]
struct ClientStateCell {
    inner: Arc<AtomicU8>,
}

impl ClientStateCell {
    fn get(&self) -> ClientState {
        match self.inner.load(Ordering::Acquire) {
            0 => ClientState::Disconnected,
            1 => ClientState::Connecting,
            2 => ClientState::Initialized,
            3 => ClientState::Ready,
            4 => ClientState::Closing,
            _ => ClientState::Closed,
        }
    }

    fn advance(&self, state: ClientState) {
        self.inner.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// Client for one MCP server connection.
///
/// All methods take `&self`: a connected client can carry any number of
/// concurrent in-flight calls and live behind `Arc` in a [`ClientPool`].
pub struct McpClient {
    options: ClientOptions,
    state: ClientStateCell,
    pending: Arc<PendingRequestTable>,
    next_id: AtomicI64,
    outgoing: Mutex<Option<mpsc::Sender<Envelope>>>,
    transport: AsyncMutex<Option<Box<dyn Transport>>>,
    transport_kind: Mutex<Option<TransportKind>>,
    server_info: RwLock<Option<InitializeResult>>,
    tools: RwLock<Option<Vec<Tool>>>,
    resources: RwLock<Option<Vec<ResourceDescriptor>>>,
    prompts: RwLock<Option<Vec<Prompt>>>,
    notifications: broadcast::Sender<Envelope>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Create a disconnected client. Call [`connect`](Self::connect) next.
    pub fn new(options: ClientOptions) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            options,
            state: ClientStateCell::default(),
            pending: Arc::new(PendingRequestTable::new()),
            next_id: AtomicI64::new(1),
            outgoing: Mutex::new(None),
            transport: AsyncMutex::new(None),
            transport_kind: Mutex::new(None),
            server_info: RwLock::new(None),
            tools: RwLock::new(None),
            resources: RwLock::new(None),
            prompts: RwLock::new(None),
            notifications,
            read_task: Mutex::new(None),
        }
    }

    /// Observable lifecycle state.
    pub fn state(&self) -> ClientState {
        self.state.get()
    }

    /// The transport kind resolved at connect time.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        *self.transport_kind.lock().unwrap()
    }

    /// Server identity and capabilities from the handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().unwrap().clone()
    }

    /// Subscribe to notification envelopes in arrival order.
    pub fn notifications(&self) -> broadcast::Receiver<Envelope> {
        self.notifications.subscribe()
    }

    /// Resolve a transport, open it, and run the `initialize` handshake.
    pub async fn connect(&self) -> Result<()> {
        let kind =
            TransportSelector::select(&self.options.target, self.options.transport.as_deref())?;
        if self.options.debug {
            info!(target = %self.options.target, %kind, "transport selected");
        }
        let transport = self.build_transport(kind)?;
        self.connect_with_transport(transport).await
    }

    /// Open an already-constructed transport and run the handshake.
    ///
    /// The normal path is [`connect`](Self::connect); this exists for
    /// custom transports and for tests that inject an in-memory one.
    pub async fn connect_with_transport(&self, mut transport: Box<dyn Transport>) -> Result<()> {
        match self.state.get() {
            ClientState::Disconnected => {}
            other => {
                return Err(Error::Connection(format!(
                    "client cannot connect while {}",
                    other
                )))
            }
        }
        self.state.advance(ClientState::Connecting);
        *self.transport_kind.lock().unwrap() = Some(transport.kind());

        let channels = match transport.start().await {
            Ok(channels) => channels,
            Err(e) => {
                self.state.advance(ClientState::Closed);
                return Err(e);
            }
        };
        *self.outgoing.lock().unwrap() = Some(channels.outgoing);
        *self.transport.lock().await = Some(transport);
        self.spawn_read_loop(channels.incoming);

        match self.handshake().await {
            Ok(()) => {
                self.state.advance(ClientState::Ready);
                Ok(())
            }
            Err(e) => {
                self.close().await.ok();
                Err(e)
            }
        }
    }

    fn build_transport(&self, kind: TransportKind) -> Result<Box<dyn Transport>> {
        let target = self.options.target.clone();
        let headers = self.options.headers.clone();
        Ok(match kind {
            TransportKind::Stdio => Box::new(StdioTransport::from_command_line(&target)?),
            TransportKind::Sse => Box::new(SseTransport::new(target, headers)),
            TransportKind::HttpStreaming => Box::new(
                HttpStreamingTransport::new(target, headers)
                    .with_fallback_mode(self.options.fallback_mode),
            ),
            TransportKind::WebSocket => Box::new(WebSocketTransport::new(target, headers)),
        })
    }

    fn spawn_read_loop(&self, mut incoming: mpsc::Receiver<Envelope>) {
        let pending = Arc::clone(&self.pending);
        let notifications = self.notifications.clone();
        let state = self.state.clone();
        let debug_envelopes = self.options.debug;

        let task = tokio::spawn(async move {
            while let Some(envelope) = incoming.recv().await {
                if debug_envelopes {
                    info!(
                        envelope = %serde_json::to_string(&envelope).unwrap_or_default(),
                        "mcp <-"
                    );
                }
                if envelope.is_response() {
                    if !pending.resolve(envelope) {
                        debug!("discarding response for unknown request id");
                    }
                } else if envelope.is_notification() {
                    // Listeners see notifications in arrival order; a send
                    // with no subscribers is fine.
                    let _ = notifications.send(envelope);
                } else {
                    warn!("ignoring server-initiated request");
                }
            }
            // Transport gone: nothing else will resolve these.
            pending.reject_all(|| Error::ConnectionClosed);
            state.advance(ClientState::Closed);
        });
        *self.read_task.lock().unwrap() = Some(task);
    }

    async fn handshake(&self) -> Result<()> {
        let params = serde_json::to_value(InitializeParams {
            protocol_version: MCP_VERSION.to_string(),
            client_info: ClientInfo {
                name: self.options.client_name.clone(),
                version: self.options.client_version.clone(),
            },
            capabilities: json!({}),
        })?;
        let value = self.request("initialize", Some(params)).await?;
        let info: InitializeResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid initialize result: {}", e)))?;
        debug!(
            server = %info.server_info.name,
            version = %info.server_info.version,
            "handshake complete"
        );
        *self.server_info.write().unwrap() = Some(info);
        self.state.advance(ClientState::Initialized);

        self.notify("notifications/initialized", None).await?;

        // Discover capabilities once; they stay cached for the session.
        let tools = self.fetch_tools().await?;
        *self.tools.write().unwrap() = Some(tools);
        let resources = self.fetch_resources().await?;
        *self.resources.write().unwrap() = Some(resources);
        let prompts = self.fetch_prompts().await?;
        *self.prompts.write().unwrap() = Some(prompts);
        Ok(())
    }

    /// Send a notification envelope (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(Envelope::notification(method, params)).await
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.options.debug {
            info!(
                envelope = %serde_json::to_string(&envelope).unwrap_or_default(),
                "mcp ->"
            );
        }
        let sender = self.outgoing.lock().unwrap().clone();
        let Some(sender) = sender else {
            return Err(Error::Connection("client is not connected".to_string()));
        };
        sender
            .send(envelope)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Issue a correlated request and await its response or deadline.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match self.state.get() {
            ClientState::Closing | ClientState::Closed => return Err(Error::ConnectionClosed),
            _ => {}
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let rx = self.pending.register(id.clone());

        if let Err(e) = self.send(Envelope::request(id.clone(), method, params)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let timeout_ms = self.options.timeout.as_millis() as u64;
        match tokio::time::timeout(self.options.timeout, rx).await {
            Ok(Ok(outcome)) => outcome.and_then(Envelope::into_result),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                // This request's deadline only: drop its entry and leave
                // every other in-flight call untouched.
                self.pending.remove(&id);
                Err(Error::Timeout { ms: timeout_ms })
            }
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<Tool>> {
        match self.request("tools/list", None).await {
            Ok(value) => {
                let result: ListToolsResult = serde_json::from_value(value)
                    .map_err(|e| Error::Protocol(format!("invalid tools list: {}", e)))?;
                Ok(result.tools)
            }
            Err(e) => method_not_found_as_empty(e),
        }
    }

    async fn fetch_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        match self.request("resources/list", None).await {
            Ok(value) => {
                let result: ListResourcesResult = serde_json::from_value(value)
                    .map_err(|e| Error::Protocol(format!("invalid resources list: {}", e)))?;
                Ok(result.resources)
            }
            Err(e) => method_not_found_as_empty(e),
        }
    }

    async fn fetch_prompts(&self) -> Result<Vec<Prompt>> {
        match self.request("prompts/list", None).await {
            Ok(value) => {
                let result: ListPromptsResult = serde_json::from_value(value)
                    .map_err(|e| Error::Protocol(format!("invalid prompts list: {}", e)))?;
                Ok(result.prompts)
            }
            Err(e) => method_not_found_as_empty(e),
        }
    }

    /// Tools advertised by the server, from the session cache.
    pub async fn tools(&self) -> Result<Vec<Tool>> {
        if let Some(tools) = self.tools.read().unwrap().clone() {
            return Ok(tools);
        }
        let tools = self.fetch_tools().await?;
        *self.tools.write().unwrap() = Some(tools.clone());
        Ok(tools)
    }

    /// Resources advertised by the server, from the session cache.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        if let Some(resources) = self.resources.read().unwrap().clone() {
            return Ok(resources);
        }
        let resources = self.fetch_resources().await?;
        *self.resources.write().unwrap() = Some(resources.clone());
        Ok(resources)
    }

    /// Prompts advertised by the server, from the session cache.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        if let Some(prompts) = self.prompts.read().unwrap().clone() {
            return Ok(prompts);
        }
        let prompts = self.fetch_prompts().await?;
        *self.prompts.write().unwrap() = Some(prompts.clone());
        Ok(prompts)
    }

    /// Drop the cached capability lists; the next accessor refetches.
    pub fn invalidate_capabilities(&self) {
        *self.tools.write().unwrap() = None;
        *self.resources.write().unwrap() = None;
        *self.prompts.write().unwrap() = None;
    }

    /// Invoke a tool by name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let value = self
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid tool result: {}", e)))
    }

    /// Read a resource by uri.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let value = self
            .request("resources/read", Some(json!({ "uri": uri })))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid resource result: {}", e)))
    }

    /// Render a prompt by name.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: std::collections::HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        let value = self
            .request(
                "prompts/get",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid prompt result: {}", e)))
    }

    /// Close the connection. Every still-pending request is rejected with a
    /// connection-closed error; the client cannot be reused afterwards.
    pub async fn close(&self) -> Result<()> {
        if self.state.get() == ClientState::Closed {
            return Ok(());
        }
        self.state.advance(ClientState::Closing);
        *self.outgoing.lock().unwrap() = None;
        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.stop().await.ok();
        }
        self.pending.reject_all(|| Error::ConnectionClosed);
        if let Some(task) = self.read_task.lock().unwrap().take() {
            task.abort();
        }
        self.state.advance(ClientState::Closed);
        Ok(())
    }
}

fn method_not_found_as_empty<T>(error: Error) -> Result<Vec<T>> {
    match error {
        // A server without this capability family is not an error; the
        // cache just holds an empty list.
        Error::Server { code, .. } if code == error_codes::METHOD_NOT_FOUND => Ok(Vec::new()),
        other => Err(other),
    }
}
