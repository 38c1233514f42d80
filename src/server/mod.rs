//! MCP server: per-connection sessions, policy enforcement, and dispatch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, DEFAULT_IDLE_TIMEOUT};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::protocol::types::{
    CallToolParams, GetPromptParams, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, PromptsCapability, ReadResourceParams, ReadResourceResult,
    ResourcesCapability, ServerCapabilities, ServerInfo, ToolsCapability, MCP_VERSION,
};
use crate::protocol::{codec, Envelope, EnvelopeKind, RequestId};
use crate::transport::CHANNEL_CAPACITY;

pub mod http;
pub mod policy;
pub mod registry;
pub mod session;

pub use policy::{ApiKeyPolicy, Decision, PolicyChain, RateLimitPolicy, SecurityPolicy, Verdict};
pub use registry::{
    HandlerRegistry, PromptHandler, RequestContext, ResourceHandler, ToolHandler,
};
pub use session::{AuthContext, Session, SessionManager};

struct ServerInner {
    name: String,
    version: String,
    registry: HandlerRegistry,
    policies: PolicyChain,
    sessions: Arc<SessionManager>,
    metrics: Arc<Metrics>,
}

/// MCP server.
///
/// Cheap to clone; every connection loop shares the same registry, policy
/// chain, session manager, and metrics.
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl McpServer {
    /// Create a server with no security policies and default idle timeout.
    pub fn new(registry: HandlerRegistry, name: impl Into<String>) -> Self {
        Self::with_security(registry, PolicyChain::new(), DEFAULT_IDLE_TIMEOUT, name)
    }

    /// Create a server with an explicit policy chain and idle timeout.
    pub fn with_security(
        registry: HandlerRegistry,
        policies: PolicyChain,
        idle_timeout: Duration,
        name: impl Into<String>,
    ) -> Self {
        let metrics = Metrics::new();
        let sessions = Arc::new(SessionManager::new(idle_timeout, Arc::clone(&metrics)));
        Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                version: crate::VERSION.to_string(),
                registry,
                policies,
                sessions,
                metrics,
            }),
        }
    }

    /// Create a server whose policy chain follows a [`ServerConfig`]:
    /// API-key policy when keys are configured, rate limiting when the
    /// limit is nonzero.
    pub fn from_config(
        registry: HandlerRegistry,
        config: &ServerConfig,
        name: impl Into<String>,
    ) -> Self {
        let mut policies = PolicyChain::new();
        if !config.api_keys.is_empty() {
            policies.push(ApiKeyPolicy::new(config.api_keys.iter().cloned()));
        }
        if config.rate_limit > 0 {
            policies.push(RateLimitPolicy::new(config.rate_limit, config.rate_window));
        }
        Self::with_security(registry, policies, config.idle_timeout, name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Handle one inbound envelope for a session, pushing any responses and
    /// notifications into `sink`.
    pub async fn process(
        &self,
        session: &Arc<Session>,
        envelope: Envelope,
        sink: &mpsc::Sender<Envelope>,
    ) {
        session.touch();

        match envelope.kind() {
            Ok(EnvelopeKind::Request) => {
                let (response, disconnect) = self.handle_request(session, envelope, sink).await;
                if sink.send(response).await.is_err() {
                    debug!(session_id = %session.id(), "response sink closed");
                }
                if disconnect {
                    self.inner.sessions.remove(session.id());
                }
            }
            Ok(EnvelopeKind::Notification) => self.handle_notification(envelope),
            Ok(EnvelopeKind::Response) => {
                warn!(session_id = %session.id(), "ignoring unexpected response envelope");
            }
            Err(e) => {
                // Scoped to this envelope; the connection stays up.
                warn!(session_id = %session.id(), "dropping invalid envelope: {}", e);
            }
        }
    }

    async fn handle_request(
        &self,
        session: &Arc<Session>,
        envelope: Envelope,
        sink: &mpsc::Sender<Envelope>,
    ) -> (Envelope, bool) {
        self.inner.metrics.inc_requests();
        let id = match envelope.id.clone() {
            Some(id) => id,
            // kind() classified this as a request, so an id is present;
            // this arm only guards against future callers.
            None => {
                return (
                    Envelope::error_response(
                        RequestId::Number(0),
                        crate::protocol::envelope::error_codes::INVALID_REQUEST,
                        "request without id",
                    ),
                    false,
                )
            }
        };
        let method = envelope.method.clone().unwrap_or_default();
        debug!(session_id = %session.id(), %method, %id, "handling request");

        let verdict = self.inner.policies.evaluate(&envelope, session);
        if let Decision::Deny { code, reason } = verdict.decision {
            self.inner.metrics.inc_denied();
            return (Envelope::error_response(id, code, reason), verdict.disconnect);
        }

        let ctx = RequestContext::new(
            session.id().to_string(),
            Some(id.clone()),
            sink.clone(),
        );
        match self.dispatch(&method, envelope.params, &ctx).await {
            Ok(value) => (Envelope::response(id, value), false),
            Err(e) => {
                self.inner.metrics.inc_failed();
                (Envelope::error_response(id, e.wire_code(), e.to_string()), false)
            }
        }
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<Value> {
        match method {
            // Core
            "initialize" => self.handle_initialize(params),
            "ping" => Ok(json!({})),
            // Tools
            "tools/list" => Ok(serde_json::to_value(ListToolsResult {
                tools: self.inner.registry.list_tools(),
            })?),
            "tools/call" => self.handle_call_tool(params, ctx).await,
            // Resources
            "resources/list" => Ok(serde_json::to_value(ListResourcesResult {
                resources: self.inner.registry.list_resources(),
            })?),
            "resources/read" => self.handle_read_resource(params).await,
            // Prompts
            "prompts/list" => Ok(serde_json::to_value(ListPromptsResult {
                prompts: self.inner.registry.list_prompts(),
            })?),
            "prompts/get" => self.handle_get_prompt(params).await,
            // A bare tool name as the method dispatches to that tool.
            other => match self.inner.registry.get_tool(other) {
                Some(handler) => {
                    self.inner.metrics.inc_tool_calls();
                    let arguments = params
                        .map(parse_arguments)
                        .transpose()?
                        .unwrap_or_default();
                    let result = handler.execute(arguments, ctx).await?;
                    Ok(serde_json::to_value(result)?)
                }
                None => Err(Error::UnknownMethod(other.to_string())),
            },
        }
    }

    fn handle_initialize(&self, params: Option<Value>) -> Result<Value> {
        if let Some(params) = params {
            if let Some(client) = params.pointer("/clientInfo/name").and_then(Value::as_str) {
                info!(client, "client initializing");
            }
        }

        let registry = &self.inner.registry;
        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
                resources: (!registry.list_resources().is_empty())
                    .then(ResourcesCapability::default),
                prompts: (!registry.list_prompts().is_empty()).then(PromptsCapability::default),
            },
            server_info: ServerInfo {
                name: self.inner.name.clone(),
                version: self.inner.version.clone(),
            },
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_call_tool(&self, params: Option<Value>, ctx: &RequestContext) -> Result<Value> {
        let params: CallToolParams = required_params(params)?;
        self.inner.metrics.inc_tool_calls();

        let handler = self
            .inner
            .registry
            .get_tool(&params.name)
            .ok_or_else(|| Error::ToolNotFound(params.name.clone()))?;

        let result = handler.execute(params.arguments, ctx).await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_read_resource(&self, params: Option<Value>) -> Result<Value> {
        let params: ReadResourceParams = required_params(params)?;

        let handler = self
            .inner
            .registry
            .get_resource(&params.uri)
            .ok_or_else(|| Error::ResourceNotFound(params.uri.clone()))?;

        let contents = handler.read().await?;
        Ok(serde_json::to_value(ReadResourceResult { contents })?)
    }

    async fn handle_get_prompt(&self, params: Option<Value>) -> Result<Value> {
        let params: GetPromptParams = required_params(params)?;

        let handler = self
            .inner
            .registry
            .get_prompt(&params.name)
            .ok_or_else(|| Error::PromptNotFound(params.name.clone()))?;

        let result = handler.render(params.arguments).await?;
        Ok(serde_json::to_value(result)?)
    }

    fn handle_notification(&self, envelope: Envelope) {
        let method = envelope.method.as_deref().unwrap_or_default();
        match method {
            "notifications/initialized" => info!("client initialized"),
            "notifications/cancelled" => debug!("client cancelled a request"),
            other => debug!("ignoring notification: {}", other),
        }
    }

    /// Serve a single session over this process's stdin/stdout.
    pub async fn serve_stdio(&self) -> Result<()> {
        info!(
            "Starting MCP server: {} v{} (stdio)",
            self.inner.name, self.inner.version
        );
        let sweeper = self.inner.sessions.spawn_sweeper();
        let session = self.inner.sessions.create(AuthContext::default());
        let cancel = session.cancellation();

        let (sink_tx, mut sink_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(envelope) = sink_rx.recv().await {
                match codec::encode_line(&envelope) {
                    Ok(line) => {
                        if stdout.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                        if stdout.flush().await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("failed to encode envelope: {}", e),
                }
            }
        });

        let mut reader = BufReader::new(tokio::io::stdin());
        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("session evicted, closing stdio connection");
                    break;
                }
                read = reader.read_line(&mut line) => match read {
                    Ok(0) => {
                        debug!("EOF on stdin");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match codec::decode_line(trimmed) {
                            Ok(envelope) => {
                                // Dispatch off the read loop so a slow
                                // handler never stalls reading.
                                let server = self.clone();
                                let session = Arc::clone(&session);
                                let sink = sink_tx.clone();
                                tokio::spawn(async move {
                                    server.process(&session, envelope, &sink).await;
                                });
                            }
                            Err(e) => warn!("skipping malformed line: {}", e),
                        }
                    }
                    Err(e) => {
                        error!("error reading stdin: {}", e);
                        break;
                    }
                }
            }
        }

        self.inner.sessions.remove(session.id());
        drop(sink_tx);
        writer.await.ok();
        sweeper.abort();
        info!("MCP server stopped");
        Ok(())
    }
}

fn required_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    params
        .ok_or_else(|| Error::InvalidParams("missing params".to_string()))
        .and_then(|value| {
            serde_json::from_value(value).map_err(|e| Error::InvalidParams(e.to_string()))
        })
}

fn parse_arguments(
    params: Value,
) -> Result<std::collections::HashMap<String, Value>> {
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::error_codes;
    use crate::server::registry::{success_result, get_string_arg};
    use crate::protocol::types::{
        ContentBlock, GetPromptResult, Prompt, PromptMessage, ResourceContent,
        ResourceDescriptor, Tool, ToolResult,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn definition(&self) -> Tool {
            Tool {
                name: "echo".to_string(),
                description: "Echo text back to the caller".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } }
                }),
            }
        }

        async fn execute(
            &self,
            args: HashMap<String, Value>,
            _ctx: &RequestContext,
        ) -> crate::error::Result<ToolResult> {
            Ok(success_result(get_string_arg(&args, "text")?))
        }
    }

    struct StatusResource;

    #[async_trait]
    impl ResourceHandler for StatusResource {
        fn definition(&self) -> ResourceDescriptor {
            ResourceDescriptor {
                uri: "conduit://status".to_string(),
                name: "status".to_string(),
                description: Some("Server status".to_string()),
                mime_type: Some("application/json".to_string()),
            }
        }

        async fn read(&self) -> crate::error::Result<Vec<ResourceContent>> {
            Ok(vec![ResourceContent {
                uri: "conduit://status".to_string(),
                mime_type: Some("application/json".to_string()),
                text: Some("{\"status\":\"ok\"}".to_string()),
            }])
        }
    }

    struct GreetingPrompt;

    #[async_trait]
    impl PromptHandler for GreetingPrompt {
        fn definition(&self) -> Prompt {
            Prompt {
                name: "greeting".to_string(),
                description: "Greet a caller by name".to_string(),
                arguments: Vec::new(),
            }
        }

        async fn render(
            &self,
            arguments: HashMap<String, String>,
        ) -> crate::error::Result<GetPromptResult> {
            let name = arguments.get("name").cloned().unwrap_or_default();
            Ok(GetPromptResult {
                description: "Greeting".to_string(),
                messages: vec![PromptMessage {
                    role: "user".to_string(),
                    content: ContentBlock::Text {
                        text: format!("Hello, {}!", name),
                    },
                }],
            })
        }
    }

    fn test_server() -> McpServer {
        let mut registry = HandlerRegistry::new();
        registry.register_tool(EchoTool);
        registry.register_resource(StatusResource);
        registry.register_prompt(GreetingPrompt);
        McpServer::new(registry, "test-server")
    }

    async fn roundtrip(server: &McpServer, envelope: Envelope) -> Envelope {
        let session = server.sessions().create(AuthContext::default());
        let (sink, mut rx) = mpsc::channel(8);
        server.process(&session, envelope, &sink).await;
        rx.recv().await.expect("expected a response envelope")
    }

    #[tokio::test]
    async fn test_initialize_reports_capabilities() {
        let server = test_server();
        let response = roundtrip(
            &server,
            Envelope::request(
                1,
                "initialize",
                Some(json!({ "clientInfo": { "name": "test", "version": "1.0" } })),
            ),
        )
        .await;

        let result = response.into_result().unwrap();
        assert_eq!(result["protocolVersion"], MCP_VERSION);
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"]["resources"].is_object());
        assert!(result["capabilities"]["prompts"].is_object());
    }

    #[tokio::test]
    async fn test_tools_list_and_call() {
        let server = test_server();

        let list = roundtrip(&server, Envelope::request(1, "tools/list", None))
            .await
            .into_result()
            .unwrap();
        assert_eq!(list["tools"].as_array().unwrap().len(), 1);

        let call = roundtrip(
            &server,
            Envelope::request(
                2,
                "tools/call",
                Some(json!({ "name": "echo", "arguments": { "text": "hi" } })),
            ),
        )
        .await;
        assert_eq!(call.id, Some(RequestId::Number(2)));
        let result = call.into_result().unwrap();
        assert_eq!(result["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_bare_tool_name_dispatches() {
        let server = test_server();
        let result = roundtrip(
            &server,
            Envelope::request(1, "echo", Some(json!({ "text": "direct" }))),
        )
        .await
        .into_result()
        .unwrap();
        assert_eq!(result["content"][0]["text"], "direct");
    }

    #[tokio::test]
    async fn test_unknown_method_error() {
        let server = test_server();
        let response = roundtrip(&server, Envelope::request(1, "tools/destroy", None)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
        assert!(error.message.contains("tools/destroy"));
    }

    #[tokio::test]
    async fn test_unknown_tool_error() {
        let server = test_server();
        let response = roundtrip(
            &server,
            Envelope::request(1, "tools/call", Some(json!({ "name": "missing" }))),
        )
        .await;
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resources_and_prompts() {
        let server = test_server();

        let read = roundtrip(
            &server,
            Envelope::request(1, "resources/read", Some(json!({ "uri": "conduit://status" }))),
        )
        .await
        .into_result()
        .unwrap();
        assert_eq!(read["contents"][0]["uri"], "conduit://status");

        let prompt = roundtrip(
            &server,
            Envelope::request(
                2,
                "prompts/get",
                Some(json!({ "name": "greeting", "arguments": { "name": "Ada" } })),
            ),
        )
        .await
        .into_result()
        .unwrap();
        assert_eq!(prompt["messages"][0]["content"]["text"], "Hello, Ada!");
    }

    #[tokio::test]
    async fn test_policy_denial_short_circuits_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry.register_tool(EchoTool);
        let mut policies = PolicyChain::new();
        policies.push(ApiKeyPolicy::new(vec!["secret".to_string()]));
        let server =
            McpServer::with_security(registry, policies, Duration::from_secs(300), "secured");

        // No credential on the session: denied before the handler runs.
        let response = roundtrip(
            &server,
            Envelope::request(1, "tools/call", Some(json!({ "name": "echo" }))),
        )
        .await;
        assert_eq!(response.error.unwrap().code, error_codes::AUTH_DENIED);
        assert_eq!(server.metrics().snapshot().requests_denied, 1);
        assert_eq!(server.metrics().snapshot().tool_calls, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_requests_get_retriable_error() {
        let registry = HandlerRegistry::new();
        let mut policies = PolicyChain::new();
        policies.push(RateLimitPolicy::new(3, Duration::from_secs(60)));
        let server =
            McpServer::with_security(registry, policies, Duration::from_secs(300), "limited");

        let session = server.sessions().create(AuthContext::default());
        let (sink, mut rx) = mpsc::channel(16);
        for n in 0..4 {
            server
                .process(&session, Envelope::request(n, "ping", None), &sink)
                .await;
        }

        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..4 {
            let response = rx.recv().await.unwrap();
            match response.error {
                None => allowed += 1,
                Some(error) => {
                    assert_eq!(error.code, error_codes::RATE_LIMITED);
                    assert!(error.message.contains("rate limit"));
                    denied += 1;
                }
            }
        }
        assert_eq!(allowed, 3);
        assert_eq!(denied, 1);
    }

    #[tokio::test]
    async fn test_notifications_produce_no_response() {
        let server = test_server();
        let session = server.sessions().create(AuthContext::default());
        let (sink, mut rx) = mpsc::channel(8);

        server
            .process(
                &session,
                Envelope::notification("notifications/initialized", None),
                &sink,
            )
            .await;

        drop(sink);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_auth_disconnect_removes_session() {
        let registry = HandlerRegistry::new();
        let mut policies = PolicyChain::new();
        policies
            .push(ApiKeyPolicy::new(vec!["secret".to_string()]).with_disconnect_on_deny(true));
        let server =
            McpServer::with_security(registry, policies, Duration::from_secs(300), "strict");

        let session = server.sessions().create(AuthContext::default());
        let (sink, mut rx) = mpsc::channel(8);
        server
            .process(&session, Envelope::request(1, "ping", None), &sink)
            .await;

        let response = rx.recv().await.unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::AUTH_DENIED);
        assert!(server.sessions().get(session.id()).is_none());
        assert!(session.is_closed());
    }
}
