//! Capability registries: tools, resources, and prompts with bound handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::types::{
    ContentBlock, GetPromptResult, Prompt, ResourceContent, ResourceDescriptor, Tool, ToolResult,
};
use crate::protocol::{Envelope, RequestId};

/// Per-request context handed to handlers.
///
/// Carries the session identity and a notifier for streamed partial
/// results: progress notifications emitted here are interleaved with the
/// terminal response on transports that stream (NDJSON, WebSocket) and
/// precede the terminal event on SSE.
#[derive(Clone)]
pub struct RequestContext {
    session_id: String,
    request_id: Option<RequestId>,
    notifier: mpsc::Sender<Envelope>,
}

impl RequestContext {
    pub fn new(
        session_id: String,
        request_id: Option<RequestId>,
        notifier: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            session_id,
            request_id,
            notifier,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emit a progress notification tied to this request. Send failures
    /// mean the connection is gone and are ignored.
    pub async fn progress(&self, progress: u64, total: Option<u64>, message: Option<&str>) {
        let mut params = json!({
            "progressToken": self.request_id.clone().map(|id| id.to_string()).unwrap_or_default(),
            "progress": progress,
        });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        if let Some(message) = message {
            params["message"] = json!(message);
        }
        let _ = self
            .notifier
            .send(Envelope::notification("notifications/progress", Some(params)))
            .await;
    }
}

/// Handler for MCP tool calls.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> Tool;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: HashMap<String, Value>,
        ctx: &RequestContext,
    ) -> Result<ToolResult>;
}

/// Handler backing one readable resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Get the resource descriptor.
    fn definition(&self) -> ResourceDescriptor;

    /// Produce the resource contents.
    async fn read(&self) -> Result<Vec<ResourceContent>>;
}

/// Handler rendering one prompt template.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Get the prompt definition.
    fn definition(&self) -> Prompt;

    /// Render the prompt with the given arguments.
    async fn render(&self, arguments: HashMap<String, String>) -> Result<GetPromptResult>;
}

/// Registry of handlers the dispatcher resolves methods against.
#[derive(Default)]
pub struct HandlerRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    resources: HashMap<String, Arc<dyn ResourceHandler>>,
    prompts: HashMap<String, Arc<dyn PromptHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool handler.
    pub fn register_tool<T: ToolHandler + 'static>(&mut self, handler: T) {
        let tool = handler.definition();
        self.tools.insert(tool.name, Arc::new(handler));
    }

    /// Register a resource handler, keyed by uri.
    pub fn register_resource<R: ResourceHandler + 'static>(&mut self, handler: R) {
        let descriptor = handler.definition();
        self.resources.insert(descriptor.uri, Arc::new(handler));
    }

    /// Register a prompt handler.
    pub fn register_prompt<P: PromptHandler + 'static>(&mut self, handler: P) {
        let prompt = handler.definition();
        self.prompts.insert(prompt.name, Arc::new(handler));
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools.values().map(|h| h.definition()).collect()
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.resources.values().map(|h| h.definition()).collect()
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.prompts.values().map(|h| h.definition()).collect()
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn get_resource(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.resources.get(uri).cloned()
    }

    pub fn get_prompt(&self, name: &str) -> Option<Arc<dyn PromptHandler>> {
        self.prompts.get(name).cloned()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

/// Helper to create a text content block.
pub fn text_content(text: impl Into<String>) -> ContentBlock {
    ContentBlock::Text { text: text.into() }
}

/// Helper to create a successful tool result.
pub fn success_result(text: impl Into<String>) -> ToolResult {
    ToolResult {
        content: vec![text_content(text)],
        is_error: false,
    }
}

/// Helper to create an error tool result.
pub fn error_result(text: impl Into<String>) -> ToolResult {
    ToolResult {
        content: vec![text_content(text)],
        is_error: true,
    }
}

/// Helper to extract a required string argument.
pub fn get_string_arg(args: &HashMap<String, Value>, name: &str) -> Result<String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::InvalidParams(format!("missing required argument: {}", name)))
}

/// Helper to extract an optional string argument.
pub fn get_optional_string_arg(args: &HashMap<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(String::from)
}

/// Helper to extract a required integer argument.
pub fn get_int_arg(args: &HashMap<String, Value>, name: &str) -> Result<i64> {
    args.get(name)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::InvalidParams(format!("missing required argument: {}", name)))
}
