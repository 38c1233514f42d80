//! Reference MCP server binary.
//!
//! Serves a small built-in capability set (echo and server-info tools, a
//! status resource, a usage prompt) over stdio or HTTP, with the policy
//! chain configured from the command line.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mcp_conduit::config::{Args, ServerConfig, ServerTransport};
use mcp_conduit::error::Result;
use mcp_conduit::protocol::types::{
    ContentBlock, GetPromptResult, Prompt, PromptArgument, PromptMessage, ResourceContent,
    ResourceDescriptor, Tool, ToolResult,
};
use mcp_conduit::server::registry::{
    get_string_arg, success_result, HandlerRegistry, PromptHandler, RequestContext,
    ResourceHandler, ToolHandler,
};
use mcp_conduit::server::{http, McpServer};
use mcp_conduit::VERSION;

/// Echoes its `text` argument back to the caller.
struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "echo".to_string(),
            description: "Echo the provided text back to the caller".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo" }
                },
                "required": ["text"]
            }),
        }
    }

    async fn execute(
        &self,
        args: HashMap<String, Value>,
        _ctx: &RequestContext,
    ) -> Result<ToolResult> {
        let text = get_string_arg(&args, "text")?;
        Ok(ToolResult {
            content: vec![ContentBlock::Text { text: text.clone() }],
            is_error: false,
        })
    }
}

/// Reports the server's identity and uptime.
struct ServerInfoTool {
    started: Instant,
}

#[async_trait]
impl ToolHandler for ServerInfoTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "server_info".to_string(),
            description: "Report server name, version, and uptime".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(
        &self,
        _args: HashMap<String, Value>,
        _ctx: &RequestContext,
    ) -> Result<ToolResult> {
        Ok(success_result(
            json!({
                "name": "mcp-conduit",
                "version": VERSION,
                "uptime_secs": self.started.elapsed().as_secs(),
            })
            .to_string(),
        ))
    }
}

/// Static status resource.
struct StatusResource;

#[async_trait]
impl ResourceHandler for StatusResource {
    fn definition(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            uri: "conduit://status".to_string(),
            name: "status".to_string(),
            description: Some("Server status document".to_string()),
            mime_type: Some("application/json".to_string()),
        }
    }

    async fn read(&self) -> Result<Vec<ResourceContent>> {
        Ok(vec![ResourceContent {
            uri: "conduit://status".to_string(),
            mime_type: Some("application/json".to_string()),
            text: Some(json!({ "status": "ok", "version": VERSION }).to_string()),
        }])
    }
}

/// Prompt explaining how to drive the built-in tools.
struct UsagePrompt;

#[async_trait]
impl PromptHandler for UsagePrompt {
    fn definition(&self) -> Prompt {
        Prompt {
            name: "usage".to_string(),
            description: "Explain how to call the built-in tools".to_string(),
            arguments: vec![PromptArgument {
                name: "tool".to_string(),
                description: "Tool to explain".to_string(),
                required: false,
            }],
        }
    }

    async fn render(&self, arguments: HashMap<String, String>) -> Result<GetPromptResult> {
        let tool = arguments.get("tool").map(String::as_str).unwrap_or("echo");
        Ok(GetPromptResult {
            description: format!("Usage notes for {}", tool),
            messages: vec![PromptMessage {
                role: "user".to_string(),
                content: ContentBlock::Text {
                    text: format!(
                        "Call the `{}` tool via tools/call with its arguments object.",
                        tool
                    ),
                },
            }],
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr: stdout belongs to the protocol in stdio mode.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let config: ServerConfig = args.into();

    info!("mcp-conduit v{}", VERSION);
    info!("Transport: {:?}", config.transport);

    let mut registry = HandlerRegistry::new();
    registry.register_tool(EchoTool);
    registry.register_tool(ServerInfoTool {
        started: Instant::now(),
    });
    registry.register_resource(StatusResource);
    registry.register_prompt(UsagePrompt);
    info!("Registered {} built-in tools", registry.tool_count());

    let server = McpServer::from_config(registry, &config, "mcp-conduit");

    match config.transport {
        ServerTransport::Stdio => {
            info!("Starting stdio transport...");
            server.serve_stdio().await?;
        }
        ServerTransport::Http => {
            info!("Starting HTTP transport on {}...", config.bind);
            http::start_server(server, &config.bind).await?;
        }
    }

    Ok(())
}
