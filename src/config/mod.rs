//! Configuration for the client surface and the server binary.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Default per-request timeout for client calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle period after which a server session is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default rate-limit allowance per window.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Default rate-limit window length.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Construction surface for an MCP client.
///
/// `target` is either an HTTP(S)/WS(S) URL or a launch command for a stdio
/// child process. The transport override, when set to anything but `auto`,
/// wins over URL classification.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// URL or launch command of the server.
    pub target: String,
    /// Explicit transport override (`auto` or unset defers to the URL).
    pub transport: Option<String>,
    /// Client name reported during the handshake.
    pub client_name: String,
    /// Client version reported during the handshake.
    pub client_version: String,
    /// Per-request response deadline.
    pub timeout: Duration,
    /// Extra headers applied to HTTP-family transports.
    pub headers: HashMap<String, String>,
    /// Log every envelope and selection decision. Pure observability.
    pub debug: bool,
    /// Use the buffered HTTP variant instead of true streaming.
    pub fallback_mode: bool,
}

impl ClientOptions {
    /// Options for a target with everything else defaulted.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            transport: None,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            headers: HashMap::new(),
            debug: false,
            fallback_mode: false,
        }
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_fallback_mode(mut self, fallback_mode: bool) -> Self {
        self.fallback_mode = fallback_mode;
        self
    }
}

/// Command-line arguments for the server binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-conduit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MCP server over stdio or HTTP with session and policy enforcement")]
pub struct Args {
    /// Transport mode: stdio or http
    #[arg(short, long, default_value = "stdio", env = "MCP_CONDUIT_TRANSPORT")]
    pub transport: ServerTransport,

    /// HTTP bind address (only for http transport)
    #[arg(short, long, default_value = "0.0.0.0:3000", env = "MCP_CONDUIT_BIND")]
    pub bind: String,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_CONDUIT_DEBUG")]
    pub debug: bool,

    /// Accepted API keys; auth is disabled when none are configured
    #[arg(long = "api-key", env = "MCP_CONDUIT_API_KEYS", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    /// Requests allowed per rate-limit window (0 disables rate limiting)
    #[arg(long, default_value = "60", env = "MCP_CONDUIT_RATE_LIMIT")]
    pub rate_limit: u32,

    /// Rate-limit window in seconds
    #[arg(long, default_value = "60", env = "MCP_CONDUIT_RATE_WINDOW_SECS")]
    pub rate_window_secs: u64,

    /// Idle seconds before a session is evicted
    #[arg(long, default_value = "300", env = "MCP_CONDUIT_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: u64,
}

/// Server transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    #[default]
    Stdio,
    Http,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Transport mode
    pub transport: ServerTransport,
    /// HTTP bind address
    pub bind: String,
    /// Debug mode
    pub debug: bool,
    /// Accepted API keys (empty set disables the API-key policy)
    pub api_keys: Vec<String>,
    /// Requests per window (0 disables the rate-limit policy)
    pub rate_limit: u32,
    /// Rate-limit window length
    pub rate_window: Duration,
    /// Session idle timeout
    pub idle_timeout: Duration,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            transport: args.transport,
            bind: args.bind,
            debug: args.debug,
            api_keys: args.api_keys,
            rate_limit: args.rate_limit,
            rate_window: Duration::from_secs(args.rate_window_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: ServerTransport::Stdio,
            bind: "0.0.0.0:3000".to_string(),
            debug: false,
            api_keys: Vec::new(),
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: DEFAULT_RATE_WINDOW,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_options_defaults() {
        let options = ClientOptions::new("https://host/api");
        assert_eq!(options.target, "https://host/api");
        assert!(options.transport.is_none());
        assert_eq!(options.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(options.headers.is_empty());
        assert!(!options.debug);
        assert!(!options.fallback_mode);
    }

    #[test]
    fn test_client_options_builders() {
        let options = ClientOptions::new("node server.js")
            .with_transport("stdio")
            .with_timeout(Duration::from_millis(10))
            .with_header("x-api-key", "secret")
            .with_debug(true)
            .with_fallback_mode(true);

        assert_eq!(options.transport.as_deref(), Some("stdio"));
        assert_eq!(options.timeout, Duration::from_millis(10));
        assert_eq!(options.headers.get("x-api-key").unwrap(), "secret");
        assert!(options.debug);
        assert!(options.fallback_mode);
    }

    #[test]
    fn test_server_transport_default() {
        assert_eq!(ServerTransport::default(), ServerTransport::Stdio);
    }

    #[test]
    fn test_server_transport_serialization() {
        assert_eq!(
            serde_json::to_string(&ServerTransport::Stdio).unwrap(),
            "\"stdio\""
        );
        let parsed: ServerTransport = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(parsed, ServerTransport::Http);
    }

    #[test]
    fn test_args_to_config() {
        let args = Args {
            transport: ServerTransport::Http,
            bind: "127.0.0.1:4000".to_string(),
            debug: true,
            api_keys: vec!["k1".to_string(), "k2".to_string()],
            rate_limit: 3,
            rate_window_secs: 1,
            idle_timeout_secs: 30,
        };

        let config: ServerConfig = args.into();
        assert_eq!(config.transport, ServerTransport::Http);
        assert_eq!(config.bind, "127.0.0.1:4000");
        assert!(config.debug);
        assert_eq!(config.api_keys.len(), 2);
        assert_eq!(config.rate_limit, 3);
        assert_eq!(config.rate_window, Duration::from_secs(1));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.transport, ServerTransport::Stdio);
        assert!(config.api_keys.is_empty());
        assert_eq!(config.rate_limit, DEFAULT_RATE_LIMIT);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
    }
}
