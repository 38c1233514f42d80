//! Transport selection from a URL or launch command.

use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::TransportKind;

/// URL path suffixes that mark an endpoint as server-sent events.
const SSE_PATH_SUFFIXES: &[&str] = &["/sse", "/events", "/stream", "/server-sent-events"];

/// Resolves which transport to use for a target.
///
/// An explicit override always wins. Otherwise HTTP(S) URLs split between
/// SSE (recognized by path suffix or a `transport=sse` query parameter) and
/// HTTP streaming; `ws://`/`wss://` URLs take the WebSocket transport; and
/// anything else is treated as a launch command for a stdio child process.
pub struct TransportSelector;

impl TransportSelector {
    /// Pick a transport kind for `target`, honoring `override_kind` first.
    ///
    /// An unrecognized override fails with a configuration error before any
    /// connection attempt. The literal override `auto` defers to URL
    /// classification.
    pub fn select(target: &str, override_kind: Option<&str>) -> Result<TransportKind> {
        if let Some(name) = override_kind {
            if !name.eq_ignore_ascii_case("auto") {
                let kind = name
                    .parse::<TransportKind>()
                    .map_err(|_| Error::Config(format!("unknown transport override: {}", name)))?;
                debug!(target, %kind, "transport pinned by override");
                return Ok(kind);
            }
        }

        let kind = Self::classify(target);
        debug!(target, %kind, "transport selected from target");
        Ok(kind)
    }

    fn classify(target: &str) -> TransportKind {
        let lower = target.to_ascii_lowercase();

        if lower.starts_with("ws://") || lower.starts_with("wss://") {
            return TransportKind::WebSocket;
        }
        if !lower.starts_with("http://") && !lower.starts_with("https://") {
            // Not a URL: a command line to spawn.
            return TransportKind::Stdio;
        }

        if Self::is_sse_url(&lower) {
            TransportKind::Sse
        } else {
            TransportKind::HttpStreaming
        }
    }

    fn is_sse_url(lower_url: &str) -> bool {
        let (without_query, query) = match lower_url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (lower_url, None),
        };

        if let Some(query) = query {
            let wants_sse = query
                .split('&')
                .any(|pair| pair == "transport=sse");
            if wants_sse {
                return true;
            }
        }

        let path = without_query.trim_end_matches('/');
        SSE_PATH_SUFFIXES
            .iter()
            .any(|suffix| path.ends_with(suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(target: &str) -> TransportKind {
        TransportSelector::select(target, None).unwrap()
    }

    #[test]
    fn test_sse_path_suffixes() {
        assert_eq!(select("https://host/sse"), TransportKind::Sse);
        assert_eq!(select("https://host/sse/"), TransportKind::Sse);
        assert_eq!(select("https://host/api/events"), TransportKind::Sse);
        assert_eq!(select("http://host:8080/stream"), TransportKind::Sse);
        assert_eq!(
            select("https://host/v1/server-sent-events"),
            TransportKind::Sse
        );
    }

    #[test]
    fn test_sse_query_parameter() {
        assert_eq!(
            select("https://host/api?transport=sse"),
            TransportKind::Sse
        );
        assert_eq!(
            select("https://host/api?key=1&transport=sse&x=2"),
            TransportKind::Sse
        );
        // Only an exact pair counts.
        assert_eq!(
            select("https://host/api?transport=ssex"),
            TransportKind::HttpStreaming
        );
    }

    #[test]
    fn test_http_defaults_to_streaming() {
        assert_eq!(select("https://host/api"), TransportKind::HttpStreaming);
        assert_eq!(select("http://host/"), TransportKind::HttpStreaming);
        assert_eq!(
            select("https://host/sse-adjacent"),
            TransportKind::HttpStreaming
        );
        // Suffix match is on the path, not the middle of it.
        assert_eq!(
            select("https://host/events/archive"),
            TransportKind::HttpStreaming
        );
    }

    #[test]
    fn test_commands_default_to_stdio() {
        assert_eq!(select("node server.js"), TransportKind::Stdio);
        assert_eq!(select("/usr/local/bin/mcp-tool --flag"), TransportKind::Stdio);
    }

    #[test]
    fn test_websocket_urls() {
        assert_eq!(select("ws://host/socket"), TransportKind::WebSocket);
        assert_eq!(select("wss://host/socket"), TransportKind::WebSocket);
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(
            TransportSelector::select("https://host/sse", Some("websocket")).unwrap(),
            TransportKind::WebSocket
        );
        assert_eq!(
            TransportSelector::select("node server.js", Some("http-streaming")).unwrap(),
            TransportKind::HttpStreaming
        );
        assert_eq!(
            TransportSelector::select("https://host/api", Some("stdio")).unwrap(),
            TransportKind::Stdio
        );
    }

    #[test]
    fn test_auto_defers_to_url() {
        assert_eq!(
            TransportSelector::select("https://host/api", Some("auto")).unwrap(),
            TransportKind::HttpStreaming
        );
        assert_eq!(
            TransportSelector::select("https://host/sse", Some("AUTO")).unwrap(),
            TransportKind::Sse
        );
    }

    #[test]
    fn test_unknown_override_is_config_error() {
        let err = TransportSelector::select("https://host/api", Some("telepathy")).unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("telepathy")),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }
}
