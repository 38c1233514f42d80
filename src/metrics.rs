//! Server metrics with Prometheus text exposition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total requests processed
    pub requests_total: AtomicU64,
    /// Requests denied by the policy chain
    pub requests_denied: AtomicU64,
    /// Requests that failed in dispatch
    pub requests_failed: AtomicU64,
    /// Tool calls
    pub tool_calls: AtomicU64,
    /// Active sessions
    pub active_sessions: AtomicU64,
    /// Sessions evicted for idleness
    pub sessions_evicted: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_denied(&self) {
        self.requests_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_calls(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_sessions(&self, count: u64) {
        self.active_sessions.store(count, Ordering::Relaxed);
    }

    pub fn inc_sessions_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP mcp_conduit_requests_total Total number of requests
# TYPE mcp_conduit_requests_total counter
mcp_conduit_requests_total {}

# HELP mcp_conduit_requests_denied Requests denied by the policy chain
# TYPE mcp_conduit_requests_denied counter
mcp_conduit_requests_denied {}

# HELP mcp_conduit_requests_failed Requests failed in dispatch
# TYPE mcp_conduit_requests_failed counter
mcp_conduit_requests_failed {}

# HELP mcp_conduit_tool_calls Tool calls count
# TYPE mcp_conduit_tool_calls counter
mcp_conduit_tool_calls {}

# HELP mcp_conduit_active_sessions Active sessions
# TYPE mcp_conduit_active_sessions gauge
mcp_conduit_active_sessions {}

# HELP mcp_conduit_sessions_evicted Sessions evicted for idleness
# TYPE mcp_conduit_sessions_evicted counter
mcp_conduit_sessions_evicted {}
"#,
            s.requests_total,
            s.requests_denied,
            s.requests_failed,
            s.tool_calls,
            s.active_sessions,
            s.sessions_evicted,
        )
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_denied: u64,
    pub requests_failed: u64,
    pub tool_calls: u64,
    pub active_sessions: u64,
    pub sessions_evicted: u64,
}
