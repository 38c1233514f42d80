//! Security policies evaluated before request dispatch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::envelope::error_codes;
use crate::protocol::Envelope;
use crate::server::session::Session;

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { code: i32, reason: String },
}

impl Decision {
    pub fn deny(code: i32, reason: impl Into<String>) -> Self {
        Self::Deny {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// A policy inspects one request in the context of its session and either
/// allows it onward or denies it with a reason. Policies are pure with
/// respect to the request: any state they keep lives on the session.
pub trait SecurityPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, request: &Envelope, session: &Session) -> Decision;

    /// Whether a deny from this policy should also close the session.
    fn disconnect_on_deny(&self) -> bool {
        false
    }
}

/// Chain outcome: the decision plus whether the denying policy wants the
/// session closed.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub decision: Decision,
    pub disconnect: bool,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            disconnect: false,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision.is_allow()
    }
}

/// Ordered policy chain. Evaluation runs in registration order and the
/// first deny short-circuits the rest.
#[derive(Default)]
pub struct PolicyChain {
    policies: Vec<Arc<dyn SecurityPolicy>>,
}

impl PolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, policy: impl SecurityPolicy + 'static) {
        self.policies.push(Arc::new(policy));
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn evaluate(&self, request: &Envelope, session: &Session) -> Verdict {
        for policy in &self.policies {
            match policy.evaluate(request, session) {
                Decision::Allow => {}
                deny @ Decision::Deny { .. } => {
                    if let Decision::Deny { ref reason, .. } = deny {
                        warn!(
                            policy = policy.name(),
                            session_id = %session.id(),
                            reason,
                            "request denied"
                        );
                    }
                    return Verdict {
                        decision: deny,
                        disconnect: policy.disconnect_on_deny(),
                    };
                }
            }
        }
        Verdict::allow()
    }
}

/// Denies requests whose session presented no credential, or one outside
/// the configured key set. The credential normally arrives with the
/// connection (header or query parameter); an envelope-level
/// `_meta.api_key` field covers transports with no carrier of their own.
pub struct ApiKeyPolicy {
    keys: HashSet<String>,
    disconnect_on_deny: bool,
}

impl ApiKeyPolicy {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            disconnect_on_deny: false,
        }
    }

    /// Also close the session when a request is denied.
    pub fn with_disconnect_on_deny(mut self, disconnect: bool) -> Self {
        self.disconnect_on_deny = disconnect;
        self
    }

    fn presented_key<'a>(&self, request: &'a Envelope, session: &'a Session) -> Option<&'a str> {
        if let Some(key) = session.auth().api_key.as_deref() {
            return Some(key);
        }
        request
            .params
            .as_ref()
            .and_then(|params| params.pointer("/_meta/api_key"))
            .and_then(Value::as_str)
    }
}

impl SecurityPolicy for ApiKeyPolicy {
    fn name(&self) -> &'static str {
        "api-key"
    }

    fn evaluate(&self, request: &Envelope, session: &Session) -> Decision {
        match self.presented_key(request, session) {
            Some(key) if self.keys.contains(key) => Decision::Allow,
            Some(_) => Decision::deny(error_codes::AUTH_DENIED, "unknown API key"),
            None => Decision::deny(error_codes::AUTH_DENIED, "missing API key"),
        }
    }

    fn disconnect_on_deny(&self) -> bool {
        self.disconnect_on_deny
    }
}

/// Fixed-window rate limiter keyed by session.
///
/// The window counter lives on the session and is touched only from that
/// session's request path; it resets when the window boundary passes and
/// can never go negative.
pub struct RateLimitPolicy {
    limit: u32,
    window: Duration,
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

impl SecurityPolicy for RateLimitPolicy {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn evaluate(&self, _request: &Envelope, session: &Session) -> Decision {
        let now = Instant::now();
        let mut window = session.rate.lock().unwrap();

        if now.duration_since(window.window_start) >= self.window {
            window.window_start = now;
            window.count = 0;
        }

        if window.count < self.limit {
            window.count += 1;
            debug!(
                session_id = %session.id(),
                used = window.count,
                limit = self.limit,
                "rate window"
            );
            Decision::Allow
        } else {
            Decision::deny(
                error_codes::RATE_LIMITED,
                format!(
                    "rate limit of {} requests per {:?} exceeded",
                    self.limit, self.window
                ),
            )
        }
    }
}
