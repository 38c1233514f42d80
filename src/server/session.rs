//! Server-side session tracking and idle eviction.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics::Metrics;

/// Credential material captured when the connection was accepted.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// API key presented via header, query parameter, or envelope field.
    pub api_key: Option<String>,
}

/// Fixed-window rate-limit state. Owned by one session and mutated only on
/// that session's request path.
#[derive(Debug)]
pub(crate) struct RateWindow {
    pub window_start: Instant,
    pub count: u32,
}

impl Default for RateWindow {
    fn default() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }
}

/// State for one accepted connection.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    auth: AuthContext,
    pub(crate) rate: Mutex<RateWindow>,
    cancel: CancellationToken,
}

impl Session {
    fn new(auth: AuthContext) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            auth,
            rate: Mutex::new(RateWindow::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Record inbound activity, pushing the eviction deadline out.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// How long the session has been without inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Token the connection loop watches; cancelled on eviction or close.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Tracks one session per accepted connection.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    idle_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            metrics,
        }
    }

    /// Allocate a session with a fresh id and zeroed rate-limit state.
    pub fn create(&self, auth: AuthContext) -> Arc<Session> {
        let session = Arc::new(Session::new(auth));
        debug!(session_id = %session.id(), "session created");
        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        self.metrics.set_active_sessions(self.sessions.len() as u64);
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session and cancel its connection.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if let Some(ref session) = removed {
            session.cancel.cancel();
            debug!(session_id = %id, "session removed");
            self.metrics.set_active_sessions(self.sessions.len() as u64);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Evict every session idle past the configured timeout, cancelling its
    /// connection. Returns the number evicted.
    pub fn evict_idle(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            info!(session_id = %id, "evicting idle session");
            self.remove(id);
            self.metrics.inc_sessions_evicted();
        }
        expired.len()
    }

    /// Spawn the periodic idle sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = (self.idle_timeout / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.evict_idle();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(idle: Duration) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(idle, Metrics::new()))
    }

    #[test]
    fn test_create_assigns_unique_ids_and_zeroed_rate_state() {
        let manager = manager(Duration::from_secs(300));
        let a = manager.create(AuthContext::default());
        let b = manager.create(AuthContext::default());

        assert_ne!(a.id(), b.id());
        assert_eq!(manager.len(), 2);
        assert_eq!(a.rate.lock().unwrap().count, 0);
        assert!(!a.is_closed());
    }

    #[test]
    fn test_remove_cancels_connection() {
        let manager = manager(Duration::from_secs(300));
        let session = manager.create(AuthContext::default());
        let token = session.cancellation();

        manager.remove(session.id());
        assert!(token.is_cancelled());
        assert!(session.is_closed());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_evict_idle_removes_only_stale_sessions() {
        let manager = manager(Duration::from_millis(30));
        let stale = manager.create(AuthContext::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = manager.create(AuthContext::default());

        let evicted = manager.evict_idle();
        assert_eq!(evicted, 1);
        assert!(manager.get(stale.id()).is_none());
        assert!(manager.get(fresh.id()).is_some());
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());
    }

    #[tokio::test]
    async fn test_touch_defers_eviction() {
        let manager = manager(Duration::from_millis(40));
        let session = manager.create(AuthContext::default());

        tokio::time::sleep(Duration::from_millis(25)).await;
        session.touch();
        tokio::time::sleep(Duration::from_millis(25)).await;

        // Idle clock restarted at touch time.
        assert_eq!(manager.evict_idle(), 0);
        assert!(manager.get(session.id()).is_some());
    }

    #[tokio::test]
    async fn test_sweeper_evicts_in_background() {
        let manager = manager(Duration::from_millis(30));
        let session = manager.create(AuthContext::default());
        let sweeper = manager.spawn_sweeper();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(manager.get(session.id()).is_none());
        sweeper.abort();
    }
}
