//! Keyed client pool: one cached connection per logical key.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::client::{ClientState, McpClient};
use crate::config::ClientOptions;
use crate::error::Result;

/// Explicit registry of connected clients.
///
/// Entries are created lazily by [`get_or_connect`](Self::get_or_connect)
/// and removed only by [`close`](Self::close) / [`close_all`](Self::close_all);
/// there is no background eviction. Construct one per scope that needs
/// isolation (tests build their own).
#[derive(Default)]
pub struct ClientPool {
    clients: DashMap<String, Arc<McpClient>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live cached client without connecting.
    pub fn get(&self, key: &str) -> Option<Arc<McpClient>> {
        self.clients
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|client| client.state() != ClientState::Closed)
    }

    /// Return the cached client for `key`, connecting a fresh one if the
    /// slot is empty or its connection has closed.
    pub async fn get_or_connect(&self, key: &str, options: ClientOptions) -> Result<Arc<McpClient>> {
        if let Some(client) = self.get(key) {
            return Ok(client);
        }

        let client = Arc::new(McpClient::new(options));
        client.connect().await?;

        // A racing connect for the same key may have landed first; the
        // earlier entry wins and the loser is closed.
        match self.clients.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing)
                if existing.get().state() != ClientState::Closed =>
            {
                let winner = Arc::clone(existing.get());
                drop(existing);
                client.close().await.ok();
                Ok(winner)
            }
            dashmap::mapref::entry::Entry::Occupied(mut stale) => {
                stale.insert(Arc::clone(&client));
                Ok(client)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(key, "pooled new client");
                slot.insert(Arc::clone(&client));
                Ok(client)
            }
        }
    }

    /// Close and remove one entry. A key with no entry is a no-op.
    pub async fn close(&self, key: &str) -> Result<()> {
        if let Some((_, client)) = self.clients.remove(key) {
            client.close().await?;
        }
        Ok(())
    }

    /// Close and remove every entry.
    pub async fn close_all(&self) -> Result<()> {
        let keys: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.close(&key).await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
