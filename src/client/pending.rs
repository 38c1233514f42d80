//! Correlation table for in-flight requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{Envelope, RequestId};

struct PendingEntry {
    tx: oneshot::Sender<Result<Envelope>>,
    created_at: Instant,
}

/// Maps outstanding request ids to their awaiting callers.
///
/// Owned exclusively by one client-transport pair: entries are added by the
/// call sites that enqueue requests and resolved by that connection's read
/// loop. Each entry resolves exactly once; a response for an id that is no
/// longer present (timed out, abandoned, or never issued) is discarded.
#[derive(Default)]
pub struct PendingRequestTable {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id and return the receiver its response will
    /// arrive on.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<Result<Envelope>> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            tx,
            created_at: Instant::now(),
        };
        self.entries.lock().unwrap().insert(id, entry);
        rx
    }

    /// Resolve the entry matching this response envelope.
    ///
    /// Returns `false` when no entry matches; the caller logs and drops the
    /// envelope rather than failing the connection.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(id) = envelope.id.clone() else {
            return false;
        };
        let entry = self.entries.lock().unwrap().remove(&id);
        match entry {
            Some(entry) => {
                debug!(
                    id = %id,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "resolving pending request"
                );
                // A caller that already gave up dropped its receiver; the
                // failed send is the discard the contract asks for.
                let _ = entry.tx.send(Ok(envelope));
                true
            }
            None => false,
        }
    }

    /// Drop one entry without resolving it (timeout or abandonment).
    pub fn remove(&self, id: &RequestId) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    /// Reject every outstanding entry, atomically with a connection close.
    pub fn reject_all(&self, make_error: impl Fn() -> Error) {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(make_error()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_permuted_responses_resolve_their_own_callers() {
        let table = PendingRequestTable::new();
        let receivers: Vec<_> = (0..5)
            .map(|n| (n, table.register(RequestId::Number(n))))
            .collect();
        assert_eq!(table.len(), 5);

        // Deliver responses in an arbitrary permuted order.
        for n in [3, 0, 4, 2, 1] {
            let resolved = table.resolve(Envelope::response(
                RequestId::Number(n),
                json!({ "n": n }),
            ));
            assert!(resolved);
        }
        assert!(table.is_empty());

        for (n, rx) in receivers {
            let envelope = rx.await.unwrap().unwrap();
            assert_eq!(envelope.into_result().unwrap(), json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn test_unknown_id_discarded() {
        let table = PendingRequestTable::new();
        let _rx = table.register(RequestId::Number(1));

        let resolved = table.resolve(Envelope::response(RequestId::Number(99), json!({})));
        assert!(!resolved);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_resolution_is_exactly_once() {
        let table = PendingRequestTable::new();
        let rx = table.register(RequestId::Number(1));

        assert!(table.resolve(Envelope::response(RequestId::Number(1), json!(1))));
        // The second copy has no entry to land in.
        assert!(!table.resolve(Envelope::response(RequestId::Number(1), json!(2))));

        let envelope = rx.await.unwrap().unwrap();
        assert_eq!(envelope.into_result().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_removed_entry_discards_late_response() {
        let table = PendingRequestTable::new();
        let mut rx = table.register(RequestId::Number(7));

        assert!(table.remove(&RequestId::Number(7)));
        assert!(!table.resolve(Envelope::response(RequestId::Number(7), json!({}))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_all_fails_every_waiter() {
        let table = PendingRequestTable::new();
        let receivers: Vec<_> = (0..3).map(|n| table.register(RequestId::Number(n))).collect();

        table.reject_all(|| Error::ConnectionClosed);
        assert!(table.is_empty());

        for rx in receivers {
            match rx.await.unwrap() {
                Err(Error::ConnectionClosed) => {}
                other => panic!("Expected ConnectionClosed, got {:?}", other),
            }
        }
    }
}
