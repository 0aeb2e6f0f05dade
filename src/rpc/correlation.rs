//! Per-connection correlation table: request id → waiting caller.
//!
//! Entries leave the table exactly once: on response, on timeout (the
//! caller's [`PendingGuard`] is dropped), or when the connection fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::rpc::error::RpcError;

type Slot = oneshot::Sender<Result<Bytes, RpcError>>;

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<u32, Slot>,
    next_id: u32,
    /// Set once the connection is torn down.
    failed: Option<RpcError>,
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    inner: Mutex<Inner>,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and register a waiter for it.
    ///
    /// Ids wrap around `u32`, skipping zero (heartbeats) and ids still pending.
    /// After [`fail_all`](Self::fail_all) the waiter resolves at once with
    /// the teardown error.
    pub fn register(self: &Arc<Self>) -> (PendingGuard, oneshot::Receiver<Result<Bytes, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if let Some(err) = inner.failed.clone() {
            drop(inner);
            let _ = tx.send(Err(err));
            let guard = PendingGuard {
                table: Arc::clone(self),
                id: 0,
            };
            return (guard, rx);
        }
        let id = loop {
            inner.next_id = inner.next_id.wrapping_add(1);
            let candidate = inner.next_id;
            if candidate != 0 && !inner.pending.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.pending.insert(id, tx);
        drop(inner);

        let guard = PendingGuard {
            table: Arc::clone(self),
            id,
        };
        (guard, rx)
    }

    /// Deliver a response body. Returns `false` if nobody is waiting any more.
    pub fn complete(&self, id: u32, body: Bytes) -> bool {
        let slot = self.lock().pending.remove(&id);
        match slot {
            Some(tx) => tx.send(Ok(body)).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter when the connection is torn down. Later
    /// registrations fail with the same error.
    pub fn fail_all(&self, err: RpcError) -> usize {
        let drained: Vec<Slot> = {
            let mut inner = self.lock();
            inner.failed = Some(err.clone());
            inner.pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u32) {
        self.lock().pending.remove(&id);
    }

    #[cfg(test)]
    fn set_next_id(&self, next: u32) {
        self.lock().next_id = next;
    }
}

/// Removes its entry when dropped, so abandoned calls never leak.
#[derive(Debug)]
pub struct PendingGuard {
    table: Arc<CorrelationTable>,
    id: u32,
}

impl PendingGuard {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_reaches_waiter() {
        let table = CorrelationTable::new();
        let (guard, rx) = table.register();
        assert!(table.complete(guard.id(), Bytes::from_static(b"ok")));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
        assert!(table.is_empty());
    }

    #[test]
    fn dropped_guard_makes_late_response_a_no_op() {
        let table = CorrelationTable::new();
        let (guard, _rx) = table.register();
        let id = guard.id();
        drop(guard);
        assert!(table.is_empty());
        assert!(!table.complete(id, Bytes::new()));
    }

    #[test]
    fn ids_skip_zero_and_pending_entries() {
        let table = CorrelationTable::new();
        table.set_next_id(u32::MAX - 1);
        let (a, _ra) = table.register();
        assert_eq!(a.id(), u32::MAX);
        let (b, _rb) = table.register();
        assert_eq!(b.id(), 1);

        // Wrap around again while 1 is still pending.
        table.set_next_id(0);
        let (c, _rc) = table.register();
        assert_eq!(c.id(), 2);
    }

    #[tokio::test]
    async fn fail_all_reaches_every_waiter() {
        let table = CorrelationTable::new();
        let (_g1, r1) = table.register();
        let (_g2, r2) = table.register();
        assert_eq!(table.fail_all(RpcError::Transport("lost".into())), 2);
        assert_eq!(r1.await.unwrap(), Err(RpcError::Transport("lost".into())));
        assert!(matches!(r2.await.unwrap(), Err(RpcError::Transport(_))));
    }

    #[tokio::test]
    async fn registering_after_teardown_fails_at_once() {
        let table = CorrelationTable::new();
        table.fail_all(RpcError::Transport("lost".into()));

        let (guard, rx) = table.register();
        assert!(table.is_empty());
        assert!(!table.complete(guard.id(), Bytes::new()));
        let reply = tokio::time::timeout(std::time::Duration::from_millis(100), rx)
            .await
            .expect("waiter must not hang");
        assert_eq!(reply.unwrap(), Err(RpcError::Transport("lost".into())));
    }
}
