//! Connection ids and the live-connection count used for draining.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::observability::metrics;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id, shown as `conn-N` in logs and the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Live {
    count: AtomicU64,
    idle: Notify,
}

/// Counts connections between accept and close.
///
/// Cloning shares the count. `drain` wakes as soon as the last guard drops.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<Live>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> ConnectionGuard {
        let now = self.live.count.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_active_connections(now);
        ConnectionGuard {
            live: Arc::clone(&self.live),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.live.count.load(Ordering::Acquire)
    }

    /// `false` if connections were still open when `deadline` passed.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.live.idle.notified();
                tokio::pin!(idle);
                // Register before checking so a concurrent last drop is not missed.
                idle.as_mut().enable();
                if self.active_count() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

/// Held by a connection task; the count drops with it.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<Live>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let left = self.live.count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::set_active_connections(left);
        if left == 0 {
            self.live.idle.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
