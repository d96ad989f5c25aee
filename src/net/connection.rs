//! Connection identity and live-connection tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and HTTP/2 pool keys
//! - Count live sockets and WebSocket tunnels
//! - Let shutdown wait until every tracked connection has closed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::observability::metrics;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an accepted socket or tunnel. Also names the HTTP/2 session
/// a downstream connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a tracked entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Socket,
    Tunnel,
}

impl ConnectionKind {
    fn label(&self) -> &'static str {
        match self {
            ConnectionKind::Socket => "socket",
            ConnectionKind::Tunnel => "tunnel",
        }
    }
}

/// Tracks live connections for shutdown.
///
/// The count is published over a watch channel so draining does not poll.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new live connection. Returns a guard that decrements on drop.
    pub fn track(&self, kind: ConnectionKind) -> ConnectionGuard {
        let id = ConnectionId::next();
        self.active.send_modify(|count| *count += 1);
        metrics::connection_opened(kind.label());
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id,
            kind,
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until every tracked connection has closed.
    pub async fn wait_for_drain(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
    kind: ConnectionKind,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|count| *count = count.saturating_sub(1));
        metrics::connection_closed(self.kind.label());
        tracing::trace!(connection_id = %self.id, kind = self.kind.label(), "Connection closed");
    }
}
