//! Bounded TCP listener.
//!
//! A connection slot is taken before `accept`, so once `max_connections`
//! sockets are live the listener stops pulling from the backlog until one
//! of them closes.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    /// The slot semaphore was closed; no further connections are accepted.
    #[error("listener closed")]
    Closed,
}

/// An accepted socket and the slot it occupies.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Released when dropped; hold it for the lifetime of the connection.
    pub slot: OwnedSemaphorePermit,
}

pub struct Listener {
    inner: TcpListener,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind `hostname:port`. Port 0 picks a free port.
    pub async fn bind(hostname: &str, port: u16, max_connections: usize) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind((hostname, port))
            .await
            .map_err(|source| ListenerError::Bind {
                address: format!("{hostname}:{port}"),
                source,
            })?;

        tracing::info!(
            address = ?inner.local_addr().ok(),
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            slots: Arc::new(Semaphore::new(max_connections.max(1))),
            max_connections,
        })
    }

    pub async fn accept(&self) -> Result<Accepted, ListenerError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        configure_socket(&stream);
        tracing::trace!(peer = %peer, free_slots = self.slots.available_permits(), "Accepted");

        Ok(Accepted { stream, peer, slot })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// TCP_NODELAY plus keepalive, for accepted and outbound sockets alike.
pub fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        tracing::debug!(error = %e, "Failed to enable TCP keepalive");
    }
}
