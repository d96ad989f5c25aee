//! Dispatcher: listener, connection drivers and shutdown.
//!
//! # Responsibilities
//! - Pick the server mode once from protocol and TLS material
//! - Accept connections, wrap them in idle timeouts, terminate TLS
//! - Drive each connection with hyper (HTTP/1.1, or HTTP/2 with fallback)
//! - Hand every request, stream and upgrade to [`ConnectionService`]
//! - Stop gracefully (drain) or forcefully (destroy)
//!
//! # Design Decisions
//! - One task per connection; shutdown reaches it through a watch channel
//! - Graceful stop is bounded by the proxy timeout, then escalates to forced
//! - A stopped dispatcher can be started again

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::schema::Protocol;
use crate::config::upstream::Configuration;
use crate::error::ProxyError;
use crate::http::service::{ConnectionService, SessionScope, Shared};
use crate::lifecycle::hooks::HookRunner;
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal, ShutdownState};
use crate::net::connection::{ConnectionGuard, ConnectionKind, ConnectionTracker};
use crate::net::idle::IdleTimeout;
use crate::net::listener::{Accepted, Listener, ListenerError};
use crate::net::tls::server_acceptor;
use crate::relay::websocket::TunnelScope;
use crate::relay::{Http1Relay, Http2Relay, WebSocketRelay};
use crate::routing::Router;

const ALPN_H2: &[&[u8]] = &[b"h2", b"http/1.1"];
const ALPN_HTTP1: &[&[u8]] = &[b"http/1.1"];

/// Listener flavour, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Http1Plain,
    Http1Tls,
    /// h2c with HTTP/1.1 fallback by preface detection.
    Http2Plain,
    /// h2 with HTTP/1.1 fallback by ALPN.
    Http2Tls,
}

impl ServerMode {
    pub fn select(protocol: Protocol, tls: bool) -> Self {
        match (protocol, tls) {
            (Protocol::Http, false) => ServerMode::Http1Plain,
            (Protocol::Http, true) => ServerMode::Http1Tls,
            (Protocol::Http2, false) => ServerMode::Http2Plain,
            (Protocol::Http2, true) => ServerMode::Http2Tls,
        }
    }

    pub fn is_http2(self) -> bool {
        matches!(self, ServerMode::Http2Plain | ServerMode::Http2Tls)
    }

    pub fn is_tls(self) -> bool {
        matches!(self, ServerMode::Http1Tls | ServerMode::Http2Tls)
    }

    fn alpn(self) -> &'static [&'static [u8]] {
        if self.is_http2() {
            ALPN_H2
        } else {
            ALPN_HTTP1
        }
    }
}

struct Running {
    shutdown: Shutdown,
    connections: ConnectionTracker,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The reverse proxy server.
pub struct Dispatcher {
    hostname: String,
    port: u16,
    max_connections: usize,
    mode: ServerMode,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    /// Shutdown of a graceful stop in progress, so `stop(true)` can escalate it.
    stopping: std::sync::Mutex<Option<Shutdown>>,
}

impl Dispatcher {
    pub fn new(config: Configuration) -> Result<Self, ProxyError> {
        let mode = ServerMode::select(config.mode, config.tls.is_some());
        let acceptor = match &config.tls {
            Some(material) => Some(server_acceptor(material, mode.alpn())?),
            None => None,
        };

        let settings = Arc::new(config.relay_settings());
        let shared = Arc::new(Shared {
            router: Router::new(config.upstreams.clone()),
            http1: Arc::new(Http1Relay::new(Arc::clone(&settings))),
            http2: Arc::new(Http2Relay::new(Arc::clone(&settings))),
            websocket: Arc::new(WebSocketRelay::new(Arc::clone(&settings))),
            settings,
            hooks: HookRunner::new(config.hooks.clone()),
            error_handler: config.error_handler.clone(),
        });

        Ok(Self {
            hostname: config.hostname,
            port: config.port,
            max_connections: config.max_connections,
            mode,
            acceptor,
            shared,
            running: Mutex::new(None),
            stopping: std::sync::Mutex::new(None),
        })
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// Outbound HTTP/2 sessions currently pooled.
    pub fn pooled_sessions(&self) -> usize {
        self.shared.http2.pooled_sessions()
    }

    /// Accepted sockets plus open WebSocket tunnels; 0 when stopped.
    pub async fn active_connections(&self) -> u64 {
        match &*self.running.lock().await {
            Some(running) => running.connections.active_count(),
            None => 0,
        }
    }

    /// Address of the running listener.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let listener = Listener::bind(&self.hostname, self.port, self.max_connections).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Shutdown::new();
        let connections = ConnectionTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.mode,
            self.acceptor.clone(),
            shutdown.clone(),
            connections.clone(),
        ));

        tracing::info!(address = %local_addr, mode = ?self.mode, "Dispatcher started");
        *running = Some(Running {
            shutdown,
            connections,
            accept_task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting and close connections.
    ///
    /// Without `force`, in-flight work drains for up to the proxy timeout
    /// before the remaining connections are destroyed. With `force`,
    /// sockets, tunnels and pooled upstream sessions are destroyed at once.
    pub async fn stop(&self, force: bool) -> Result<(), ProxyError> {
        let Some(running) = self.running.lock().await.take() else {
            match self.stopping_shutdown() {
                Some(shutdown) if force => {
                    tracing::info!("Escalating stop in progress to forced");
                    self.force(&shutdown);
                }
                _ => tracing::debug!("Dispatcher is not running"),
            }
            return Ok(());
        };
        let timeout = self.shared.timeout();

        if force {
            self.force(&running.shutdown);
        } else {
            tracing::info!(
                active = running.connections.active_count(),
                "Draining connections"
            );
            self.set_stopping(Some(running.shutdown.clone()));
            running.shutdown.trigger(ShutdownState::Draining);
            if tokio::time::timeout(timeout, running.connections.wait_for_drain())
                .await
                .is_err()
            {
                tracing::warn!(
                    remaining = running.connections.active_count(),
                    "Drain deadline passed, forcing shutdown"
                );
                self.force(&running.shutdown);
            }
        }

        running.connections.wait_for_drain().await;
        if let Err(e) = running.accept_task.await {
            tracing::error!(error = %e, "Accept task failed");
        }
        self.set_stopping(None);
        tracing::info!(address = %running.local_addr, "Dispatcher stopped");
        Ok(())
    }

    fn stopping_shutdown(&self) -> Option<Shutdown> {
        self.stopping
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_stopping(&self, shutdown: Option<Shutdown>) {
        *self
            .stopping
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = shutdown;
    }

    fn force(&self, shutdown: &Shutdown) {
        shutdown.trigger(ShutdownState::Forced);
        self.shared.http2.close_all_connections();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .finish()
    }
}

async fn accept_loop(
    listener: Listener,
    shared: Arc<Shared>,
    mode: ServerMode,
    acceptor: Option<TlsAcceptor>,
    shutdown: Shutdown,
    connections: ConnectionTracker,
) {
    let mut signal = shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = signal.reached(ShutdownState::Draining) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(Accepted { stream, peer, slot }) => {
                let guard = connections.track(ConnectionKind::Socket);
                let task = ConnectionTask {
                    shared: Arc::clone(&shared),
                    mode,
                    acceptor: acceptor.clone(),
                    shutdown: shutdown.subscribe(),
                    connections: connections.clone(),
                };
                tokio::spawn(async move {
                    let _slot = slot;
                    task.run(stream, peer, guard).await;
                });
            }
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    tracing::debug!("Accept loop finished");
}

struct ConnectionTask {
    shared: Arc<Shared>,
    mode: ServerMode,
    acceptor: Option<TlsAcceptor>,
    shutdown: ShutdownSignal,
    connections: ConnectionTracker,
}

impl ConnectionTask {
    async fn run(self, stream: TcpStream, peer: SocketAddr, guard: ConnectionGuard) {
        let timeout = self.shared.timeout();
        let (io, idle) = IdleTimeout::new(stream, timeout);
        let service = ConnectionService {
            shared: Arc::clone(&self.shared),
            peer,
            connection: guard.id(),
            scope: TunnelScope {
                connections: self.connections.clone(),
                shutdown: self.shutdown.clone(),
                inbound_idle: Some(idle),
            },
            session: Arc::new(SessionScope::new()),
        };

        match &self.acceptor {
            None => drive(io, self.mode, service.clone(), self.shutdown.clone()).await,
            Some(acceptor) => {
                let mut forced = self.shutdown.clone();
                let handshake = tokio::select! {
                    result = tokio::time::timeout(timeout, acceptor.accept(io)) => Some(result),
                    _ = forced.reached(ShutdownState::Forced) => None,
                };
                match handshake {
                    Some(Ok(Ok(tls))) => drive(tls, self.mode, service.clone(), self.shutdown.clone()).await,
                    Some(Ok(Err(e))) => tracing::debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    Some(Err(_)) => tracing::debug!(peer = %peer, "TLS handshake timed out"),
                    None => tracing::debug!(peer = %peer, "TLS handshake abandoned by shutdown"),
                }
            }
        }

        service.finish();
        drop(guard);
    }
}

/// Serve one connection until it ends or shutdown destroys it.
async fn drive<I>(io: I, mode: ServerMode, service: ConnectionService, mut shutdown: ShutdownSignal)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = service.connection;
    let timeout = service.shared.timeout();
    let session = Arc::clone(&service.session);
    let io = TokioIo::new(io);
    let svc = service_fn(move |req| service.clone().call(req));
    let mut closing = shutdown.state() >= ShutdownState::Draining;

    if mode.is_http2() {
        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection_with_upgrades(io, svc);
        tokio::pin!(conn);
        let session_idle = session.idle(timeout);
        tokio::pin!(session_idle);
        if closing {
            conn.as_mut().graceful_shutdown();
        }

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(connection_id = %connection, error = %e, "Connection closed with error");
                    }
                    break;
                }
                state = shutdown.changed() => match state {
                    ShutdownState::Forced => {
                        tracing::debug!(connection_id = %connection, "Connection destroyed by shutdown");
                        break;
                    }
                    ShutdownState::Draining if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    _ => {}
                },
                _ = &mut session_idle, if !closing => {
                    tracing::debug!(connection_id = %connection, "HTTP/2 session idle, closing");
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    } else {
        let conn = http1::Builder::new()
            .serve_connection(io, svc)
            .with_upgrades();
        tokio::pin!(conn);
        if closing {
            conn.as_mut().graceful_shutdown();
        }

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(connection_id = %connection, error = %e, "Connection closed with error");
                    }
                    break;
                }
                state = shutdown.changed() => match state {
                    ShutdownState::Forced => {
                        tracing::debug!(connection_id = %connection, "Connection destroyed by shutdown");
                        break;
                    }
                    ShutdownState::Draining if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    _ => {}
                },
            }
        }
    }
}
