//! HTTP/2 relay with per-session outbound pooling.
//!
//! # Responsibilities
//! - Keep at most one outbound HTTP/2 session per (downstream session, target)
//! - Open outbound streams on the pooled session for each inbound stream
//! - Drop pool entries together with the sessions they point at
//!
//! # Design Decisions
//! - Pool mutations go through `DashMap::entry`/`remove_if`/`retain`, which
//!   hold the shard lock for the whole check-then-set; nothing awaits inside
//! - Each outbound session has a driver task; its pool entry is removed when
//!   the driver ends, and aborting the driver closes the session
//! - Streams that arrive while a session is connecting wait on a watch
//!   channel; a failed connect clears the entry and fails every waiter

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, Response, Version};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hyper::client::conn::http2::SendRequest;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::config::upstream::Upstream;
use crate::context::Context;
use crate::error::ProxyError;
use crate::http::request::Target;
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::relay::connector::connect;
use crate::relay::{finish_response, prepare_outbound, ProxyOverride, RelaySettings};

/// Headers that are not allowed on HTTP/2 messages.
const CONNECTION_SPECIFIC: [header::HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HeaderName::from_static("keep-alive"),
    header::HeaderName::from_static("proxy-connection"),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    session: ConnectionId,
    /// `scheme://host:port` of the target.
    origin: String,
}

#[derive(Clone)]
enum SessionState {
    Connecting,
    Ready(SendRequest<Body>),
    Failed(String),
    Closed,
}

struct PooledSession {
    id: u64,
    state: watch::Receiver<SessionState>,
    driver: AbortHandle,
}

impl PooledSession {
    fn is_closed(&self) -> bool {
        match &*self.state.borrow() {
            SessionState::Connecting => false,
            SessionState::Ready(sender) => sender.is_closed(),
            SessionState::Failed(_) | SessionState::Closed => true,
        }
    }

    fn close(&self) {
        self.driver.abort();
    }

    async fn sender(&self) -> Result<SendRequest<Body>, String> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, SessionState::Connecting))
            .await
            .map(|s| (*s).clone());
        match settled {
            Ok(SessionState::Ready(sender)) => Ok(sender),
            Ok(SessionState::Failed(reason)) => Err(reason),
            _ => Err("session closed".to_string()),
        }
    }
}

pub struct Http2Relay {
    settings: Arc<RelaySettings>,
    pool: Arc<DashMap<PoolKey, Arc<PooledSession>>>,
    next_id: AtomicU64,
}

impl Http2Relay {
    pub fn new(settings: Arc<RelaySettings>) -> Self {
        Self {
            settings,
            pool: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of outbound sessions currently pooled.
    pub fn pooled_sessions(&self) -> usize {
        self.pool.len()
    }

    pub async fn proxy(
        &self,
        session: ConnectionId,
        upstream: &Upstream,
        req: Request<Body>,
        ctx: &Context,
        ov: Option<ProxyOverride>,
    ) -> Result<Response<Body>, ProxyError> {
        let ov = ov.unwrap_or_default();
        let (parts, body) = req.into_parts();
        let (options, mut headers) =
            prepare_outbound(&self.settings, upstream, &parts.method, &parts.uri, &parts.headers, &ov, ctx)?;

        for name in &CONNECTION_SPECIFIC {
            headers.remove(name);
        }
        let authority = authority_for(&mut headers, &options.target);
        let uri = format!("{}://{}{}", options.target.scheme(), authority, options.path);

        let mut outbound = Request::builder()
            .method(options.method.clone())
            .uri(uri)
            .version(Version::HTTP_2)
            .body(body)?;
        *outbound.headers_mut() = headers;

        tracing::debug!(
            session = %session,
            method = %options.method,
            target = %options.target.authority(),
            path = %options.path,
            "Relaying HTTP/2 stream"
        );

        let mut sender = self.session_for(session, &options.target).await?;
        sender.ready().await?;
        let response = sender.send_request(outbound).await?;

        let (parts, body) = response.into_parts();
        finish_response(&self.settings, upstream, &ov, ctx, parts, Body::new(body)).await
    }

    /// Pooled sender for `(session, target)`, connecting on first use.
    async fn session_for(&self, session: ConnectionId, target: &Target) -> Result<SendRequest<Body>, ProxyError> {
        let key = PoolKey {
            session,
            origin: format!("{}://{}", target.scheme(), target.authority()),
        };

        let pooled = match self.pool.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    let fresh = self.spawn_session(key, target.clone());
                    entry.insert(Arc::clone(&fresh)).close();
                    fresh
                } else {
                    Arc::clone(entry.get())
                }
            }
            Entry::Vacant(entry) => {
                let fresh = self.spawn_session(key, target.clone());
                entry.insert(Arc::clone(&fresh));
                fresh
            }
        };

        pooled.sender().await.map_err(|reason| ProxyError::SessionFailed {
            authority: target.authority(),
            reason,
        })
    }

    fn spawn_session(&self, key: PoolKey, target: Target) -> Arc<PooledSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(SessionState::Connecting);
        let pool = Arc::clone(&self.pool);
        let timeout = self.settings.timeout;

        let driver = tokio::spawn(async move {
            let connected = async {
                let (io, _idle) = connect(&target, timeout, true).await?;
                let handshake =
                    hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
                Ok::<_, ProxyError>(handshake)
            }
            .await;

            match connected {
                Ok((sender, conn)) => {
                    tx.send_replace(SessionState::Ready(sender));
                    metrics::http2_session_opened();
                    tracing::debug!(session = %key.session, origin = %key.origin, "Upstream HTTP/2 session opened");

                    if let Err(e) = conn.await {
                        tracing::debug!(origin = %key.origin, error = %e, "Upstream HTTP/2 session failed");
                    }
                    tx.send_replace(SessionState::Closed);
                }
                Err(e) => {
                    tracing::warn!(origin = %key.origin, error = %e, "Upstream HTTP/2 connect failed");
                    tx.send_replace(SessionState::Failed(e.to_string()));
                }
            }

            pool.remove_if(&key, |_, pooled| pooled.id == id);
            metrics::pooled_sessions(pool.len());
        });

        Arc::new(PooledSession {
            id,
            state: rx,
            driver: driver.abort_handle(),
        })
    }

    /// Close and forget every outbound session of a downstream session.
    pub fn release_session(&self, session: ConnectionId) {
        self.pool.retain(|key, pooled| {
            if key.session == session {
                pooled.close();
                false
            } else {
                true
            }
        });
        metrics::pooled_sessions(self.pool.len());
    }

    /// Close every pooled session, regardless of in-flight streams.
    pub fn close_all_connections(&self) {
        let closed = self.pool.len();
        self.pool.retain(|_, pooled| {
            pooled.close();
            false
        });
        metrics::pooled_sessions(0);
        if closed > 0 {
            tracing::info!(closed, "Closed pooled HTTP/2 sessions");
        }
    }
}

impl std::fmt::Debug for Http2Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Relay")
            .field("pooled_sessions", &self.pool.len())
            .finish()
    }
}

/// `:authority` for the outbound stream. A `host` header left by the rewrite
/// layers wins over the target and is moved into the pseudo-header.
fn authority_for(headers: &mut HeaderMap, target: &Target) -> String {
    match headers.remove(header::HOST) {
        Some(host) => match host.to_str() {
            Ok(host) => host.to_string(),
            Err(_) => target.host_header(),
        },
        None => target.host_header(),
    }
}
