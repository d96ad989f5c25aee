//! WebSocket relay.
//!
//! # Data Flow
//! ```text
//! inbound GET + Upgrade
//!     → outbound GET + Upgrade (rewritten headers)
//!     → upstream answers 101?
//!         no  → relay status, reason, headers and body; close the connection
//!         yes → answer 101 downstream, then pipe both upgraded sockets
//!               in a tracked tunnel task
//! ```
//!
//! Bytes either peer sent ahead of the handshake completing are kept in
//! hyper's upgraded streams, so nothing is lost before the pipe starts.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use crate::config::upstream::Upstream;
use crate::context::Context;
use crate::error::ProxyError;
use crate::http::response::Relayed;
use crate::lifecycle::shutdown::{ShutdownSignal, ShutdownState};
use crate::net::connection::{ConnectionKind, ConnectionTracker};
use crate::net::idle::IdleHandle;
use crate::observability::metrics;
use crate::relay::connector::connect;
use crate::relay::{prepare_outbound, response_headers, ProxyOverride, RelaySettings};

/// Resources a tunnel needs from the connection that requested it.
#[derive(Debug, Clone)]
pub struct TunnelScope {
    pub connections: ConnectionTracker,
    pub shutdown: ShutdownSignal,
    pub inbound_idle: Option<IdleHandle>,
}

#[derive(Debug)]
pub struct WebSocketRelay {
    settings: Arc<RelaySettings>,
}

impl WebSocketRelay {
    pub fn new(settings: Arc<RelaySettings>) -> Self {
        Self { settings }
    }

    pub async fn proxy(
        &self,
        upstream: &Upstream,
        mut req: Request<Body>,
        ctx: &Context,
        ov: Option<ProxyOverride>,
        scope: &TunnelScope,
    ) -> Result<Response<Body>, ProxyError> {
        let ov = ov.unwrap_or_default();
        let inbound_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();

        let (mut options, mut headers) =
            prepare_outbound(&self.settings, upstream, &parts.method, &parts.uri, &parts.headers, &ov, ctx)?;
        options.method = Method::GET;
        if !headers.contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::from_str(&options.target.host_header()) {
                headers.insert(header::HOST, host);
            }
        }

        let mut outbound = Request::builder()
            .method(Method::GET)
            .uri(options.path.as_str())
            .body(Body::empty())?;
        *outbound.headers_mut() = headers;

        tracing::debug!(
            target = %options.target.authority(),
            path = %options.path,
            "Relaying WebSocket upgrade"
        );

        let timeout = self.settings.timeout;
        let authority = options.target.authority();
        let (io, outbound_idle) = connect(&options.target, timeout, false).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(authority = %authority, error = %e, "Upstream upgrade connection failed");
            }
        });

        let mut response = tokio::time::timeout(timeout, sender.send_request(outbound))
            .await
            .map_err(|_| ProxyError::Timeout(timeout))??;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::info!(
                status = %response.status(),
                "Upstream refused the WebSocket upgrade"
            );
            let (mut parts, body) = response.into_parts();
            parts.headers = response_headers(&self.settings, upstream, &ov, &parts.headers);
            parts
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            parts.extensions.insert(Relayed);
            return Ok(Response::from_parts(parts, Body::new(body)));
        }

        let outbound_upgrade = hyper::upgrade::on(&mut response);
        let headers = response_headers(&self.settings, upstream, &ov, response.headers());

        outbound_idle.disable();
        if let Some(idle) = &scope.inbound_idle {
            idle.disable();
        }

        let guard = scope.connections.track(ConnectionKind::Tunnel);
        let mut shutdown = scope.shutdown.clone();
        let tunnel_id = guard.id();
        metrics::websocket_tunnel_opened();
        tokio::spawn(async move {
            let _guard = guard;
            let pipe = async {
                let (inbound, outbound) = tokio::try_join!(inbound_upgrade, outbound_upgrade)?;
                let mut inbound = TokioIo::new(inbound);
                let mut outbound = TokioIo::new(outbound);
                let copied = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
                Ok::<_, ProxyError>(copied)
            };

            tokio::select! {
                result = pipe => match result {
                    Ok((sent, received)) => tracing::debug!(
                        tunnel = %tunnel_id, sent, received, "WebSocket tunnel closed"
                    ),
                    Err(e) => tracing::warn!(tunnel = %tunnel_id, error = %e, "WebSocket tunnel failed"),
                },
                _ = shutdown.reached(ShutdownState::Forced) => {
                    tracing::debug!(tunnel = %tunnel_id, "WebSocket tunnel destroyed by shutdown");
                }
            }
            metrics::websocket_tunnel_closed();
        });

        let mut switching = Response::new(Body::empty());
        *switching.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *switching.headers_mut() = headers;
        switching.extensions_mut().insert(Relayed);
        Ok(switching)
    }
}
