//! Per-connection request pipeline.
//!
//! # Data Flow
//! ```text
//! hyper request (HTTP/1.1 request, HTTP/2 stream, or upgrade)
//!     → Context (HTTP/2: child of the session context)
//!     → route match → seed response headers → before hook
//!     → handler (panics caught)
//!     → on error: upstream error handler | global error handler | fallback 500
//!     → after hook when the response body finishes or is dropped
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode, Version};
use futures_util::FutureExt;
use hyper::body::Incoming;
use tokio::sync::watch;
use tracing::Instrument;

use crate::config::upstream::Upstream;
use crate::context::Context;
use crate::error::ProxyError;
use crate::http::body::TrackedBody;
use crate::http::handler::{ErrorHandler, ProxyRequest, WebSocketProxy};
use crate::http::headers::prepare_headers;
use crate::http::request::{is_upgrade, is_websocket_upgrade, RequestHead};
use crate::http::response::{apply_seed_headers, fallback_response, rejection, FALLBACK_MESSAGE};
use crate::lifecycle::hooks::HookRunner;
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::relay::websocket::TunnelScope;
use crate::relay::{Http1Relay, Http2Relay, RelaySettings, WebSocketRelay};
use crate::routing::{RouteKind, Router};

/// State shared by every connection of one running dispatcher.
pub(crate) struct Shared {
    pub router: Router,
    pub settings: Arc<RelaySettings>,
    pub http1: Arc<Http1Relay>,
    pub http2: Arc<Http2Relay>,
    pub websocket: Arc<WebSocketRelay>,
    pub hooks: HookRunner,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl Shared {
    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }
}

/// HTTP/2 session state of one downstream connection.
#[derive(Debug)]
pub(crate) struct SessionScope {
    ctx: OnceLock<Context>,
    /// Open streams; `None` until the connection carries HTTP/2.
    streams: watch::Sender<Option<usize>>,
}

impl SessionScope {
    pub fn new() -> Self {
        let (streams, _) = watch::channel(None);
        Self {
            ctx: OnceLock::new(),
            streams,
        }
    }

    /// Session context, if the connection ever carried an HTTP/2 stream.
    pub fn context(&self) -> Option<&Context> {
        self.ctx.get()
    }

    fn open_stream(self: &Arc<Self>) -> StreamGuard {
        self.streams.send_modify(|n| *n = Some(n.unwrap_or(0) + 1));
        StreamGuard(Arc::clone(self))
    }

    /// Resolve after the session has had no open streams for `timeout`.
    pub async fn idle(&self, timeout: Duration) {
        let mut streams = self.streams.subscribe();
        loop {
            let quiet = streams.wait_for(|n| *n == Some(0)).await.is_ok();
            if !quiet {
                return std::future::pending().await;
            }
            let resumed = tokio::time::timeout(timeout, streams.wait_for(|n| *n != Some(0)))
                .await
                .map(|r| r.is_ok());
            match resumed {
                Err(_) => return,
                Ok(true) => continue,
                Ok(false) => return std::future::pending().await,
            }
        }
    }
}

struct StreamGuard(Arc<SessionScope>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0
            .streams
            .send_modify(|n| *n = n.map(|count| count.saturating_sub(1)));
    }
}

/// Which hook pair brackets a unit of work.
#[derive(Clone, Copy)]
enum Unit {
    Http1,
    Http2,
    Upgrade,
}

impl Unit {
    fn before(self, hooks: &HookRunner, head: &RequestHead, ctx: &Context) {
        match self {
            Unit::Http1 => hooks.run("before_http_request", |h| h.before_http_request(head, ctx)),
            Unit::Http2 => hooks.run("before_http2_request", |h| h.before_http2_request(head, ctx)),
            Unit::Upgrade => hooks.run("upgrade", |h| h.upgrade(head, ctx)),
        }
    }

    fn after(self, hooks: &HookRunner, head: &RequestHead, ctx: &Context) {
        match self {
            Unit::Http1 => hooks.run("after_http_request", |h| h.after_http_request(head, ctx)),
            Unit::Http2 => hooks.run("after_http2_request", |h| h.after_http2_request(head, ctx)),
            Unit::Upgrade => hooks.run("after_upgrade", |h| h.after_upgrade(head, ctx)),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Unit::Http1 => "http1",
            Unit::Http2 => "http2",
            Unit::Upgrade => "websocket",
        }
    }
}

/// Service handed to hyper for one accepted connection.
#[derive(Clone)]
pub(crate) struct ConnectionService {
    pub shared: Arc<Shared>,
    pub peer: SocketAddr,
    pub connection: ConnectionId,
    pub scope: TunnelScope,
    pub session: Arc<SessionScope>,
}

impl ConnectionService {
    pub async fn call(self, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        let req = req.map(Body::new);
        let response = if req.version() == Version::HTTP_2 {
            self.serve_stream(req).await
        } else if is_upgrade(req.headers()) {
            self.serve_upgrade(req).await
        } else {
            self.serve_request(req, Unit::Http1, Context::new(), None).await
        };
        Ok(response)
    }

    async fn serve_stream(&self, req: Request<Body>) -> Response<Body> {
        let guard = self.session.open_stream();
        let session_ctx = self.session.ctx.get_or_init(|| {
            let ctx = Context::new();
            tracing::debug!(connection_id = %self.connection, peer = %self.peer, "HTTP/2 session started");
            self.shared
                .hooks
                .run("before_http2_session", |h| h.before_http2_session(self.peer, &ctx));
            ctx
        });
        let ctx = session_ctx.child();
        self.serve_request(req, Unit::Http2, ctx, Some(guard)).await
    }

    async fn serve_request(
        &self,
        req: Request<Body>,
        unit: Unit,
        ctx: Context,
        stream: Option<StreamGuard>,
    ) -> Response<Body> {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let head = RequestHead::from_parts(&parts);
        let req = Request::from_parts(parts, body);
        let span = tracing::debug_span!(
            "request",
            request_id = %head.id,
            connection_id = %self.connection,
            method = %head.method,
            path = %head.path(),
        );

        async move {
            let kind = match unit {
                Unit::Http2 => RouteKind::Http2,
                _ => RouteKind::Http,
            };
            let matched = self
                .shared
                .router
                .match_request(kind, &head.method, head.path(), &ctx, &head.headers);
            let upstream = matched.as_ref().map(|m| Arc::clone(&m.upstream));
            let seed = self.seed_headers(upstream.as_deref());

            unit.before(&self.shared.hooks, &head, &ctx);

            let result = match matched {
                Some(matched) => {
                    let proxy = match unit {
                        Unit::Http2 => ProxyRequest::http2(
                            Arc::clone(&self.shared.http2),
                            self.connection,
                            Arc::clone(&matched.upstream),
                            ctx.clone(),
                        ),
                        _ => ProxyRequest::http1(
                            Arc::clone(&self.shared.http1),
                            Arc::clone(&matched.upstream),
                            ctx.clone(),
                        ),
                    };
                    let handling = matched.handler.handle(
                        req,
                        proxy,
                        head.method.clone(),
                        head.path().to_string(),
                        ctx.clone(),
                    );
                    match AssertUnwindSafe(handling).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err(ProxyError::handler("request handler panicked")),
                    }
                }
                None => {
                    tracing::debug!("No route matched");
                    Err(ProxyError::MissingHandler {
                        method: head.method.clone(),
                        path: head.path().to_string(),
                    })
                }
            };

            let response = match result {
                Ok(response) => response,
                Err(error) => self.recover(&head, &ctx, upstream.as_deref(), error).await,
            };
            let response = apply_seed_headers(response, &seed);
            metrics::record_request(unit.label(), response.status().as_u16(), start);

            let hooks = self.shared.hooks.clone();
            let (parts, body) = response.into_parts();
            let body = TrackedBody::wrap(body, move || {
                unit.after(&hooks, &head, &ctx);
                drop(stream);
            });
            Response::from_parts(parts, body)
        }
        .instrument(span)
        .await
    }

    async fn serve_upgrade(&self, req: Request<Body>) -> Response<Body> {
        let (parts, body) = req.into_parts();
        let head = RequestHead::from_parts(&parts);
        let req = Request::from_parts(parts, body);
        let ctx = Context::new();
        let span = tracing::debug_span!(
            "upgrade",
            request_id = %head.id,
            connection_id = %self.connection,
            path = %head.path(),
        );

        async move {
            // Only WebSocket upgrades reach the hooks.
            if !is_websocket_upgrade(&head.method, &head.headers) {
                return self.refuse_upgrade();
            }

            Unit::Upgrade.before(&self.shared.hooks, &head, &ctx);

            let matched = self
                .shared
                .router
                .match_websocket(&head.method, head.path(), &ctx, &head.headers);

            let response = match matched {
                None => self.refuse_upgrade(),
                Some(matched) => {
                    let proxy = WebSocketProxy::new(
                        Arc::clone(&self.shared.websocket),
                        Arc::clone(&self.shared.settings),
                        Arc::clone(&matched.upstream),
                        ctx.clone(),
                        self.scope.clone(),
                    );
                    let handling =
                        matched
                            .handler
                            .handle(req, proxy, head.path().to_string(), ctx.clone());
                    let result = match AssertUnwindSafe(handling).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err(ProxyError::handler("websocket handler panicked")),
                    };
                    match result {
                        Ok(response) => response,
                        Err(error) => {
                            tracing::error!(error = %error, "WebSocket handler failed");
                            rejection(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                FALLBACK_MESSAGE,
                                self.seed_headers(Some(matched.upstream.as_ref())),
                            )
                        }
                    }
                }
            };

            Unit::Upgrade.after(&self.shared.hooks, &head, &ctx);
            response
        }
        .instrument(span)
        .await
    }

    fn refuse_upgrade(&self) -> Response<Body> {
        tracing::info!("Upgrade could not be processed");
        rejection(
            StatusCode::METHOD_NOT_ALLOWED,
            "Upgrade could not be processed",
            self.seed_headers(None),
        )
    }

    /// Response headers every locally generated response starts from.
    fn seed_headers(&self, upstream: Option<&Upstream>) -> HeaderMap {
        prepare_headers(
            &HeaderMap::new(),
            &[
                self.shared.settings.response_headers.as_ref(),
                upstream.and_then(|u| u.response_headers()),
            ],
        )
    }

    async fn recover(
        &self,
        head: &RequestHead,
        ctx: &Context,
        upstream: Option<&Upstream>,
        error: ProxyError,
    ) -> Response<Body> {
        tracing::warn!(error = %error, "Request failed");

        let handler = upstream
            .and_then(|u| u.error_handler())
            .or(self.shared.error_handler.as_ref());
        if let Some(handler) = handler {
            match AssertUnwindSafe(handler.handle(head, error, ctx)).catch_unwind().await {
                Ok(Ok(response)) => return response,
                Ok(Err(e)) => tracing::error!(error = %e, "Error handler failed"),
                Err(_) => tracing::error!("Error handler panicked"),
            }
        }

        metrics::record_fallback();
        fallback_response(&head.headers)
    }

    /// Run session teardown once the connection is gone.
    pub fn finish(&self) {
        if let Some(ctx) = self.session.context() {
            self.shared
                .hooks
                .run("after_http2_session", |h| h.after_http2_session(self.peer, ctx));
            self.shared.http2.release_session(self.connection);
            tracing::debug!(connection_id = %self.connection, "HTTP/2 session ended");
        }
    }
}
