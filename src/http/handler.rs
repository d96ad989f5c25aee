//! Handler traits and the proxy handles passed to them.
//!
//! A matched route hands its handler a [`ProxyRequest`] (HTTP) or a
//! [`WebSocketProxy`] (upgrade) already bound to the right relay and
//! upstream. Handlers may answer on their own, proxy unchanged, or proxy
//! with a [`ProxyOverride`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};

use crate::config::upstream::Upstream;
use crate::context::Context;
use crate::error::ProxyError;
use crate::http::headers::prepare_headers;
use crate::http::request::RequestHead;
use crate::http::response::rejection;
use crate::net::connection::ConnectionId;
use crate::relay::websocket::TunnelScope;
use crate::relay::{Http1Relay, Http2Relay, ProxyOverride, RelaySettings, WebSocketRelay};

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        req: Request<Body>,
        proxy: ProxyRequest,
        method: Method,
        path: String,
        ctx: Context,
    ) -> Result<Response<Body>, ProxyError>;
}

#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    async fn handle(
        &self,
        req: Request<Body>,
        proxy: WebSocketProxy,
        path: String,
        ctx: Context,
    ) -> Result<Response<Body>, ProxyError>;
}

/// Turns a failure into a response. Returning an error falls through to
/// the fallback 500.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(
        &self,
        req: &RequestHead,
        error: ProxyError,
        ctx: &Context,
    ) -> Result<Response<Body>, ProxyError>;
}

#[derive(Clone)]
enum RelayBinding {
    Http1(Arc<Http1Relay>),
    Http2 {
        relay: Arc<Http2Relay>,
        session: ConnectionId,
    },
}

/// Proxy handle bound to the relay of the inbound protocol.
#[derive(Clone)]
pub struct ProxyRequest {
    binding: RelayBinding,
    upstream: Arc<Upstream>,
    ctx: Context,
}

impl ProxyRequest {
    pub(crate) fn http1(relay: Arc<Http1Relay>, upstream: Arc<Upstream>, ctx: Context) -> Self {
        Self {
            binding: RelayBinding::Http1(relay),
            upstream,
            ctx,
        }
    }

    pub(crate) fn http2(
        relay: Arc<Http2Relay>,
        session: ConnectionId,
        upstream: Arc<Upstream>,
        ctx: Context,
    ) -> Self {
        Self {
            binding: RelayBinding::Http2 { relay, session },
            upstream,
            ctx,
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Relay `req` upstream and return the upstream response.
    pub async fn send(
        &self,
        req: Request<Body>,
        ov: Option<ProxyOverride>,
    ) -> Result<Response<Body>, ProxyError> {
        match &self.binding {
            RelayBinding::Http1(relay) => relay.proxy(&self.upstream, req, &self.ctx, ov).await,
            RelayBinding::Http2 { relay, session } => {
                relay.proxy(*session, &self.upstream, req, &self.ctx, ov).await
            }
        }
    }
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocol = match self.binding {
            RelayBinding::Http1(_) => "http/1.1",
            RelayBinding::Http2 { .. } => "h2",
        };
        f.debug_struct("ProxyRequest")
            .field("protocol", &protocol)
            .field("upstream", &self.upstream.name())
            .finish()
    }
}

/// Proxy handle for an upgrade request.
#[derive(Clone)]
pub struct WebSocketProxy {
    relay: Arc<WebSocketRelay>,
    settings: Arc<RelaySettings>,
    upstream: Arc<Upstream>,
    ctx: Context,
    scope: TunnelScope,
}

impl WebSocketProxy {
    pub(crate) fn new(
        relay: Arc<WebSocketRelay>,
        settings: Arc<RelaySettings>,
        upstream: Arc<Upstream>,
        ctx: Context,
        scope: TunnelScope,
    ) -> Self {
        Self {
            relay,
            settings,
            upstream,
            ctx,
            scope,
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Relay the upgrade. A 101 answer opens a tunnel that outlives this call.
    pub async fn proxy(
        &self,
        req: Request<Body>,
        ov: Option<ProxyOverride>,
    ) -> Result<Response<Body>, ProxyError> {
        self.relay
            .proxy(&self.upstream, req, &self.ctx, ov, &self.scope)
            .await
    }

    /// Refuse the upgrade without contacting the upstream.
    pub fn cancel(&self, status: StatusCode, description: &str) -> Response<Body> {
        let headers = prepare_headers(
            &HeaderMap::new(),
            &[
                self.settings.response_headers.as_ref(),
                self.upstream.response_headers(),
            ],
        );
        rejection(status, description, headers)
    }
}

impl std::fmt::Debug for WebSocketProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketProxy")
            .field("upstream", &self.upstream.name())
            .finish()
    }
}

/// Proxies everything unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl RequestHandler for PassThrough {
    async fn handle(
        &self,
        req: Request<Body>,
        proxy: ProxyRequest,
        _method: Method,
        _path: String,
        _ctx: Context,
    ) -> Result<Response<Body>, ProxyError> {
        proxy.send(req, None).await
    }
}

#[async_trait]
impl WebSocketHandler for PassThrough {
    async fn handle(
        &self,
        req: Request<Body>,
        proxy: WebSocketProxy,
        _path: String,
        _ctx: Context,
    ) -> Result<Response<Body>, ProxyError> {
        proxy.proxy(req, None).await
    }
}

pub struct HandlerFn<F>(F);

/// Use an async closure as a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Body>, ProxyRequest, Method, String, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, ProxyError>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Request<Body>, ProxyRequest, Method, String, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, ProxyError>> + Send,
{
    async fn handle(
        &self,
        req: Request<Body>,
        proxy: ProxyRequest,
        method: Method,
        path: String,
        ctx: Context,
    ) -> Result<Response<Body>, ProxyError> {
        (self.0)(req, proxy, method, path, ctx).await
    }
}

pub struct WebSocketHandlerFn<F>(F);

/// Use an async closure as a [`WebSocketHandler`].
pub fn websocket_handler_fn<F, Fut>(f: F) -> WebSocketHandlerFn<F>
where
    F: Fn(Request<Body>, WebSocketProxy, String, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, ProxyError>> + Send,
{
    WebSocketHandlerFn(f)
}

#[async_trait]
impl<F, Fut> WebSocketHandler for WebSocketHandlerFn<F>
where
    F: Fn(Request<Body>, WebSocketProxy, String, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, ProxyError>> + Send,
{
    async fn handle(
        &self,
        req: Request<Body>,
        proxy: WebSocketProxy,
        path: String,
        ctx: Context,
    ) -> Result<Response<Body>, ProxyError> {
        (self.0)(req, proxy, path, ctx).await
    }
}

pub struct ErrorHandlerFn<F>(F);

/// Use an async closure as an [`ErrorHandler`]. The closure gets owned
/// copies of the request head and context.
pub fn error_handler_fn<F, Fut>(f: F) -> ErrorHandlerFn<F>
where
    F: Fn(RequestHead, ProxyError, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, ProxyError>> + Send,
{
    ErrorHandlerFn(f)
}

#[async_trait]
impl<F, Fut> ErrorHandler for ErrorHandlerFn<F>
where
    F: Fn(RequestHead, ProxyError, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, ProxyError>> + Send,
{
    async fn handle(
        &self,
        req: &RequestHead,
        error: ProxyError,
        ctx: &Context,
    ) -> Result<Response<Body>, ProxyError> {
        (self.0)(req.clone(), error, ctx.clone()).await
    }
}
