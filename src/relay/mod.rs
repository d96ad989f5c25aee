//! Protocol relays.
//!
//! # Data Flow
//! ```text
//! handler → ProxyRequest::send / WebSocketProxy::proxy
//!     → prepare_outbound (target, path, method, request header layers,
//!                         on_before_proxy_request)
//!     → http1.rs | http2.rs | websocket.rs (connect via connector.rs)
//!     → finish_response (response header layers, on_before_response)
//!     → response streamed back to the client
//! ```
//!
//! # Design Decisions
//! - One async function per protocol; no callback chains
//! - Bodies are streamed in both directions, never buffered
//! - Relayed responses are tagged so the dispatcher leaves them untouched

pub mod connector;
pub mod http1;
pub mod http2;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{response, HeaderMap, Method, Response, StatusCode, Uri};
use hyper::ext::ReasonPhrase;

use crate::context::Context;
use crate::error::{BoxError, CallbackStage, ProxyError};
use crate::http::headers::{prepare_headers, HeaderDirectives};
use crate::http::request::{concat_path, path_and_query, Target};
use crate::http::response::Relayed;
use crate::config::upstream::Upstream;

pub use http1::Http1Relay;
pub use http2::Http2Relay;
pub use websocket::WebSocketRelay;

/// Settings shared by every relay of one dispatcher.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Global request header layer.
    pub request_headers: Option<HeaderDirectives>,
    /// Global response header layer.
    pub response_headers: Option<HeaderDirectives>,
    /// Socket idle timeout; the HTTP/1.1 exchange deadline is twice this.
    pub timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            request_headers: None,
            response_headers: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Per-call adjustments supplied by a handler.
#[derive(Clone, Default)]
pub struct ProxyOverride {
    /// Replaces the upstream target URL.
    pub target: Option<String>,
    /// Replaces the request path and query.
    pub url: Option<String>,
    pub method: Option<Method>,
    pub port: Option<u16>,
    pub proxy_request_headers: Option<HeaderDirectives>,
    pub proxy_response_headers: Option<HeaderDirectives>,
    pub interceptor: Option<Arc<dyn ProxyInterceptor>>,
}

impl ProxyOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn request_headers(mut self, headers: HeaderDirectives) -> Self {
        self.proxy_request_headers = Some(headers);
        self
    }

    pub fn response_headers(mut self, headers: HeaderDirectives) -> Self {
        self.proxy_response_headers = Some(headers);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn ProxyInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }
}

impl std::fmt::Debug for ProxyOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOverride")
            .field("target", &self.target)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("port", &self.port)
            .field("proxy_request_headers", &self.proxy_request_headers)
            .field("proxy_response_headers", &self.proxy_response_headers)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

/// Outbound request line, open to changes by [`ProxyInterceptor::on_before_proxy_request`].
#[derive(Debug, Clone)]
pub struct ProxyRequestOptions {
    pub method: Method,
    /// Path and query sent upstream, base path included.
    pub path: String,
    pub target: Target,
}

/// Callbacks around a single relayed exchange.
///
/// Errors from either callback abort the relay and go to the error handler.
#[async_trait]
pub trait ProxyInterceptor: Send + Sync {
    fn on_before_proxy_request(
        &self,
        _options: &mut ProxyRequestOptions,
        _headers: &mut HeaderMap,
        _ctx: &Context,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_before_response(
        &self,
        _status: &mut StatusCode,
        _headers: &mut HeaderMap,
        _ctx: &Context,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Resolve target, path, method and request headers for an outbound request.
pub(crate) fn prepare_outbound(
    settings: &RelaySettings,
    upstream: &Upstream,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    ov: &ProxyOverride,
    ctx: &Context,
) -> Result<(ProxyRequestOptions, HeaderMap), ProxyError> {
    let mut target = match ov.target.as_deref() {
        Some(raw) => Target::parse(raw)?,
        None => upstream.target().clone(),
    };
    if let Some(port) = ov.port {
        target = target.with_port(port);
    }

    let url = ov.url.as_deref().unwrap_or_else(|| path_and_query(uri));
    let mut options = ProxyRequestOptions {
        method: ov.method.clone().unwrap_or_else(|| method.clone()),
        path: concat_path(&target.base_path, url),
        target,
    };

    let mut headers = prepare_headers(
        headers,
        &[
            settings.request_headers.as_ref(),
            upstream.request_headers(),
            ov.proxy_request_headers.as_ref(),
        ],
    );

    if let Some(interceptor) = &ov.interceptor {
        interceptor
            .on_before_proxy_request(&mut options, &mut headers, ctx)
            .map_err(|source| ProxyError::Callback {
                stage: CallbackStage::BeforeProxyRequest,
                source,
            })?;
    }

    Ok((options, headers))
}

/// Response header layers for a relayed response.
pub(crate) fn response_headers(
    settings: &RelaySettings,
    upstream: &Upstream,
    ov: &ProxyOverride,
    base: &HeaderMap,
) -> HeaderMap {
    prepare_headers(
        base,
        &[
            settings.response_headers.as_ref(),
            upstream.response_headers(),
            ov.proxy_response_headers.as_ref(),
        ],
    )
}

/// Rewrite an upstream response head and run `on_before_response`.
pub(crate) async fn finish_response(
    settings: &RelaySettings,
    upstream: &Upstream,
    ov: &ProxyOverride,
    ctx: &Context,
    mut parts: response::Parts,
    body: Body,
) -> Result<Response<Body>, ProxyError> {
    let mut headers = response_headers(settings, upstream, ov, &parts.headers);
    let mut status = parts.status;

    if let Some(interceptor) = &ov.interceptor {
        interceptor
            .on_before_response(&mut status, &mut headers, ctx)
            .await
            .map_err(|source| ProxyError::Callback {
                stage: CallbackStage::BeforeResponse,
                source,
            })?;
    }

    if status != parts.status {
        parts.extensions.remove::<ReasonPhrase>();
    }
    parts.status = status;
    parts.headers = headers;
    parts.extensions.insert(Relayed);
    Ok(Response::from_parts(parts, body))
}
