//! Runtime configuration: upstreams with their routes and handlers.
//!
//! [`ProxyConfig`](crate::config::ProxyConfig) is the file format; this module
//! holds the programmatic form the dispatcher runs on. File-declared routes
//! become pass-through handlers, and embedders add their own matchers and
//! handlers on top.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;

use crate::config::schema::{Protocol, ProxyConfig, RouteConfig, RouteProtocol, UpstreamConfig};
use crate::error::ProxyError;
use crate::http::handler::{ErrorHandler, PassThrough, RequestHandler, WebSocketHandler};
use crate::http::headers::HeaderDirectives;
use crate::http::request::Target;
use crate::lifecycle::hooks::Hooks;
use crate::net::tls::{load_tls_material, TlsMaterial};
use crate::relay::RelaySettings;
use crate::routing::matcher::{AndMatcher, AnyMatcher, HostMatcher, Matcher, MethodMatcher, PathPrefixMatcher};

/// A matcher and the handler it selects.
pub struct Route<H: ?Sized> {
    pub matcher: Arc<dyn Matcher>,
    pub handler: Arc<H>,
}

impl<H: ?Sized> Clone for Route<H> {
    fn clone(&self) -> Self {
        Self {
            matcher: Arc::clone(&self.matcher),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// One backend target with its routes, header layers and error handler.
///
/// Immutable once handed to a dispatcher.
pub struct Upstream {
    name: String,
    target: Target,
    request_headers: Option<HeaderDirectives>,
    response_headers: Option<HeaderDirectives>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    request_handlers: Vec<Route<dyn RequestHandler>>,
    http2_request_handlers: Vec<Route<dyn RequestHandler>>,
    websocket_handlers: Vec<Route<dyn WebSocketHandler>>,
}

impl Upstream {
    /// New upstream for `target`, e.g. `http://localhost:8080`.
    pub fn new(name: impl Into<String>, target: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            name: name.into(),
            target: Target::parse(target)?,
            request_headers: None,
            response_headers: None,
            error_handler: None,
            request_handlers: Vec::new(),
            http2_request_handlers: Vec::new(),
            websocket_handlers: Vec::new(),
        })
    }

    pub fn with_request_headers(mut self, headers: HeaderDirectives) -> Self {
        self.request_headers = Some(headers);
        self
    }

    pub fn with_response_headers(mut self, headers: HeaderDirectives) -> Self {
        self.response_headers = Some(headers);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Add an HTTP/1.1 route.
    pub fn route(mut self, matcher: impl Matcher + 'static, handler: impl RequestHandler + 'static) -> Self {
        self.request_handlers.push(Route {
            matcher: Arc::new(matcher),
            handler: Arc::new(handler),
        });
        self
    }

    /// Add an HTTP/2 route.
    pub fn http2_route(mut self, matcher: impl Matcher + 'static, handler: impl RequestHandler + 'static) -> Self {
        self.http2_request_handlers.push(Route {
            matcher: Arc::new(matcher),
            handler: Arc::new(handler),
        });
        self
    }

    /// Add a WebSocket route.
    pub fn websocket_route(
        mut self,
        matcher: impl Matcher + 'static,
        handler: impl WebSocketHandler + 'static,
    ) -> Self {
        self.websocket_handlers.push(Route {
            matcher: Arc::new(matcher),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn request_headers(&self) -> Option<&HeaderDirectives> {
        self.request_headers.as_ref()
    }

    pub fn response_headers(&self) -> Option<&HeaderDirectives> {
        self.response_headers.as_ref()
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }

    pub fn request_handlers(&self) -> &[Route<dyn RequestHandler>] {
        &self.request_handlers
    }

    pub fn http2_request_handlers(&self) -> &[Route<dyn RequestHandler>] {
        &self.http2_request_handlers
    }

    pub fn websocket_handlers(&self) -> &[Route<dyn WebSocketHandler>] {
        &self.websocket_handlers
    }

    /// Build from a file-declared upstream; every route proxies unchanged.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        let mut upstream = Upstream::new(&config.name, &config.target)?;
        upstream.request_headers = config.request_headers.clone();
        upstream.response_headers = config.response_headers.clone();

        for route in &config.routes {
            let matcher = route_matcher(route);
            match route.protocol {
                RouteProtocol::Http => upstream.request_handlers.push(Route {
                    matcher,
                    handler: Arc::new(PassThrough),
                }),
                RouteProtocol::Http2 => upstream.http2_request_handlers.push(Route {
                    matcher,
                    handler: Arc::new(PassThrough),
                }),
                RouteProtocol::Websocket => upstream.websocket_handlers.push(Route {
                    matcher,
                    handler: Arc::new(PassThrough),
                }),
            }
        }
        Ok(upstream)
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("request_handlers", &self.request_handlers.len())
            .field("http2_request_handlers", &self.http2_request_handlers.len())
            .field("websocket_handlers", &self.websocket_handlers.len())
            .finish()
    }
}

fn route_matcher(route: &RouteConfig) -> Arc<dyn Matcher> {
    let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
    if let Some(prefix) = &route.path_prefix {
        matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
    }
    if let Some(host) = &route.host {
        matchers.push(Box::new(HostMatcher::new(host.clone())));
    }
    if !route.methods.is_empty() {
        let methods = route
            .methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok());
        matchers.push(Box::new(MethodMatcher::new(methods)));
    }
    if matchers.is_empty() {
        Arc::new(AnyMatcher)
    } else {
        Arc::new(AndMatcher::new(matchers))
    }
}

/// Everything a dispatcher needs to run.
pub struct Configuration {
    pub hostname: String,
    /// 0 picks a free port; the bound address is returned by `start`.
    pub port: u16,
    pub mode: Protocol,
    pub tls: Option<TlsMaterial>,
    pub max_connections: usize,
    pub proxy_request_timeout: Duration,
    pub proxy_request_headers: Option<HeaderDirectives>,
    pub response_headers: Option<HeaderDirectives>,
    pub upstreams: Vec<Arc<Upstream>>,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    pub hooks: Option<Arc<dyn Hooks>>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 0,
            mode: Protocol::Http,
            tls: None,
            max_connections: 10_000,
            proxy_request_timeout: Duration::from_secs(60),
            proxy_request_headers: None,
            response_headers: None,
            upstreams: Vec::new(),
            error_handler: None,
            hooks: None,
        }
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upstream(mut self, upstream: Upstream) -> Self {
        self.upstreams.push(Arc::new(upstream));
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            request_headers: self.proxy_request_headers.clone(),
            response_headers: self.response_headers.clone(),
            timeout: self.proxy_request_timeout,
        }
    }

    /// Build from a validated file configuration, loading TLS material if set.
    pub fn from_proxy_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let tls = match &config.listener.tls {
            Some(tls) => Some(load_tls_material(
                Path::new(&tls.cert_path),
                Path::new(&tls.key_path),
            )?),
            None => None,
        };
        let upstreams = config
            .upstreams
            .iter()
            .map(|u| Upstream::from_config(u).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            hostname: config.listener.hostname.clone(),
            port: config.listener.port,
            mode: config.listener.mode,
            tls,
            max_connections: config.listener.max_connections,
            proxy_request_timeout: Duration::from_millis(config.timeouts.proxy_request_ms),
            proxy_request_headers: config.headers.proxy_request_headers.clone(),
            response_headers: config.headers.response_headers.clone(),
            upstreams,
            error_handler: None,
            hooks: None,
        })
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("tls", &self.tls.is_some())
            .field("proxy_request_timeout", &self.proxy_request_timeout)
            .field("upstreams", &self.upstreams)
            .finish()
    }
}
