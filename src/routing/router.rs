//! Route lookup.
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Upstreams are scanned in declaration order, routes in insertion order
//! - First match wins; no match is explicit (`None`)

use std::sync::Arc;

use axum::http::{HeaderMap, Method};

use crate::config::upstream::{Route, Upstream};
use crate::context::Context;
use crate::http::handler::{RequestHandler, WebSocketHandler};

/// Which route list of an upstream to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Http,
    Http2,
    WebSocket,
}

/// A route together with the upstream that declared it.
pub struct RouteMatch<H: ?Sized> {
    pub upstream: Arc<Upstream>,
    pub handler: Arc<H>,
}

#[derive(Debug, Clone)]
pub struct Router {
    upstreams: Vec<Arc<Upstream>>,
}

impl Router {
    pub fn new(upstreams: Vec<Arc<Upstream>>) -> Self {
        Self { upstreams }
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// Handler for an HTTP/1.1 (`RouteKind::Http`) or HTTP/2 request.
    pub fn match_request(
        &self,
        kind: RouteKind,
        method: &Method,
        path: &str,
        ctx: &Context,
        headers: &HeaderMap,
    ) -> Option<RouteMatch<dyn RequestHandler>> {
        self.find(
            |upstream| match kind {
                RouteKind::Http2 => upstream.http2_request_handlers(),
                _ => upstream.request_handlers(),
            },
            method,
            path,
            ctx,
            headers,
        )
    }

    /// Handler for a WebSocket upgrade.
    pub fn match_websocket(
        &self,
        method: &Method,
        path: &str,
        ctx: &Context,
        headers: &HeaderMap,
    ) -> Option<RouteMatch<dyn WebSocketHandler>> {
        self.find(|upstream| upstream.websocket_handlers(), method, path, ctx, headers)
    }

    fn find<H: ?Sized>(
        &self,
        routes: impl Fn(&Upstream) -> &[Route<H>],
        method: &Method,
        path: &str,
        ctx: &Context,
        headers: &HeaderMap,
    ) -> Option<RouteMatch<H>> {
        self.upstreams.iter().find_map(|upstream| {
            routes(upstream)
                .iter()
                .find(|route| route.matcher.is_matching(method, path, ctx, headers))
                .map(|route| RouteMatch {
                    upstream: Arc::clone(upstream),
                    handler: Arc::clone(&route.handler),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::PassThrough;
    use crate::routing::matcher::{matcher_fn, AnyMatcher, PathPrefixMatcher};

    fn router() -> Router {
        let first = Upstream::new("first", "http://127.0.0.1:1")
            .unwrap()
            .route(PathPrefixMatcher::new("/a"), PassThrough)
            .http2_route(PathPrefixMatcher::new("/h2"), PassThrough);
        let second = Upstream::new("second", "http://127.0.0.1:2")
            .unwrap()
            .route(AnyMatcher, PassThrough)
            .websocket_route(
                matcher_fn("tenant", |_, _, ctx: &Context, _| ctx.contains("tenant")),
                PassThrough,
            );
        Router::new(vec![Arc::new(first), Arc::new(second)])
    }

    #[test]
    fn first_declared_upstream_wins() {
        let router = router();
        let ctx = Context::new();
        let headers = HeaderMap::new();

        let hit = router
            .match_request(RouteKind::Http, &Method::GET, "/a/b", &ctx, &headers)
            .unwrap();
        assert_eq!(hit.upstream.name(), "first");

        let hit = router
            .match_request(RouteKind::Http, &Method::GET, "/other", &ctx, &headers)
            .unwrap();
        assert_eq!(hit.upstream.name(), "second");
    }

    #[test]
    fn http2_routes_are_separate() {
        let router = router();
        let ctx = Context::new();
        let headers = HeaderMap::new();

        assert!(router
            .match_request(RouteKind::Http2, &Method::GET, "/a", &ctx, &headers)
            .is_none());
        assert!(router
            .match_request(RouteKind::Http2, &Method::GET, "/h2/x", &ctx, &headers)
            .is_some());
    }

    #[test]
    fn websocket_matcher_reads_context() {
        let router = router();
        let headers = HeaderMap::new();
        let ctx = Context::new();
        assert!(router.match_websocket(&Method::GET, "/ws", &ctx, &headers).is_none());

        ctx.insert("tenant", "acme");
        assert!(router.match_websocket(&Method::GET, "/ws", &ctx, &headers).is_some());
    }
}
