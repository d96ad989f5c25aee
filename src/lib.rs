//! Embeddable reverse proxy core.
//!
//! A [`Dispatcher`] accepts HTTP/1.1, HTTP/2 and WebSocket traffic, routes
//! each unit of work to an embedder-supplied handler, and relays it to an
//! upstream with layered header rewriting.
//!
//! ```text
//!   client ──▶ net (listener, TLS, idle timeout)
//!          ──▶ http::server (Dispatcher) ──▶ routing (matchers)
//!          ──▶ lifecycle::hooks (before) ──▶ handler
//!          ──▶ relay (http1 | http2 pooled | websocket tunnel) ──▶ upstream
//!          ◀── response header layers, interceptor ◀──
//!          ◀── lifecycle::hooks (after)
//! ```

// Core subsystems
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod net;
pub mod relay;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{Configuration, ProxyConfig, Upstream};
pub use context::Context;
pub use error::{BoxError, ProxyError};
pub use http::{Dispatcher, ServerMode};
pub use lifecycle::Hooks;
pub use relay::{ProxyInterceptor, ProxyOverride, ProxyRequestOptions};
