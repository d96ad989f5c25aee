//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Dispatcher: accept, TLS, hyper connection driver)
//!     → service.rs (context, route match, hooks, error chain)
//!     → handler.rs (embedder handler with a bound proxy handle)
//!     → relay (HTTP/1.1, HTTP/2, WebSocket)
//!     → headers.rs / response.rs (rewrite layers, seed headers, fallback)
//!     → Send to client
//! ```

pub mod body;
pub mod handler;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;
pub(crate) mod service;

pub use handler::{
    error_handler_fn, handler_fn, websocket_handler_fn, ErrorHandler, PassThrough, ProxyRequest,
    RequestHandler, WebSocketHandler, WebSocketProxy,
};
pub use headers::{prepare_headers, HeaderDirective, HeaderDirectives};
pub use request::{RequestHead, Target};
pub use server::{Dispatcher, ServerMode};
