//! Error taxonomy for the proxy core.
//!
//! Every failure that can happen while handling a unit of work (HTTP/1.1
//! request, HTTP/2 stream, WebSocket upgrade) is expressed as a [`ProxyError`]
//! and recovered at the dispatcher boundary by the configured error handler.

use axum::http::{Method, StatusCode};

/// Boxed error returned by embedder callbacks (hooks, interceptors, handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stage of a relay at which an embedder callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStage {
    BeforeProxyRequest,
    BeforeResponse,
}

impl std::fmt::Display for CallbackStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackStage::BeforeProxyRequest => write!(f, "on_before_proxy_request"),
            CallbackStage::BeforeResponse => write!(f, "on_before_response"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No configured route matched the request.
    #[error("Missing RequestHandler configuration for the \"{method}:{path}\" request")]
    MissingHandler { method: Method, path: String },

    #[error("invalid upstream target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("invalid header directive for {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// Outbound TCP/TLS connection could not be established.
    #[error("failed to connect to upstream {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    /// A pooled HTTP/2 session failed before or while serving a stream.
    #[error("upstream HTTP/2 session to {authority} failed: {reason}")]
    SessionFailed { authority: String, reason: String },

    #[error("upstream exchange failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("{stage} callback failed: {source}")]
    Callback {
        stage: CallbackStage,
        #[source]
        source: BoxError,
    },

    /// Failure raised by an embedder handler, including caught panics.
    #[error("request handler failed: {0}")]
    Handler(BoxError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] axum::http::Error),

    #[error(transparent)]
    Listener(#[from] crate::net::listener::ListenerError),

    #[error("dispatcher is already running")]
    AlreadyRunning,
}

impl ProxyError {
    /// Wrap any embedder error as a handler failure.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ProxyError::Handler(err.into())
    }

    /// Status a client would reasonably see for this error when an error
    /// handler chooses to surface it directly.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingHandler { .. } => StatusCode::NOT_FOUND,
            ProxyError::Connect { .. }
            | ProxyError::SessionFailed { .. }
            | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
