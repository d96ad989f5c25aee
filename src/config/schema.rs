//! Configuration schema definitions.
//!
//! This module defines the file configuration of the proxy binary.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::http::headers::HeaderDirectives;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (address, protocol, TLS).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Global header rewrite layers.
    pub headers: HeadersConfig,

    /// Upstream definitions, matched in declaration order.
    pub upstreams: Vec<UpstreamConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Whether the listener speaks HTTP/1.1 only or HTTP/2 with HTTP/1.1 fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Http2,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind, e.g. "0.0.0.0".
    pub hostname: String,

    /// Port to bind; 0 picks a free one.
    pub port: u16,

    pub mode: Protocol,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 8080,
            mode: Protocol::Http,
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Socket idle timeout and HTTP/2 session idle timeout, in milliseconds.
    /// The HTTP/1.1 upstream exchange is bounded by twice this value.
    pub proxy_request_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            proxy_request_ms: 60_000,
        }
    }
}

/// Header directive maps applied to every request and response.
///
/// ```toml
/// [headers.proxy_request_headers]
/// x-forwarded-by = "relay"
/// x-debug = false
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HeadersConfig {
    pub proxy_request_headers: Option<HeaderDirectives>,
    pub response_headers: Option<HeaderDirectives>,
}

/// One upstream target and its pass-through routes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Identifier for logging.
    pub name: String,

    /// Base URL, e.g. "http://127.0.0.1:3000/api".
    pub target: String,

    #[serde(default)]
    pub request_headers: Option<HeaderDirectives>,

    #[serde(default)]
    pub response_headers: Option<HeaderDirectives>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Which route list a declared route joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteProtocol {
    #[default]
    Http,
    Http2,
    Websocket,
}

/// Declarative route; all given conditions must hold.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteConfig {
    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Host header to match (exact, port ignored).
    pub host: Option<String>,

    /// Allowed methods; empty allows all.
    pub methods: Vec<String>,

    pub protocol: RouteProtocol,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub log_json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
