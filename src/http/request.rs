//! Request inspection helpers shared by the dispatcher and the relays.
//!
//! # Responsibilities
//! - Capture a cloneable request head for hooks and error handlers
//! - Resolve upstream targets (scheme, host, port, base path)
//! - Detect upgrade, keep-alive and JSON-accepting requests

use axum::http::{header, request::Parts, HeaderMap, Method, Uri, Version};
use url::Url;
use uuid::Uuid;

use crate::error::ProxyError;

/// Cloneable view of a request line and its headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub id: Uuid,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// Path part of a request URI, without the query string.
pub fn get_path(uri: &Uri) -> &str {
    uri.path()
}

/// Path and query of a request URI, `/` when absent.
pub fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Prefix `path` with the upstream base path. A `/` base is a no-op.
pub fn concat_path(base: &str, path: &str) -> String {
    if base != "/" && !base.is_empty() {
        format!("{base}{path}")
    } else {
        path.to_string()
    }
}

/// Resolved upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl Target {
    /// Parse an upstream URL such as `http://localhost:8080/api`.
    ///
    /// `ws`/`wss` are accepted as aliases of `http`/`https`.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: String| ProxyError::InvalidTarget {
            target: raw.to_string(),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let secure = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => return Err(invalid(format!("unsupported scheme {other:?}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .unwrap_or(if secure { 443 } else { 80 });

        Ok(Self {
            secure,
            host,
            port,
            base_path: url.path().to_string(),
        })
    }

    /// Same target with a different port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    fn default_port(&self) -> u16 {
        if self.secure {
            443
        } else {
            80
        }
    }

    /// `host:port`, used to open sockets and key the HTTP/2 pool.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for an outbound `Host` header (port omitted when default).
    pub fn host_header(&self) -> String {
        if self.port == self.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Request asks for any protocol upgrade.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE) && header_has_token(headers, header::CONNECTION, "upgrade")
}

/// Request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(method: &Method, headers: &HeaderMap) -> bool {
    *method == Method::GET
        && is_upgrade(headers)
        && header_has_token(headers, header::UPGRADE, "websocket")
}

pub fn is_keep_alive(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::CONNECTION, "keep-alive")
}

pub fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("application/json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn path_strips_query() {
        let uri: Uri = "/echo?x=1".parse().unwrap();
        assert_eq!(get_path(&uri), "/echo");
        assert_eq!(path_and_query(&uri), "/echo?x=1");
    }

    #[test]
    fn concat_path_with_base() {
        assert_eq!(concat_path("/", "/echo"), "/echo");
        assert_eq!(concat_path("/api", "/echo"), "/api/echo");
    }

    #[test]
    fn parses_targets() {
        let t = Target::parse("http://localhost:8080/api").unwrap();
        assert!(!t.secure);
        assert_eq!(t.authority(), "localhost:8080");
        assert_eq!(t.base_path, "/api");

        let t = Target::parse("https://example.com").unwrap();
        assert!(t.secure);
        assert_eq!(t.port, 443);
        assert_eq!(t.base_path, "/");
        assert_eq!(t.host_header(), "example.com");
        assert_eq!(t.clone().with_port(8443).host_header(), "example.com:8443");

        let t = Target::parse("ws://127.0.0.1:9000").unwrap();
        assert_eq!(t.scheme(), "http");

        assert!(Target::parse("ftp://example.com").is_err());
        assert!(Target::parse("not a url").is_err());
    }

    #[test]
    fn detects_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));

        assert!(is_upgrade(&headers));
        assert!(is_websocket_upgrade(&Method::GET, &headers));
        assert!(!is_websocket_upgrade(&Method::POST, &headers));
        assert!(is_keep_alive(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(is_upgrade(&headers));
        assert!(!is_websocket_upgrade(&Method::GET, &headers));
    }

    #[test]
    fn accept_json() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_json(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html, application/json"));
        assert!(accepts_json(&headers));
    }
}
