//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, connection limits)
//! - Check that upstream targets and route methods parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::Method;

use crate::config::schema::ProxyConfig;
use crate::http::request::Target;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener.max_connections must be greater than zero")]
    NoConnections,

    #[error("timeouts.proxy_request_ms must be greater than zero")]
    ZeroTimeout,

    #[error("listener.tls.{field} is empty")]
    EmptyTlsPath { field: &'static str },

    #[error("upstream name {0:?} is declared more than once")]
    DuplicateUpstream(String),

    #[error("upstream {upstream:?}: {reason}")]
    InvalidTarget { upstream: String, reason: String },

    #[error("upstream {upstream:?}: invalid method {method:?}")]
    InvalidMethod { upstream: String, method: String },

    #[error("upstream {upstream:?}: path_prefix {prefix:?} must start with '/'")]
    InvalidPathPrefix { upstream: String, prefix: String },

    #[error("observability.metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Check `config` and collect every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::NoConnections);
    }
    if config.timeouts.proxy_request_ms == 0 {
        errors.push(ValidationError::ZeroTimeout);
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::EmptyTlsPath { field: "cert_path" });
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::EmptyTlsPath { field: "key_path" });
        }
    }

    let mut names = HashSet::new();
    for upstream in &config.upstreams {
        if !names.insert(upstream.name.as_str()) {
            errors.push(ValidationError::DuplicateUpstream(upstream.name.clone()));
        }
        if let Err(e) = Target::parse(&upstream.target) {
            errors.push(ValidationError::InvalidTarget {
                upstream: upstream.name.clone(),
                reason: e.to_string(),
            });
        }
        for route in &upstream.routes {
            for method in &route.methods {
                if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                    errors.push(ValidationError::InvalidMethod {
                        upstream: upstream.name.clone(),
                        method: method.clone(),
                    });
                }
            }
            if let Some(prefix) = &route.path_prefix {
                if !prefix.starts_with('/') {
                    errors.push(ValidationError::InvalidPathPrefix {
                        upstream: upstream.name.clone(),
                        prefix: prefix.clone(),
                    });
                }
            }
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
