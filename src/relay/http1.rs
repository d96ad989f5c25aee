//! HTTP/1.1 relay.
//!
//! One outbound connection per relayed request. The inbound body is handed
//! to hyper as-is and the upstream body is returned as-is, so both directions
//! stream. Dropping the response body (client gone) drops the outbound
//! connection, and an upstream failure surfaces as a body error downstream.
//!
//! The whole exchange, response body included, must settle within twice the
//! proxy request timeout, counted from the start of the relay.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response};
use hyper_util::rt::TokioIo;

use crate::config::upstream::Upstream;
use crate::context::Context;
use crate::error::ProxyError;
use crate::http::body::DeadlineBody;
use crate::http::request::is_keep_alive;
use crate::relay::connector::connect;
use crate::relay::{finish_response, prepare_outbound, ProxyOverride, RelaySettings};

#[derive(Debug)]
pub struct Http1Relay {
    settings: Arc<RelaySettings>,
}

impl Http1Relay {
    pub fn new(settings: Arc<RelaySettings>) -> Self {
        Self { settings }
    }

    pub async fn proxy(
        &self,
        upstream: &Upstream,
        req: Request<Body>,
        ctx: &Context,
        ov: Option<ProxyOverride>,
    ) -> Result<Response<Body>, ProxyError> {
        let ov = ov.unwrap_or_default();
        let (parts, body) = req.into_parts();
        let (options, mut headers) =
            prepare_outbound(&self.settings, upstream, &parts.method, &parts.uri, &parts.headers, &ov, ctx)?;

        if !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&options.target.host_header()).map_err(|e| {
                ProxyError::InvalidTarget {
                    target: options.target.authority(),
                    reason: e.to_string(),
                }
            })?;
            headers.insert(header::HOST, host);
        }

        let mut outbound = Request::builder()
            .method(options.method.clone())
            .uri(options.path.as_str())
            .body(body)?;
        *outbound.headers_mut() = headers;

        tracing::debug!(
            method = %options.method,
            target = %options.target.authority(),
            path = %options.path,
            "Relaying HTTP/1.1 request"
        );

        let timeout = self.settings.timeout;
        let limit = timeout * 2;
        let deadline = tokio::time::Instant::now() + limit;
        let authority = options.target.authority();
        let exchange = async {
            let (io, idle) = connect(&options.target, timeout, false).await?;
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(authority = %authority, error = %e, "Upstream connection closed with error");
                }
            });
            let response = sender.send_request(outbound).await?;
            Ok::<_, ProxyError>((response, idle))
        };

        let (response, idle) = tokio::time::timeout_at(deadline, exchange)
            .await
            .map_err(|_| ProxyError::Timeout(limit))??;

        if is_keep_alive(&parts.headers) {
            idle.disable();
        }

        let (parts, body) = response.into_parts();
        let body = DeadlineBody::wrap(Body::new(body), deadline, limit);
        finish_response(&self.settings, upstream, &ov, ctx, parts, body).await
    }
}
