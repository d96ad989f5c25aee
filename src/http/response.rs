//! Response construction helpers.
//!
//! # Responsibilities
//! - Build the last-resort 500 response
//! - Build status-line rejections for upgrade requests
//! - Apply seeded response headers to locally generated responses

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use hyper::ext::ReasonPhrase;

use crate::http::request::accepts_json;

pub const FALLBACK_MESSAGE: &str = "Unexpected error occurred";

/// Extension marking a response that was produced by a relay.
///
/// Relayed responses already carry the rewritten upstream headers and are
/// not touched by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct Relayed;

/// The built-in 500 used when no error handler produced a response.
pub fn fallback_response(request_headers: &HeaderMap) -> Response<Body> {
    let (content_type, body) = if accepts_json(request_headers) {
        (
            "application/json",
            serde_json::json!({ "error": FALLBACK_MESSAGE }).to_string(),
        )
    } else {
        ("text/plain", FALLBACK_MESSAGE.to_string())
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Status line with a custom description, used to refuse upgrades.
///
/// The connection is closed after the head is written.
pub fn rejection(status: StatusCode, description: &str, mut headers: HeaderMap) -> Response<Body> {
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    if let Ok(reason) = ReasonPhrase::try_from(description.as_bytes().to_vec()) {
        response.extensions_mut().insert(reason);
    }
    response
}

/// Add seeded headers the response did not set itself.
///
/// Relayed responses are returned unchanged.
pub fn apply_seed_headers(mut response: Response<Body>, seed: &HeaderMap) -> Response<Body> {
    if response.extensions().get::<Relayed>().is_some() {
        return response;
    }
    let headers = response.headers_mut();
    for name in seed.keys() {
        if headers.contains_key(name) {
            continue;
        }
        for value in seed.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}
