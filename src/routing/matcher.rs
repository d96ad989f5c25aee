//! Route matching logic.
//!
//! # Responsibilities
//! - Define the matcher contract evaluated by the dispatcher
//! - Provide common matchers: host, path prefix, method, closures
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP spec)
//! - Path matching is case-sensitive
//! - Matchers may record data in the request [`Context`]
//! - No regex to guarantee O(n) matching

use axum::http::{header, HeaderMap, Method};

use crate::context::Context;

/// Decides whether a route applies to a request.
///
/// `path` never includes the query string. Matchers run synchronously, in
/// declaration order, and may write to `ctx`.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    fn is_matching(&self, method: &Method, path: &str, ctx: &Context, headers: &HeaderMap) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn is_matching(&self, _method: &Method, _path: &str, _ctx: &Context, headers: &HeaderMap) -> bool {
        headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_lowercase() == self.expected_host)
            .unwrap_or(false)
    }
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn is_matching(&self, _method: &Method, path: &str, _ctx: &Context, _headers: &HeaderMap) -> bool {
        path.starts_with(&self.prefix)
    }
}

/// Matches one of a set of methods.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<Method>,
}

impl MethodMatcher {
    pub fn new(methods: impl IntoIterator<Item = Method>) -> Self {
        Self {
            methods: methods.into_iter().collect(),
        }
    }
}

impl Matcher for MethodMatcher {
    fn is_matching(&self, method: &Method, _path: &str, _ctx: &Context, _headers: &HeaderMap) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Always matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyMatcher;

impl Matcher for AnyMatcher {
    fn is_matching(&self, _method: &Method, _path: &str, _ctx: &Context, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Combines multiple matchers with AND semantics.
///
/// Evaluation stops at the first matcher that fails, so context writes from
/// later matchers only happen when earlier ones passed.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn is_matching(&self, method: &Method, path: &str, ctx: &Context, headers: &HeaderMap) -> bool {
        self.matchers
            .iter()
            .all(|m| m.is_matching(method, path, ctx, headers))
    }
}

/// Adapter turning a closure into a [`Matcher`].
pub struct FnMatcher<F> {
    name: &'static str,
    f: F,
}

impl<F> std::fmt::Debug for FnMatcher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMatcher").field("name", &self.name).finish()
    }
}

impl<F> Matcher for FnMatcher<F>
where
    F: Fn(&Method, &str, &Context, &HeaderMap) -> bool + Send + Sync,
{
    fn is_matching(&self, method: &Method, path: &str, ctx: &Context, headers: &HeaderMap) -> bool {
        (self.f)(method, path, ctx, headers)
    }
}

/// Build a matcher from a closure; `name` shows up in debug output.
pub fn matcher_fn<F>(name: &'static str, f: F) -> FnMatcher<F>
where
    F: Fn(&Method, &str, &Context, &HeaderMap) -> bool + Send + Sync,
{
    FnMatcher { name, f }
}
