//! Embedder lifecycle hooks.
//!
//! # Responsibilities
//! - Define the callback points around requests, HTTP/2 sessions and upgrades
//! - Isolate every invocation so a failing or panicking hook never changes
//!   the outcome of proxying
//!
//! # Data Flow
//! ```text
//! HTTP/1.1:  before_http_request → handler → after_http_request
//! HTTP/2:    before_http2_session (first stream)
//!              ├─ before_http2_request → handler → after_http2_request
//!              └─ ... per stream
//!            after_http2_session (connection end)
//! Upgrade:   upgrade → handler → after_upgrade
//! ```

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::Context;
use crate::error::BoxError;
use crate::http::request::RequestHead;

/// Lifecycle callbacks. Every method defaults to a no-op.
pub trait Hooks: Send + Sync {
    fn before_http_request(&self, _req: &RequestHead, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_http_request(&self, _req: &RequestHead, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn before_http2_session(&self, _peer: SocketAddr, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_http2_session(&self, _peer: SocketAddr, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn before_http2_request(&self, _req: &RequestHead, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_http2_request(&self, _req: &RequestHead, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn upgrade(&self, _req: &RequestHead, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_upgrade(&self, _req: &RequestHead, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Runs hooks with error and panic isolation.
#[derive(Clone, Default)]
pub struct HookRunner {
    hooks: Option<Arc<dyn Hooks>>,
}

impl HookRunner {
    pub fn new(hooks: Option<Arc<dyn Hooks>>) -> Self {
        Self { hooks }
    }

    /// Invoke one hook; failures are logged and swallowed.
    pub fn run<F>(&self, name: &'static str, call: F)
    where
        F: FnOnce(&dyn Hooks) -> Result<(), BoxError>,
    {
        let Some(hooks) = self.hooks.as_deref() else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| call(hooks))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(hook = name, error = %e, "Hook failed"),
            Err(_) => tracing::error!(hook = name, "Hook panicked"),
        }
    }
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRunner")
            .field("configured", &self.hooks.is_some())
            .finish()
    }
}
