//! Response body wrappers.
//!
//! The dispatcher needs to know when a unit of work is really over (the
//! response body was fully sent, failed, or was dropped because the client
//! went away) to fire `after` hooks exactly once and to track active HTTP/2
//! streams. [`DeadlineBody`] cuts a relayed body off at a fixed instant.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use http_body::{Frame, SizeHint};
use tokio::time::{Instant, Sleep};

use crate::error::ProxyError;

type OnComplete = Box<dyn FnOnce() + Send + 'static>;

pub struct TrackedBody {
    inner: Body,
    on_complete: Option<OnComplete>,
}

impl TrackedBody {
    pub fn new<F>(inner: Body, on_complete: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Wrap and convert back into a plain [`Body`].
    pub fn wrap<F>(inner: Body, on_complete: F) -> Body
    where
        F: FnOnce() + Send + 'static,
    {
        Body::new(Self::new(inner, on_complete))
    }

    fn complete(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            callback();
        }
    }
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => self.complete(),
            Poll::Ready(Some(Ok(_))) if self.inner.is_end_stream() => self.complete(),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Fails the body with [`ProxyError::Timeout`] once `deadline` passes.
pub struct DeadlineBody {
    inner: Body,
    sleep: Pin<Box<Sleep>>,
    limit: Duration,
    expired: bool,
}

impl DeadlineBody {
    /// `limit` is only reported in the error.
    pub fn wrap(inner: Body, deadline: Instant, limit: Duration) -> Body {
        Body::new(Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            limit,
            expired: false,
        })
    }
}

impl http_body::Body for DeadlineBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.expired {
            return Poll::Ready(None);
        }
        if self.sleep.as_mut().poll(cx).is_ready() {
            self.expired = true;
            return Poll::Ready(Some(Err(axum::Error::new(ProxyError::Timeout(self.limit)))));
        }
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
