//! Outbound connections to upstream targets.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::ProxyError;
use crate::http::request::Target;
use crate::net::idle::{IdleHandle, IdleTimeout};
use crate::net::listener::configure_socket;
use crate::net::tls;

/// Plain or TLS socket to an upstream, with an idle timeout underneath.
pub enum UpstreamStream {
    Plain(IdleTimeout<TcpStream>),
    Tls(Box<TlsStream<IdleTimeout<TcpStream>>>),
}

/// Open a socket to `target`. `http2` selects the ALPN offered over TLS.
///
/// The connect itself is bounded by `timeout`, which is also the idle
/// timeout of the returned stream.
pub async fn connect(
    target: &Target,
    timeout: Duration,
    http2: bool,
) -> Result<(UpstreamStream, IdleHandle), ProxyError> {
    let authority = target.authority();
    let connect_error = |source: io::Error| ProxyError::Connect {
        authority: authority.clone(),
        source,
    };

    let tcp = tokio::time::timeout(timeout, TcpStream::connect((target.host.as_str(), target.port)))
        .await
        .map_err(|_| connect_error(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(connect_error)?;
    configure_socket(&tcp);

    let (io, idle) = IdleTimeout::new(tcp, timeout);
    if !target.secure {
        return Ok((UpstreamStream::Plain(io), idle));
    }

    let connector = tls::client_connector(http2)?;
    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| ProxyError::Tls(format!("invalid server name {:?}: {e}", target.host)))?;
    let stream = connector.connect(server_name, io).await.map_err(connect_error)?;

    tracing::trace!(authority = %authority, http2, "TLS session established");
    Ok((UpstreamStream::Tls(Box::new(stream)), idle))
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            UpstreamStream::Plain(s) => s.is_write_vectored(),
            UpstreamStream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
