//! TLS configuration for both sides of the proxy.
//!
//! # Responsibilities
//! - Load PEM certificate chains and private keys for the listener
//! - Build server configs with ALPN matching the listener mode
//! - Provide shared client configs (native roots) for HTTPS upstreams

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use hyper_rustls::ConfigBuilderExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ProxyError;

/// Both sides pin `ring`; rustls may be built with more than one provider.
fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate chain and key loaded from disk.
#[derive(Debug)]
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Load TLS material from certificate and key files.
pub fn load_tls_material(cert_path: &Path, key_path: &Path) -> Result<TlsMaterial, ProxyError> {
    let cert_file = File::open(cert_path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open certificate file {cert_path:?}: {e}"))
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate file: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "No certificates found in certificate file: {cert_path:?}"
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open private key file {key_path:?}: {e}"))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ProxyError::Tls(format!("Failed to parse private key file: {e}")))?
        .ok_or_else(|| ProxyError::Tls(format!("No private key found in key file: {key_path:?}")))?;

    Ok(TlsMaterial { certs, key })
}

/// Build an acceptor advertising the given ALPN protocols.
pub fn server_acceptor(material: &TlsMaterial, alpn: &[&[u8]]) -> Result<TlsAcceptor, ProxyError> {
    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(format!("Unsupported TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(material.certs.clone(), material.key.clone_key())
        .map_err(|e| ProxyError::Tls(format!("Failed to build TLS configuration: {e}")))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(TlsAcceptor::from(Arc::new(config)))
}

static HTTP1_CLIENT: OnceLock<Result<TlsConnector, String>> = OnceLock::new();
static HTTP2_CLIENT: OnceLock<Result<TlsConnector, String>> = OnceLock::new();

fn build_client(alpn: &[u8]) -> Result<TlsConnector, String> {
    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("Unsupported TLS protocol versions: {e}"))?
        .with_native_roots()
        .map_err(|e| format!("Failed to load native root certificates: {e}"))?
        .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Shared connector for HTTPS upstreams, negotiating `h2` or `http/1.1`.
pub fn client_connector(http2: bool) -> Result<TlsConnector, ProxyError> {
    let slot = if http2 { &HTTP2_CLIENT } else { &HTTP1_CLIENT };
    slot.get_or_init(|| build_client(if http2 { b"h2" } else { b"http/1.1" }))
        .clone()
        .map_err(ProxyError::Tls)
}
