//! TLS listener support
//!
//! Builds a rustls server configuration from the PEM files named in
//! [`TlsConfig`] and wraps accepted streams for the session engine.

use crate::broker::config::TlsConfig;
use crate::error::{MqttError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::debug;

/// Material for a TLS listener
#[derive(Debug)]
pub struct TlsAcceptorConfig {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    /// Trust anchors for client certificates; `None` disables client auth
    pub client_ca_certs: Option<Vec<CertificateDer<'static>>>,
    pub require_client_cert: bool,
}

impl TlsAcceptorConfig {
    #[must_use]
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
            client_ca_certs: None,
            require_client_cert: false,
        }
    }

    /// Loads every file named by a listener's [`TlsConfig`]
    ///
    /// # Errors
    ///
    /// Returns an error if a file is unreadable or holds no usable PEM item
    pub async fn from_config(tls: &TlsConfig) -> Result<Self> {
        let cert_chain = Self::load_cert_chain_from_file(&tls.cert_file).await?;
        let private_key = Self::load_private_key_from_file(&tls.key_file).await?;
        let mut config = Self::new(cert_chain, private_key)
            .with_require_client_cert(tls.require_client_cert);
        if let Some(ca_file) = &tls.ca_file {
            config = config.with_client_ca_certs(Self::load_cert_chain_from_file(ca_file).await?);
        }
        Ok(config)
    }

    /// Reads all certificates from a PEM file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains no certificate
    pub async fn load_cert_chain_from_file(
        path: impl AsRef<Path>,
    ) -> Result<Vec<CertificateDer<'static>>> {
        let path = path.as_ref();
        let pem = tokio::fs::read(path).await?;
        let certs = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                MqttError::Configuration(format!("Invalid PEM in {}: {e}", path.display()))
            })?;
        if certs.is_empty() {
            return Err(MqttError::Configuration(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    /// Reads the first PKCS#8, PKCS#1 or SEC1 private key from a PEM file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains no key
    pub async fn load_private_key_from_file(
        path: impl AsRef<Path>,
    ) -> Result<PrivateKeyDer<'static>> {
        let path = path.as_ref();
        let pem = tokio::fs::read(path).await?;
        rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| {
                MqttError::Configuration(format!("Invalid PEM in {}: {e}", path.display()))
            })?
            .ok_or_else(|| {
                MqttError::Configuration(format!("No private key found in {}", path.display()))
            })
    }

    #[must_use]
    pub fn with_client_ca_certs(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.client_ca_certs = Some(certs);
        self
    }

    #[must_use]
    pub fn with_require_client_cert(mut self, require: bool) -> Self {
        self.require_client_cert = require;
        self
    }

    /// Builds the rustls server configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate, key or CA set is rejected by rustls
    pub fn build_server_config(&self) -> Result<ServerConfig> {
        let builder = if let Some(ca_certs) = &self.client_ca_certs {
            let mut roots = RootCertStore::empty();
            for cert in ca_certs {
                roots.add(cert.clone()).map_err(|e| {
                    MqttError::Configuration(format!("Failed to add client CA cert: {e}"))
                })?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if self.require_client_cert {
                verifier.build()
            } else {
                verifier.allow_unauthenticated().build()
            }
            .map_err(|e| {
                MqttError::Configuration(format!("Failed to build client verifier: {e}"))
            })?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else if self.require_client_cert {
            return Err(MqttError::Configuration(
                "Client certificates required but no CA file configured".to_string(),
            ));
        } else {
            ServerConfig::builder().with_no_client_auth()
        };

        let mut config = builder
            .with_single_cert(self.cert_chain.clone(), self.private_key.clone_key())
            .map_err(|e| {
                MqttError::Configuration(format!("Failed to configure server cert: {e}"))
            })?;
        config.alpn_protocols = vec![b"mqtt".to_vec()];
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if [`Self::build_server_config`] fails
    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.build_server_config()?)))
    }
}

/// Server side of an established TLS session
pub struct TlsStreamWrapper {
    inner: TlsStream<TcpStream>,
}

impl TlsStreamWrapper {
    #[must_use]
    pub fn new(stream: TlsStream<TcpStream>) -> Self {
        Self { inner: stream }
    }

    /// # Errors
    ///
    /// Returns an error if the peer address cannot be retrieved
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner
            .get_ref()
            .0
            .peer_addr()
            .map_err(|e| MqttError::Io(format!("Failed to get peer address: {e}")))
    }

    #[must_use]
    pub fn has_client_cert(&self) -> bool {
        self.inner.get_ref().1.peer_certificates().is_some()
    }
}

impl AsyncRead for TlsStreamWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsStreamWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Runs the server handshake on a freshly accepted socket
///
/// # Errors
///
/// Returns an error if the handshake fails
pub async fn accept_tls_connection(
    acceptor: &TlsAcceptor,
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<TlsStreamWrapper> {
    let stream = acceptor
        .accept(tcp_stream)
        .await
        .map_err(|e| MqttError::ConnectionError(format!("TLS handshake failed: {e}")))?;
    let wrapper = TlsStreamWrapper::new(stream);
    debug!(addr = %peer_addr, client_cert = wrapper.has_client_cert(), "TLS handshake completed");
    Ok(wrapper)
}
