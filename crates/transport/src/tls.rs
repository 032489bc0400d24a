// Path: crates/transport/src/tls.rs
//! TLS support for the TCP adapters.
//!
//! The master presents a certificate chain and may require client
//! certificates; minions verify against the standard trust store unless a
//! CA bundle is pinned in config. Both directions run the same framed
//! protocol over the encrypted stream.

use herd_types::config::{TlsClientConfig, TlsServerConfig};
use herd_types::error::TransportError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

fn tls_err(ctx: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::ProtocolViolation(format!("tls {}: {}", ctx, e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| tls_err("open cert", e))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err("parse cert", e))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|e| tls_err("open key", e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_err("parse key", e))?
        .ok_or_else(|| tls_err("parse key", "no private key in file"))
}

/// Builds the listening-side TLS configuration.
pub fn server_config(cfg: &TlsServerConfig) -> Result<Arc<ServerConfig>, TransportError> {
    let certs = load_certs(&cfg.cert)?;
    let key = load_key(&cfg.key)?;
    let builder = ServerConfig::builder();

    let config = if cfg.require_client_cert {
        let ca = cfg
            .ca
            .as_ref()
            .ok_or_else(|| tls_err("config", "require_client_cert set without ca"))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca)? {
            roots.add(cert).map_err(|e| tls_err("client ca", e))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| tls_err("client verifier", e))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| tls_err("server cert", e))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| tls_err("server cert", e))?
    };
    Ok(Arc::new(config))
}

/// Builds the connecting-side TLS configuration.
pub fn client_config(cfg: &TlsClientConfig) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    match &cfg.ca {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| tls_err("ca", e))?;
            }
        }
        None => {
            for cert in
                rustls_native_certs::load_native_certs().map_err(|e| tls_err("trust store", e))?
            {
                // Individual store entries can be stale; skip them.
                let _ = roots.add(cert);
            }
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (&cfg.cert, &cfg.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| tls_err("client cert", e))?,
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(tls_err("config", "client cert and key must be set together")),
    };
    Ok(Arc::new(config))
}

/// A stream that is either plain TCP or TLS on one side or the other.
pub enum MaybeTls {
    /// Unencrypted TCP.
    Plain(TcpStream),
    /// Server-side TLS.
    Server(tokio_rustls::server::TlsStream<TcpStream>),
    /// Client-side TLS.
    Client(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Server(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Client(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Server(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Client(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Server(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Client(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Server(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Client(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Accept-side wrapping: runs the TLS handshake when configured.
pub async fn accept_stream(
    stream: TcpStream,
    tls: Option<&tokio_rustls::TlsAcceptor>,
) -> Result<MaybeTls, TransportError> {
    match tls {
        None => Ok(MaybeTls::Plain(stream)),
        Some(acceptor) => acceptor
            .accept(stream)
            .await
            .map(MaybeTls::Server)
            .map_err(|e| tls_err("accept", e)),
    }
}

/// Connect-side wrapping: runs the TLS handshake when configured.
pub async fn connect_stream(
    stream: TcpStream,
    host: &str,
    tls: Option<&tokio_rustls::TlsConnector>,
) -> Result<MaybeTls, TransportError> {
    match tls {
        None => Ok(MaybeTls::Plain(stream)),
        Some(connector) => {
            let name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| tls_err("server name", e))?;
            connector
                .connect(name, stream)
                .await
                .map(MaybeTls::Client)
                .map_err(|e| tls_err("connect", e))
        }
    }
}
