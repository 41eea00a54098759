//! TLS support for the control channel listener.
//!
//! Certificates are discovered from a letsencrypt-style live directory
//! (`<root>/<domain>/fullchain.pem` + `privkey.pem`). When none are found
//! the listener falls back to plaintext so development machines still work.

use anyhow::{Context, Result, bail};
use log::debug;
use rustls::ServerConfig;
use rustls::pki_types::PrivateKeyDer;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// A discovered certificate/key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Scan a letsencrypt-style live directory for the first domain that has
/// both `fullchain.pem` and `privkey.pem`.
pub fn discover_certificates(live_root: &Path) -> Option<CertPaths> {
    let entries = std::fs::read_dir(live_root).ok()?;
    let mut domains: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    domains.sort();

    for domain in domains {
        let cert = domain.join("fullchain.pem");
        let key = domain.join("privkey.pem");
        if cert.is_file() && key.is_file() {
            debug!("using certificates from {}", domain.display());
            return Some(CertPaths { cert, key });
        }
    }
    None
}

/// Load a rustls server config from PEM files.
pub fn load_server_config(paths: &CertPaths) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(&paths.cert)
        .with_context(|| format!("opening certificate {}", paths.cert.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .context("reading certificate chain")?;
    if certs.is_empty() {
        bail!("no certificates in {}", paths.cert.display());
    }

    let key_file = File::open(&paths.key)
        .with_context(|| format!("opening private key {}", paths.key.display()))?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("reading private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", paths.key.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;

    Ok(Arc::new(config))
}

/// A listener stream that is either TLS or plaintext.
pub enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
