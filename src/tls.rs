//! TLS layer on top of the raw sockets.
//!
//! A `TlsContext` holds the server certificate; each accepted socket gets a
//! `TlsSession` whose read/write calls drive the handshake transparently and
//! surface `WouldBlock` exactly like a plain non-blocking socket, so the
//! reactor treats encrypted and cleartext connections identically.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig as RustlsConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to parse PEM: {0}")]
    Pem(#[from] io::Error),
    #[error("no private key found in PEM input")]
    NoPrivateKey,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Server-wide TLS state, shared by every accepted session.
#[derive(Debug)]
pub struct TlsContext {
    config: Arc<RustlsConfig>,
}

impl TlsContext {
    /// Build a context from PEM-encoded certificate chain and private key.
    /// Only `http/1.1` is offered via ALPN.
    pub fn from_cert_pems(cert: &[u8], key: &[u8]) -> Result<Self, TlsError> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &cert[..]).collect::<Result<_, _>>()?;
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut &key[..])?.ok_or(TlsError::NoPrivateKey)?;

        let mut config = RustlsConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsContext {
            config: Arc::new(config),
        })
    }

    pub(crate) fn accept(&self) -> Result<TlsSession, rustls::Error> {
        Ok(TlsSession {
            conn: ServerConnection::new(Arc::clone(&self.config))?,
        })
    }
}

/// Per-connection TLS state. All I/O goes through the owning reactor thread.
pub(crate) struct TlsSession {
    conn: ServerConnection,
}

impl TlsSession {
    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Read decrypted bytes, driving the handshake as needed.
    pub(crate) fn read<S: Read + Write>(&mut self, sock: &mut S, buf: &mut [u8]) -> io::Result<usize> {
        rustls::Stream::new(&mut self.conn, sock).read(buf)
    }

    /// Encrypt and write; short writes surface as a short count.
    pub(crate) fn write<S: Read + Write>(&mut self, sock: &mut S, buf: &[u8]) -> io::Result<usize> {
        rustls::Stream::new(&mut self.conn, sock).write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_rejected() {
        let cert = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let err = TlsContext::from_cert_pems(cert, b"").unwrap_err();
        assert!(matches!(
            err,
            TlsError::NoPrivateKey | TlsError::Pem(_) | TlsError::Rustls(_)
        ));
    }
}
