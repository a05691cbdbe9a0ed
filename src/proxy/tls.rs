//! Listener-side TLS.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Build a TLS acceptor from a PEM certificate chain and private key.
pub fn build_tls_acceptor(config: &TlsConfig) -> io::Result<TlsAcceptor> {
    let cert_file = File::open(&config.cert)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", config.cert, e)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificate found in {}", config.cert),
        ));
    }

    let key_file = File::open(&config.key)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", config.key, e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", config.key),
        )
    })?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
