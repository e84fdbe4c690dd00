// TLS support
//
// The runtime treats certificate material as opaque: it accepts a pre-built
// rustls `ServerConfig` (or loads one from PEM as a convenience) and hands it
// to the acceptor.

use crate::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// TLS configuration for the HTTPS acceptor.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Wrap a pre-built server configuration.
    pub fn from_server_config(server_config: Arc<ServerConfig>) -> Self {
        Self { server_config }
    }

    /// Load certificate chain and private key from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        Self::from_pem_parts(certs, key)
    }

    /// Build from in-memory PEM bytes.
    pub fn from_pem_bytes(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, Error> {
        let certs = parse_certs(cert_pem)?;
        let key = parse_private_key(key_pem)?;
        Self::from_pem_parts(certs, key)
    }

    fn from_pem_parts(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, Error> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Internal(format!("failed to build TLS config: {}", e)))?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            server_config: Arc::new(config),
        })
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Internal(format!("failed to read certificates: {}", e)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = BufReader::new(pem);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Internal(format!("failed to parse certificates: {}", e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .map_err(|e| Error::Internal(format!("failed to read private key: {}", e)))?
        .ok_or_else(|| Error::Internal("no private key found in file".to_string()))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = BufReader::new(pem);
    private_key(&mut reader)
        .map_err(|e| Error::Internal(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::Internal("no private key found".to_string()))
}
