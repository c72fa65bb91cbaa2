//! TLS material for the query server and its clients
//!
//! Certificates and keys are PEM files. Server connections are wrapped by a
//! [`TlsAcceptor`] before any framing happens; remote mailboxes wrap their
//! outbound connection with a [`TlsConnector`] trusting the configured CA.

use crate::error::{Result, TransportError};
use rustls_pemfile::certs;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Server-side TLS configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the certificate chain (PEM)
    pub cert_path: String,
    /// Path to the private key (PEM, PKCS#8, PKCS#1 or SEC1)
    pub key_path: String,
}

impl TlsConfig {
    /// Create a new server TLS configuration
    pub fn new(cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Build an acceptor from the configured files
    pub fn create_acceptor(&self) -> Result<TlsAcceptor> {
        let chain = load_certs(Path::new(&self.cert_path))?;
        let key = load_private_key(Path::new(&self.key_path))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| TransportError::Tls(format!("invalid server certificate: {}", e)))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side TLS configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsClientConfig {
    /// Path to the CA certificate(s) trusted for server verification (PEM)
    pub ca_cert_path: String,
    /// Name expected in the server certificate
    pub server_name: String,
}

impl TlsClientConfig {
    /// Create a new client TLS configuration
    pub fn new(ca_cert_path: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            ca_cert_path: ca_cert_path.into(),
            server_name: server_name.into(),
        }
    }

    /// Build a connector trusting the configured CA
    pub fn create_connector(&self) -> Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(Path::new(&self.ca_cert_path))? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("invalid CA certificate: {}", e)))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Parsed server name for SNI and verification
    pub fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.server_name.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {}", e)))
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        TransportError::Tls(format!("cannot open {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("bad certificate in {}: {}", path.display(), e)))?;

    if chain.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("bad private key in {}: {}", path.display(), e)))?
        .ok_or_else(|| {
            TransportError::Tls(format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::PathBuf;

    /// Self-signed certificate for `localhost` written to a temp dir
    pub struct TestCert {
        pub dir: tempfile::TempDir,
        pub cert_path: PathBuf,
        pub key_path: PathBuf,
    }

    impl TestCert {
        pub fn generate() -> Self {
            let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .expect("generate certificate");
            let dir = tempfile::tempdir().expect("temp dir");
            let cert_path = dir.path().join("server.crt");
            let key_path = dir.path().join("server.key");
            std::fs::write(&cert_path, certified.cert.pem()).expect("write cert");
            std::fs::write(&key_path, certified.key_pair.serialize_pem()).expect("write key");
            Self {
                dir,
                cert_path,
                key_path,
            }
        }

        pub fn server_config(&self) -> TlsConfig {
            TlsConfig::new(
                self.cert_path.to_string_lossy(),
                self.key_path.to_string_lossy(),
            )
        }

        pub fn client_config(&self) -> TlsClientConfig {
            TlsClientConfig::new(self.cert_path.to_string_lossy(), "localhost")
        }
    }
}
