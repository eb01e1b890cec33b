//! TLS upgrade material for the gateway
//!
//! Loads already-issued certificate/key pairs (PEM) and builds the
//! acceptor used when a client probes with SSLRequest. For the `cert`
//! auth method the handshake also requests a client certificate and
//! verifies it against the configured certificate authority; the auth
//! flow then only has to match the certificate identity to the startup
//! user.

use crate::error::{GatewayError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Certificate material locations, as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsPaths {
    /// Path to the server certificate chain (PEM)
    pub cert_file: PathBuf,

    /// Path to the server private key (PEM)
    pub key_file: PathBuf,

    /// Path to the CA bundle trusted for client certificates (PEM);
    /// required for the `cert` auth method
    pub ca_file: Option<PathBuf>,
}

/// Loaded TLS state shared by all connections
#[derive(Clone)]
pub struct TlsSettings {
    acceptor: TlsAcceptor,
}

impl TlsSettings {
    /// Load certificate material and build the acceptor
    pub fn load(paths: &TlsPaths, require_client_cert: bool) -> Result<Self> {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();

        let certs = read_certs(&paths.cert_file)?;
        let key = read_key(&paths.key_file)?;

        let builder = if require_client_cert {
            let ca_file = paths.ca_file.as_ref().ok_or_else(|| {
                GatewayError::Config(
                    "cert authentication requires a CA bundle (ca_file)".to_string(),
                )
            })?;

            let mut roots = RootCertStore::empty();
            for cert in read_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| GatewayError::Tls(format!("Invalid CA certificate: {}", e)))?;
            }

            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| GatewayError::Tls(format!("Client verifier error: {}", e)))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| GatewayError::Tls(format!("TLS configuration error: {}", e)))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// The acceptor driving server-side handshakes
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

fn read_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Config(format!("Failed to open {}: {}", path.display(), e)))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .map_err(|e| GatewayError::Tls(format!("Failed to parse {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(GatewayError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Config(format!("Failed to open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| GatewayError::Tls(format!("Failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| GatewayError::Tls(format!("No private key found in {}", path.display())))
}

/// Identity carried by a verified client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject common name, when present
    pub common_name: Option<String>,
}

/// Extract the peer identity from a completed server-side handshake
///
/// Returns `None` when the client presented no certificate (only possible
/// when the handshake did not request one).
pub fn peer_identity<S>(stream: &tokio_rustls::server::TlsStream<S>) -> Option<PeerIdentity> {
    let (_, connection) = stream.get_ref();
    let leaf = connection.peer_certificates()?.first()?;
    Some(PeerIdentity {
        common_name: common_name_from_der(leaf.as_ref()),
    })
}

fn common_name_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);
    common_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_pem(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_server_material() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let cert_file = write_pem(&cert.pem());
        let key_file = write_pem(&key.serialize_pem());

        let paths = TlsPaths {
            cert_file: cert_file.path().to_path_buf(),
            key_file: key_file.path().to_path_buf(),
            ca_file: None,
        };
        TlsSettings::load(&paths, false).unwrap();

        // Requesting client certs without a CA bundle is a config error
        assert!(matches!(
            TlsSettings::load(&paths, true),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_load_with_client_ca() {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&server_key)
            .unwrap();

        let cert_file = write_pem(&server_cert.pem());
        let key_file = write_pem(&server_key.serialize_pem());
        let ca_file = write_pem(&ca_cert.pem());

        let paths = TlsPaths {
            cert_file: cert_file.path().to_path_buf(),
            key_file: key_file.path().to_path_buf(),
            ca_file: Some(ca_file.path().to_path_buf()),
        };
        TlsSettings::load(&paths, true).unwrap();
    }

    #[test]
    fn test_common_name_extraction() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "demo-user");
        let cert = params.self_signed(&key).unwrap();

        assert_eq!(
            common_name_from_der(cert.der()),
            Some("demo-user".to_string())
        );
    }
}
