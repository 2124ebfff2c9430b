//! TLS material and identity extraction
//!
//! Both the API server and the peer client authenticate with the same
//! certificate. The server requires client certificates issued by the
//! cluster CA; the CN of the presented certificate becomes the caller's
//! identity.

use crate::error::{NodeError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Certificate, key, and CA bundle loaded from PEM files
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca: Vec<CertificateDer<'static>>,
}

impl TlsMaterial {
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self> {
        let certs = load_certificates(cert_path)?;
        if certs.is_empty() {
            return Err(NodeError::Tls(format!(
                "no certificates in {}",
                cert_path.display()
            )));
        }
        let key = load_private_key(key_path)?;
        let ca = load_certificates(ca_path)?;
        if ca.is_empty() {
            return Err(NodeError::Tls(format!(
                "no CA certificates in {}",
                ca_path.display()
            )));
        }
        Ok(Self { certs, key, ca })
    }

    /// The leaf certificate this server presents
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.certs[0]
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in &self.ca {
            roots
                .add(cert.clone())
                .map_err(|e| NodeError::Tls(format!("bad CA certificate: {e}")))?;
        }
        Ok(roots)
    }

    /// Server-side config: client certificates are mandatory
    pub fn server_config(&self) -> Result<ServerConfig> {
        let verifier = WebPkiClientVerifier::builder(Arc::new(self.root_store()?))
            .build()
            .map_err(|e| NodeError::Tls(format!("client verifier: {e}")))?;
        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| NodeError::Tls(format!("server config: {e}")))
    }

    /// Client-side config for peer calls, presenting our certificate
    pub fn client_config(&self) -> Result<ClientConfig> {
        ClientConfig::builder()
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| NodeError::Tls(format!("client config: {e}")))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| NodeError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| NodeError::Tls(format!("cannot parse {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| NodeError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| NodeError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| NodeError::Tls(format!("no private key in {}", path.display())))
}

/// Extract the subject CN from a DER certificate
pub fn common_name(certificate: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(certificate.as_ref()).ok()?;
    let name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    name
}

/// Human-readable certificate summary for diagnostics
pub fn describe_certificate(certificate: &CertificateDer<'_>) -> Result<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(certificate.as_ref())
        .map_err(|e| NodeError::Tls(format!("cannot parse certificate: {e}")))?;
    Ok(format!(
        "subject: {}\nissuer: {}\nserial: {}\nnot before: {}\nnot after: {}",
        parsed.subject(),
        parsed.issuer(),
        parsed.raw_serial_as_string(),
        parsed.validity().not_before,
        parsed.validity().not_after,
    ))
}
