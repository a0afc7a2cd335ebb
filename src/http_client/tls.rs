//! Client-side TLS configuration with public-key pinning.
//!
//! Pins are pre-shared SHA-256 hashes of a server certificate's
//! SubjectPublicKeyInfo, keyed by server name. Verification runs the
//! standard chain checks first, then compares the leaf SPKI digest against
//! the pinned set; names without pins pass through untouched.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::check::{Checker, Object};

/// TLS configuration errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A certificate file could not be read.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A certificate file did not contain loadable certificates.
    #[error("cannot load certificates from {0}")]
    InvalidCertificate(PathBuf),

    /// The verifier could not be assembled.
    #[error("cannot build certificate verifier: {0}")]
    Verifier(String),
}

/// Client TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsClientCfg {
    /// Additional PEM CA bundles trusted besides the standard web roots.
    #[serde(default)]
    pub ca_certificates: Vec<PathBuf>,

    /// `server_name` to hex SHA-256 SPKI digests.
    #[serde(default)]
    pub public_key_pins: HashMap<String, Vec<String>>,
}

impl Object for TlsClientCfg {
    fn check(&self, c: &mut Checker) {
        static PIN_REGEX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

        let pin_re = PIN_REGEX.get_or_init(|| {
            Regex::new("^[0-9a-fA-F]{64}$").expect("failed to compile pin regex")
        });

        c.with_child("public_key_pins", |c| {
            for (name, pins) in &self.public_key_pins {
                c.with_child(name.clone(), |c| {
                    for (i, pin) in pins.iter().enumerate() {
                        c.check_string_match(i, pin, pin_re);
                    }
                });
            }
        });
    }
}

/// Build a rustls client configuration implementing the pinning policy.
pub(super) fn client_config(cfg: &TlsClientCfg) -> Result<ClientConfig, TlsError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for path in &cfg.ca_certificates {
        for cert in load_certificates(path)? {
            root_store
                .add(cert)
                .map_err(|_| TlsError::InvalidCertificate(path.clone()))?;
        }
    }

    let webpki = WebPkiServerVerifier::builder(Arc::new(root_store))
        .build()
        .map_err(|err| TlsError::Verifier(err.to_string()))?;

    let verifier = PinningVerifier {
        inner: webpki,
        pins: cfg.public_key_pins.clone(),
    };

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(config)
}

/// Load the certificates of a PEM bundle.
pub fn load_certificates(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let data = fs::read(path).map_err(|source| TlsError::ReadFile {
        path: path.clone(),
        source,
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|_| TlsError::InvalidCertificate(path.clone()))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(path.clone()));
    }

    Ok(certs)
}

/// Standard webpki verification followed by SPKI pin comparison.
#[derive(Debug)]
struct PinningVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: HashMap<String, Vec<String>>,
}

impl PinningVerifier {
    fn check_pins(
        &self,
        end_entity: &CertificateDer<'_>,
        server_name: &ServerName<'_>,
    ) -> Result<(), rustls::Error> {
        let name = match server_name {
            ServerName::DnsName(name) => name.as_ref().to_string(),
            ServerName::IpAddress(addr) => std::net::IpAddr::from(*addr).to_string(),
            _ => return Ok(()),
        };

        let Some(pins) = self.pins.get(&name) else {
            return Ok(());
        };

        let (_, cert) = x509_parser::parse_x509_certificate(end_entity.as_ref())
            .map_err(|_| rustls::Error::General("cannot parse server certificate".to_string()))?;

        let digest = hex::encode(Sha256::digest(cert.tbs_certificate.subject_pki.raw));

        if !pins.iter().any(|pin| pin.eq_ignore_ascii_case(&digest)) {
            return Err(rustls::Error::General(
                "invalid server certificate".to_string(),
            ));
        }

        Ok(())
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        self.check_pins(end_entity, server_name)?;

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg_check() {
        let mut cfg = TlsClientCfg::default();
        cfg.public_key_pins.insert(
            "example.com".to_string(),
            vec!["28278b7c0a25f01d3cab639633b9487f9ea1e9a2176dc9595a3f01323aa44284".to_string()],
        );

        let mut c = Checker::new();
        cfg.check(&mut c);
        assert!(c.errors().is_empty());

        cfg.public_key_pins
            .insert("other.com".to_string(), vec!["not-a-digest".to_string()]);

        let mut c = Checker::new();
        cfg.check(&mut c);
        assert_eq!(c.errors().len(), 1);
        assert_eq!(
            c.errors()[0].pointer.to_string(),
            "/public_key_pins/other.com/0"
        );
    }

    #[test]
    fn test_load_certificates_missing_file() {
        let path = PathBuf::from("/nonexistent/ca.pem");
        assert!(matches!(
            load_certificates(&path),
            Err(TlsError::ReadFile { .. })
        ));
    }
}
