//! TLS options shared by network clients

use anyhow::{anyhow, Context, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName};
use serde::Deserialize;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// TLS section of a module's options
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TlsConfig {
    /// CA bundle replacing the bundled web roots
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
    /// Client certificate chain for mutual TLS
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    /// Accept any server certificate
    #[serde(default)]
    pub tls_skip_verify: bool,
}

impl TlsConfig {
    /// True when nothing deviates from the defaults
    pub fn is_default(&self) -> bool {
        self == &TlsConfig::default()
    }

    /// Build a rustls client configuration
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        match &self.tls_ca {
            Some(ca) => {
                for cert in load_certs(ca)? {
                    roots
                        .add(&cert)
                        .with_context(|| format!("Invalid CA certificate in {}", ca.display()))?;
                }
            }
            None => {
                roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                        ta.subject,
                        ta.spki,
                        ta.name_constraints,
                    )
                }));
            }
        }

        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);

        let mut config = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .context("Invalid client certificate or key")?,
            (None, None) => builder.with_no_client_auth(),
            _ => return Err(anyhow!("tls_cert and tls_key must be set together")),
        };

        if self.tls_skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerification));
        }

        Ok(config)
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse certificate {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open private key {}", path.display()))?;
    let items = rustls_pemfile::read_all(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key {}", path.display()))?;

    items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}

struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_web_roots() {
        let tls = TlsConfig::default();
        assert!(tls.is_default());
        assert!(tls.client_config().is_ok());
    }

    #[test]
    fn test_skip_verify() {
        let tls = TlsConfig {
            tls_skip_verify: true,
            ..Default::default()
        };
        assert!(!tls.is_default());
        assert!(tls.client_config().is_ok());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let tls = TlsConfig {
            tls_cert: Some(PathBuf::from("/nonexistent/client.crt")),
            ..Default::default()
        };
        let err = tls.client_config().unwrap_err();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn test_missing_ca_file() {
        let tls = TlsConfig {
            tls_ca: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(tls.client_config().is_err());
    }

    #[test]
    fn test_empty_ca_file() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, "not a certificate\n").unwrap();
        let tls = TlsConfig {
            tls_ca: Some(ca),
            ..Default::default()
        };
        let err = tls.client_config().unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }

    #[test]
    fn test_deserialize_from_options() {
        let tls: TlsConfig =
            serde_yaml::from_str("tls_skip_verify: true\ntls_ca: /etc/ssl/ca.pem\nurl: x").unwrap();
        assert!(tls.tls_skip_verify);
        assert_eq!(tls.tls_ca, Some(PathBuf::from("/etc/ssl/ca.pem")));
    }
}
