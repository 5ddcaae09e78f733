//! TLS connector construction for the control channel.
//!
//! `wss://` URLs use rustls with the webpki root store. When a client
//! certificate and key are configured, they are presented for mutual
//! authentication. rustls only negotiates TLS 1.2/1.3 with forward-secret
//! AEAD suites, which is exactly the cipher policy the control plane expects.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_tungstenite::Connector;

/// Builds the connector for a `wss://` connection.
///
/// Returns `None` when no client certificate is configured, letting
/// tokio-tungstenite use its default webpki-roots connector.
pub fn build_connector(
    cert_file: Option<&Path>,
    key_file: Option<&Path>,
) -> Result<Option<Connector>> {
    let (Some(cert_path), Some(key_path)) = (cert_file, key_file) else {
        if cert_file.is_some() || key_file.is_some() {
            log::warn!("Client TLS requires both cert_file and key_file; ignoring partial config");
        }
        return Ok(None);
    };

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    // Name the provider explicitly: the dependency graph enables more than
    // one rustls crypto backend, so the automatic selection would panic.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("Failed to configure client certificate")?;

    log::info!(
        "Loaded client certificate from {} for mutual TLS",
        cert_path.display()
    );
    Ok(Some(Connector::Rustls(Arc::new(config))))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "No certificates found in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cert_config_yields_default_connector() {
        let connector = build_connector(None, None).unwrap();
        assert!(connector.is_none());
    }

    #[test]
    fn test_partial_cert_config_is_ignored() {
        let connector = build_connector(Some(Path::new("/nonexistent.pem")), None).unwrap();
        assert!(connector.is_none());
    }

    #[test]
    fn test_missing_cert_file_errors() {
        let result = build_connector(
            Some(Path::new("/nonexistent-cert.pem")),
            Some(Path::new("/nonexistent-key.pem")),
        );
        assert!(result.is_err());
    }
}
