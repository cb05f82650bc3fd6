//! TLS material for the HTTPS listener

use anyhow::{anyhow, Context, Result};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, read_all, Item};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Parse every certificate in a PEM bundle
pub fn load_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let parsed = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;
    if parsed.is_empty() {
        return Err(anyhow!("No certificates found in PEM data"));
    }
    Ok(parsed)
}

/// Parse the first private key in a PEM document
pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    for item in read_all(&mut reader) {
        match item.map_err(|e| anyhow!("Failed to parse private key: {}", e))? {
            Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => {}
        }
    }
    Err(anyhow!("No private key found in PEM data"))
}

/// Build a server configuration from PEM-encoded certificate chain and key
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let chain = load_certificates(cert_pem)?;
    debug!("Loaded {} certificate(s)", chain.len());
    let key = load_private_key(key_pem)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("Failed to select TLS versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Read the certificate and key files for the listener
///
/// Unreadable material is fatal: TLS was explicitly requested.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS certificate from {}", cert_path.display()))?;
    let key = std::fs::read(key_path)
        .with_context(|| format!("Failed to read TLS key from {}", key_path.display()))?;
    let config = server_config_from_pem(&cert, &key)?;
    info!(
        "TLS configuration loaded from {} and {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(config)
}
