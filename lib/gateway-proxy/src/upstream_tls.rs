//! Outbound TLS for HTTPS upstreams
//!
//! Upstream certificates are verified against the bundled web PKI roots plus
//! an optional deployment CA. A client certificate may be presented for
//! mutual TLS with the backend.

use crate::tls::{load_certificates, load_private_key};
use anyhow::{anyhow, Result};
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tracing::info;

/// PEM material for upstream connections
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpstreamTls {
    /// Extra CA bundle trusted for upstream certificates
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate chain and key presented to upstreams
    pub client_cert_pem: Option<(Vec<u8>, Vec<u8>)>,
}

impl UpstreamTls {
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca_pem) = &self.ca_pem {
            let ca_certs = load_certificates(ca_pem)?;
            let count = ca_certs.len();
            for cert in ca_certs {
                roots
                    .add(cert)
                    .map_err(|e| anyhow!("Failed to add CA certificate to root store: {}", e))?;
            }
            info!("Trusting {} additional upstream CA certificate(s)", count);
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("Failed to select TLS versions: {}", e))?
            .with_root_certificates(roots);

        let config = match &self.client_cert_pem {
            Some((cert_pem, key_pem)) => {
                let chain = load_certificates(cert_pem)?;
                let key = load_private_key(key_pem)?;
                info!("Presenting client certificate to upstreams");
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| anyhow!("Invalid upstream client certificate: {}", e))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_public_roots() {
        let config = UpstreamTls::default().client_config().unwrap();
        assert!(!config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_invalid_ca_is_rejected() {
        let tls = UpstreamTls {
            ca_pem: Some(b"garbage".to_vec()),
            client_cert_pem: None,
        };
        assert!(tls.client_config().is_err());
    }
}
