use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;
use std::sync::Arc;

use crate::TlsError;

/// Load certificates from PEM content string
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let chain = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            tracing::debug!("Certificate PEM rejected: {}", e);
            TlsError::Certificate(format!("Failed to parse certificates: {}", e))
        })?;

    if chain.is_empty() {
        return Err(TlsError::Certificate(
            "No certificates found in PEM content".to_string(),
        ));
    }
    tracing::debug!(certificates = chain.len(), "Loaded certificate chain");
    Ok(chain)
}

/// Load a private key from PEM content string
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| {
            tracing::debug!("Private key PEM rejected: {}", e);
            TlsError::Certificate(format!("Failed to parse private key: {}", e))
        })?
        .ok_or_else(|| TlsError::Certificate("No private key found in PEM content".to_string()))
}

/// Build a rustls signing key pair from a PEM certificate chain and private key
///
/// The result is what a certificate resolver hands to rustls during a handshake.
pub fn certified_key_from_pem(
    chain_pem: &str,
    key_pem: &str,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let chain = load_certs_from_pem(chain_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| TlsError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Client TLS config trusting only the given CA certificate(s)
pub fn client_config_from_pem(ca_pem: &str) -> Result<ClientConfig, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs_from_pem(ca_pem)? {
        root_store.add(cert).map_err(|e| {
            TlsError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["example.com".to_string()])
            .expect("generate cert");
        (cert.cert.pem(), cert.signing_key.serialize_pem())
    }

    #[test]
    fn test_certified_key_from_pem() {
        let (cert_pem, key_pem) = self_signed();
        let key = certified_key_from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn test_empty_chain_rejected() {
        let (_, key_pem) = self_signed();
        let err = certified_key_from_pem("", &key_pem).unwrap_err();
        assert!(matches!(err, TlsError::Certificate(_)));
    }

    #[test]
    fn test_missing_key_rejected() {
        let (cert_pem, _) = self_signed();
        assert!(load_private_key_from_pem(&cert_pem).is_err());
    }

    #[test]
    fn test_client_config_from_pem() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (cert_pem, _) = self_signed();
        assert!(client_config_from_pem(&cert_pem).is_ok());
    }
}
