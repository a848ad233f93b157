use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose,
};

use super::{Certificate, CertificateSource};
use crate::error::CertError;

/// Obtains a certificate for a domain from a certificate authority.
///
/// Domain validation, if the authority needs any, happens inside `issue`.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, domain: &str) -> Result<Certificate, CertError>;
}

/// Signs per-domain certificates with a CA held by the process
pub struct LocalCaIssuer {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_pem: String,
    validity_days: u32,
}

impl LocalCaIssuer {
    /// Use an existing CA certificate and key
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str, validity_days: u32) -> Result<Self, CertError> {
        let key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| CertError::Invalid(format!("CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key)
            .map_err(|e| CertError::Invalid(format!("CA certificate: {}", e)))?;
        Ok(Self {
            issuer,
            ca_cert_pem: ca_cert_pem.to_string(),
            validity_days,
        })
    }

    /// Generate a fresh self-signed CA
    pub fn generate(common_name: &str, validity_days: u32) -> Result<Self, CertError> {
        let key = KeyPair::generate().map_err(issue_error(common_name))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, common_name);
            dn
        };
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let cert = params
            .clone()
            .self_signed(&key)
            .map_err(issue_error(common_name))?;
        tracing::info!("Generated local issuing CA {:?}", common_name);

        Ok(Self {
            issuer: Issuer::new(params, key),
            ca_cert_pem: cert.pem(),
            validity_days,
        })
    }

    /// PEM of the issuing CA, for clients that need to trust it
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

fn issue_error(domain: &str) -> impl Fn(rcgen::Error) -> CertError + '_ {
    move |e| CertError::IssuanceFailed {
        domain: domain.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl CertificateIssuer for LocalCaIssuer {
    async fn issue(&self, domain: &str) -> Result<Certificate, CertError> {
        let key = KeyPair::generate().map_err(issue_error(domain))?;

        let mut params =
            CertificateParams::new(vec![domain.to_string()]).map_err(issue_error(domain))?;
        params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, domain);
            dn
        };
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let today = Utc::now().date_naive();
        let expires = today + chrono::Days::new(u64::from(self.validity_days.max(1)));
        params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

        let cert = params
            .signed_by(&key, &self.issuer)
            .map_err(issue_error(domain))?;
        tracing::info!(domain = %domain, "Issued certificate, expires {}", expires);

        Ok(Certificate {
            domain: domain.to_string(),
            chain_pem: format!("{}{}", cert.pem(), self.ca_cert_pem),
            key_pem: key.serialize_pem(),
            source: CertificateSource::Automated,
            expires_at: expires
                .and_hms_opt(0, 0, 0)
                .map(|at| Utc.from_utc_datetime(&at)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_with_generated_ca() {
        let issuer = LocalCaIssuer::generate("Test CA", 30).unwrap();
        let cert = issuer.issue("app.example.com").await.unwrap();

        assert_eq!(cert.domain, "app.example.com");
        assert_eq!(cert.source, CertificateSource::Automated);
        assert_eq!(cert.chain_pem.matches("-----BEGIN CERTIFICATE-----").count(), 2);
        assert!(cert.expires_at.unwrap() > Utc::now() + chrono::Duration::days(28));

        // The material must load as a rustls key
        switchyard_common::certified_key_from_pem(&cert.chain_pem, &cert.key_pem).unwrap();
    }

    #[tokio::test]
    async fn test_issue_from_pem_ca() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = params.self_signed(&key).unwrap();

        let issuer = LocalCaIssuer::from_pem(&ca.pem(), &key.serialize_pem(), 7).unwrap();
        assert_eq!(issuer.ca_cert_pem(), ca.pem());

        let cert = issuer.issue("*.example.com").await.unwrap();
        assert!(cert.chain_pem.ends_with(&ca.pem()));
    }
}
