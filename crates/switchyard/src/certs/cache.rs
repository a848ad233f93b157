use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::types::Json;
use sqlx::PgPool;

use super::Certificate;
use crate::error::CertError;

/// Certificate storage shared by every router process, keyed by domain
#[async_trait]
pub trait CertificateCache: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<Certificate>, CertError>;

    async fn put(&self, certificate: &Certificate) -> Result<(), CertError>;
}

/// Process-local cache, for single instance deployments and tests
#[derive(Default)]
pub struct MemoryCertificateCache {
    entries: DashMap<String, Certificate>,
}

impl MemoryCertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CertificateCache for MemoryCertificateCache {
    async fn get(&self, domain: &str) -> Result<Option<Certificate>, CertError> {
        Ok(self.entries.get(domain).map(|c| c.clone()))
    }

    async fn put(&self, certificate: &Certificate) -> Result<(), CertError> {
        self.entries
            .insert(certificate.domain.clone(), certificate.clone());
        Ok(())
    }
}

/// Certificates in the `tls_certificates` table next to the routes
pub struct PgCertificateCache {
    pool: PgPool,
}

impl PgCertificateCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn cache_error(e: sqlx::Error) -> CertError {
    CertError::Cache(e.to_string())
}

#[async_trait]
impl CertificateCache for PgCertificateCache {
    async fn get(&self, domain: &str) -> Result<Option<Certificate>, CertError> {
        let row: Option<Json<Certificate>> =
            sqlx::query_scalar("SELECT certificate FROM tls_certificates WHERE domain = $1")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await
                .map_err(cache_error)?;
        Ok(row.map(|Json(certificate)| certificate))
    }

    async fn put(&self, certificate: &Certificate) -> Result<(), CertError> {
        sqlx::query(
            "INSERT INTO tls_certificates (domain, certificate, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (domain) DO UPDATE
             SET certificate = EXCLUDED.certificate, updated_at = now()",
        )
        .bind(&certificate.domain)
        .bind(Json(certificate))
        .execute(&self.pool)
        .await
        .map_err(cache_error)?;
        Ok(())
    }
}
