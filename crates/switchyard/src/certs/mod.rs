//! TLS certificate resolution
//!
//! For every TLS connection the manager picks a certificate for the server
//! name the client asked for, in this order:
//!
//! 1. certificate attached to the route claiming that exact domain
//! 2. certificate attached to the most specific wildcard route covering it
//! 3. the static process keypair
//! 4. automated issuance: shared cache first, otherwise issue, persist, return
//!
//! Expired route certificates are skipped. Automated issuance runs at most once
//! at a time per domain; concurrent handshakes wait on the same attempt.

mod acme;
mod cache;
mod issuer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};

use crate::error::CertError;
use crate::route::{normalize_domain, Route};
use crate::table::RouteTable;

pub use acme::{AcmeConfig, AcmeIssuer, AlpnChallenges, ACME_TLS_ALPN, LETS_ENCRYPT_DIRECTORY};
pub use cache::{CertificateCache, MemoryCertificateCache, PgCertificateCache};
pub use issuer::{CertificateIssuer, LocalCaIssuer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateSource {
    Static,
    Stored,
    Automated,
}

/// PEM certificate material for one domain
#[derive(Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub domain: String,
    pub chain_pem: String,
    pub key_pem: String,
    pub source: CertificateSource,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Certificate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("domain", &self.domain)
            .field("source", &self.source)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A certificate ready to serve: parsed key plus the server config using it
pub struct ResolvedCertificate {
    pub domain: String,
    pub source: CertificateSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub key: Arc<CertifiedKey>,
    server_config: Arc<ServerConfig>,
}

impl ResolvedCertificate {
    fn from_pem(
        domain: &str,
        chain_pem: &str,
        key_pem: &str,
        source: CertificateSource,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Arc<Self>, CertError> {
        let key = switchyard_common::certified_key_from_pem(chain_pem, key_pem)?;
        let server_config = server_config_for(key.clone(), b"http/1.1")?;
        Ok(Arc::new(Self {
            domain: domain.to_string(),
            source,
            expires_at,
            key,
            server_config,
        }))
    }

    fn from_certificate(cert: &Certificate) -> Result<Arc<Self>, CertError> {
        Self::from_pem(
            &cert.domain,
            &cert.chain_pem,
            &cert.key_pem,
            cert.source,
            cert.expires_at,
        )
    }

    /// Server config presenting this certificate, advertising HTTP/1.1 only
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl std::fmt::Debug for ResolvedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCertificate")
            .field("domain", &self.domain)
            .field("source", &self.source)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Hands rustls the one key already chosen for this connection
#[derive(Debug)]
struct ChosenCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for ChosenCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn server_config_for(key: Arc<CertifiedKey>, alpn: &[u8]) -> Result<Arc<ServerConfig>, CertError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::Invalid(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ChosenCertificate(key)));
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(Arc::new(config))
}

/// Automated issuance settings
pub struct AutomationConfig {
    pub issuer: Arc<dyn CertificateIssuer>,
    pub cache: Arc<dyn CertificateCache>,
    /// Only issue for names some HTTP route serves
    pub require_route: bool,
    /// Bound on one cache lookup + issuance attempt
    pub timeout: Duration,
}

type PendingIssue = Shared<BoxFuture<'static, Result<Arc<ResolvedCertificate>, CertError>>>;

struct Automation {
    issuer: Arc<dyn CertificateIssuer>,
    cache: Arc<dyn CertificateCache>,
    require_route: bool,
    timeout: Duration,
    resolved: DashMap<String, Arc<ResolvedCertificate>>,
    inflight: Mutex<HashMap<String, PendingIssue>>,
}

impl Automation {
    async fn obtain(self: &Arc<Self>, domain: &str) -> Result<Arc<ResolvedCertificate>, CertError> {
        if let Some(cert) = self.resolved.get(domain) {
            if !cert.is_expired(Utc::now()) {
                return Ok(cert.clone());
            }
        }

        let pending = {
            let mut inflight = self.inflight.lock();
            match inflight.get(domain) {
                Some(pending) => pending.clone(),
                None => {
                    let task = tokio::spawn(self.clone().load_or_issue(domain.to_string()));
                    let failed_domain = domain.to_string();
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(CertError::IssuanceFailed {
                                domain: failed_domain,
                                reason: e.to_string(),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(domain.to_string(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Runs detached from any one handshake so a dropped client does not
    /// abandon an issuance others are waiting on
    async fn load_or_issue(self: Arc<Self>, domain: String) -> Result<Arc<ResolvedCertificate>, CertError> {
        let result = match tokio::time::timeout(self.timeout, self.fetch(&domain)).await {
            Ok(result) => result,
            Err(_) => Err(CertError::IssuanceFailed {
                domain: domain.clone(),
                reason: "timed out".into(),
            }),
        };
        match &result {
            Ok(cert) => {
                self.resolved.insert(domain.clone(), cert.clone());
            }
            Err(e) => tracing::warn!(domain = %domain, "Automated certificate failed: {}", e),
        }
        self.inflight.lock().remove(&domain);
        result
    }

    async fn fetch(&self, domain: &str) -> Result<Arc<ResolvedCertificate>, CertError> {
        let now = Utc::now();
        match self.cache.get(domain).await {
            Ok(Some(cert)) if !cert.is_expired(now) => {
                tracing::debug!(domain = %domain, "Certificate found in shared cache");
                return ResolvedCertificate::from_certificate(&cert);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(domain = %domain, "Certificate cache lookup failed: {}", e),
        }

        tracing::info!(domain = %domain, "Issuing certificate");
        let cert = self.issuer.issue(domain).await?;
        let resolved = ResolvedCertificate::from_certificate(&cert)?;
        if let Err(e) = self.cache.put(&cert).await {
            tracing::warn!(domain = %domain, "Failed to persist issued certificate: {}", e);
        }
        Ok(resolved)
    }
}

/// Per-connection certificate selection
pub struct CertificateManager {
    static_cert: Option<Arc<ResolvedCertificate>>,
    /// Parsed route certificates by route id, valid for one `updated_at`
    route_certs: DashMap<String, (DateTime<Utc>, Arc<ResolvedCertificate>)>,
    automation: Option<Arc<Automation>>,
    challenges: Option<Arc<AlpnChallenges>>,
}

impl CertificateManager {
    pub fn new() -> Self {
        Self {
            static_cert: None,
            route_certs: DashMap::new(),
            automation: None,
            challenges: None,
        }
    }

    /// Load the process-wide fallback keypair
    pub fn with_static(mut self, chain_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        self.static_cert = Some(ResolvedCertificate::from_pem(
            "*",
            chain_pem,
            key_pem,
            CertificateSource::Static,
            None,
        )?);
        Ok(self)
    }

    pub fn with_automation(mut self, config: AutomationConfig) -> Self {
        self.automation = Some(Arc::new(Automation {
            issuer: config.issuer,
            cache: config.cache,
            require_route: config.require_route,
            timeout: config.timeout,
            resolved: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
        }));
        self
    }

    /// Answer TLS-ALPN-01 validation handshakes from `challenges`
    pub fn with_alpn_challenges(mut self, challenges: Arc<AlpnChallenges>) -> Self {
        self.challenges = Some(challenges);
        self
    }

    /// Validation config for a handshake offering `acme-tls/1`, if an order
    /// for that name is pending
    pub fn alpn_challenge(&self, server_name: Option<&str>) -> Option<Arc<ServerConfig>> {
        let domain = server_name.and_then(normalize_domain)?;
        self.challenges.as_ref()?.server_config(&domain)
    }

    pub fn has_static(&self) -> bool {
        self.static_cert.is_some()
    }

    /// Certificate for a TLS server name, `None` when the client sent no SNI.
    ///
    /// Fails with `NoCertificate` when nothing applies; this only ever fails
    /// the one handshake.
    pub async fn certificate_for(
        &self,
        server_name: Option<&str>,
        routes: &RouteTable,
    ) -> Result<Arc<ResolvedCertificate>, CertError> {
        let domain = server_name.and_then(normalize_domain);

        if let Some(domain) = &domain {
            let candidates = [routes.lookup_exact(domain), routes.lookup_wildcard(domain)];
            for route in candidates.into_iter().flatten() {
                if let Some(cert) = self.route_certificate(route) {
                    return Ok(cert);
                }
            }
        }

        if let Some(cert) = &self.static_cert {
            return Ok(cert.clone());
        }

        match (&self.automation, domain) {
            (Some(automation), Some(domain)) => {
                if automation.require_route && routes.lookup(&domain).is_none() {
                    return Err(CertError::NoCertificate(domain));
                }
                automation.obtain(&domain).await
            }
            (_, domain) => Err(CertError::NoCertificate(
                domain.unwrap_or_else(|| "<no server name>".into()),
            )),
        }
    }

    /// Parsed certificate of a route, if it has a usable one
    fn route_certificate(&self, route: &Route) -> Option<Arc<ResolvedCertificate>> {
        let http = route.as_http()?;
        let material = http.certificate.as_ref()?;
        if material.is_expired(Utc::now()) {
            tracing::debug!(route_id = %route.id, "Route certificate expired, skipping");
            return None;
        }

        if let Some(entry) = self.route_certs.get(&route.id) {
            if entry.0 == route.updated_at {
                return Some(entry.1.clone());
            }
        }

        match ResolvedCertificate::from_pem(
            &http.domain,
            &material.chain_pem,
            &material.key_pem,
            CertificateSource::Stored,
            material.expires_at,
        ) {
            Ok(cert) => {
                self.route_certs
                    .insert(route.id.clone(), (route.updated_at, cert.clone()));
                Some(cert)
            }
            Err(e) => {
                tracing::warn!(route_id = %route.id, "Unusable route certificate: {}", e);
                None
            }
        }
    }

    /// Drop parsed certificates of routes no longer in the table
    pub fn retain_routes(&self, routes: &RouteTable) {
        self.route_certs.retain(|id, _| routes.get(id).is_some());
    }
}

impl Default for CertificateManager {
    fn default() -> Self {
        Self::new()
    }
}
