//! ACME (RFC 8555) issuance with TLS-ALPN-01 validation.
//!
//! The authority connects back to the HTTPS listener with ALPN `acme-tls/1`;
//! the listener answers from [`AlpnChallenges`] while an order is pending.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{server_config_for, Certificate, CertificateIssuer, CertificateSource};
use crate::error::CertError;

/// ALPN protocol id of TLS-ALPN-01 validation connections
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

const JOSE_CONTENT_TYPE: &str = "application/jose+json";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// Validation certificates for in-progress TLS-ALPN-01 challenges, by domain
#[derive(Default)]
pub struct AlpnChallenges {
    configs: DashMap<String, Arc<ServerConfig>>,
}

impl AlpnChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the validation certificate for `domain`.
    ///
    /// `key_authorization` is `token.thumbprint`; the certificate carries its
    /// SHA-256 in the acmeIdentifier extension.
    pub fn insert(&self, domain: &str, key_authorization: &str) -> Result<(), CertError> {
        let digest = ring::digest::digest(&ring::digest::SHA256, key_authorization.as_bytes());
        let key = challenge_certificate(domain, digest.as_ref())?;
        let config = server_config_for(key, ACME_TLS_ALPN)?;
        self.configs.insert(domain.to_string(), config);
        Ok(())
    }

    pub fn remove(&self, domain: &str) {
        self.configs.remove(domain);
    }

    /// Server config answering a validation handshake for `domain`
    pub fn server_config(&self, domain: &str) -> Option<Arc<ServerConfig>> {
        self.configs.get(domain).map(|config| config.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

fn challenge_certificate(domain: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, CertError> {
    let invalid = |e: rcgen::Error| CertError::Invalid(format!("ALPN challenge for {}: {}", domain, e));
    let key = KeyPair::generate().map_err(invalid)?;
    let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(invalid)?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, domain);
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(digest)];
    let cert = params.self_signed(&key).map_err(invalid)?;
    Ok(switchyard_common::certified_key_from_pem(
        &cert.pem(),
        &key.serialize_pem(),
    )?)
}

/// ACME issuer settings
#[derive(Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    /// `mailto:` contacts registered with the account
    pub contact: Vec<String>,
    /// PKCS#8 PEM of the P-256 account key; a fresh one is generated when absent
    pub account_key_pem: Option<String>,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl AcmeConfig {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact: Vec::new(),
            account_key_pem: None,
            poll_interval: Duration::from_secs(2),
            poll_attempts: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Deserialize)]
struct Order {
    status: Status,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Authorization {
    status: Status,
    identifier: Identifier,
    #[serde(default)]
    challenges: Vec<Challenge>,
}

#[derive(Debug, Deserialize)]
struct Identifier {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    detail: String,
}

struct Session {
    directory: Directory,
    account_url: String,
    nonce: Option<String>,
}

struct AcmeResponse {
    location: Option<String>,
    body: bytes::Bytes,
}

/// Obtains certificates from an ACME authority
pub struct AcmeIssuer {
    client: reqwest::Client,
    config: AcmeConfig,
    key: EcdsaKeyPair,
    rng: SystemRandom,
    challenges: Arc<AlpnChallenges>,
    /// Directory and account, set up on first use; also serializes orders
    session: Mutex<Option<Session>>,
}

impl AcmeIssuer {
    pub fn new(config: AcmeConfig, challenges: Arc<AlpnChallenges>) -> Result<Self, CertError> {
        let rng = SystemRandom::new();
        let pkcs8 = match &config.account_key_pem {
            Some(pem) => KeyPair::from_pem(pem)
                .map_err(|e| CertError::Invalid(format!("ACME account key: {}", e)))?
                .serialize_der(),
            None => {
                tracing::warn!("ACME: no account key configured, registering an ephemeral account");
                EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|_| CertError::Invalid("ACME account key generation failed".into()))?
                    .as_ref()
                    .to_vec()
            }
        };
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
            .map_err(|e| CertError::Invalid(format!("ACME account key must be P-256: {}", e)))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("switchyard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CertError::Invalid(format!("ACME client: {}", e)))?;

        Ok(Self {
            client,
            config,
            key,
            rng,
            challenges,
            session: Mutex::new(None),
        })
    }

    fn jwk(&self) -> Value {
        // Uncompressed point: 0x04 || x || y
        let point = self.key.public_key().as_ref();
        json!({
            "crv": "P-256",
            "kty": "EC",
            "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
        })
    }

    /// RFC 7638 thumbprint of the account key
    fn thumbprint(&self) -> String {
        let point = self.key.public_key().as_ref();
        let canonical = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(&point[1..33]),
            URL_SAFE_NO_PAD.encode(&point[33..65]),
        );
        URL_SAFE_NO_PAD.encode(ring::digest::digest(&ring::digest::SHA256, canonical.as_bytes()))
    }

    fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.thumbprint())
    }

    fn sign(&self, url: &str, nonce: &str, kid: Option<&str>, payload: Option<&Value>) -> Result<Value, String> {
        let mut protected = json!({ "alg": "ES256", "nonce": nonce, "url": url });
        match kid {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = self.jwk(),
        }
        let protected = URL_SAFE_NO_PAD.encode(protected.to_string());
        // POST-as-GET carries an empty payload
        let payload = payload
            .map(|p| URL_SAFE_NO_PAD.encode(p.to_string()))
            .unwrap_or_default();
        let signature = self
            .key
            .sign(&self.rng, format!("{}.{}", protected, payload).as_bytes())
            .map_err(|_| "signing failed".to_string())?;
        Ok(json!({
            "protected": protected,
            "payload": payload,
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
        }))
    }

    async fn fresh_nonce(&self, directory: &Directory) -> Result<String, String> {
        let response = self
            .client
            .head(&directory.new_nonce)
            .send()
            .await
            .map_err(|e| format!("nonce request: {}", e))?;
        replay_nonce(&response).ok_or_else(|| "authority returned no nonce".to_string())
    }

    /// Signed POST, retried once when the authority rejects the nonce
    async fn post(
        &self,
        session: &mut Session,
        url: &str,
        payload: Option<&Value>,
        as_account: bool,
    ) -> Result<AcmeResponse, String> {
        let mut retried = false;
        loop {
            let nonce = match session.nonce.take() {
                Some(nonce) => nonce,
                None => self.fresh_nonce(&session.directory).await?,
            };
            let kid = as_account.then_some(session.account_url.as_str());
            let body = self.sign(url, &nonce, kid, payload)?;

            let response = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, JOSE_CONTENT_TYPE)
                .body(body.to_string())
                .send()
                .await
                .map_err(|e| format!("POST {}: {}", url, e))?;
            session.nonce = replay_nonce(&response);
            let status = response.status();
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .bytes()
                .await
                .map_err(|e| format!("POST {}: {}", url, e))?;

            if status.is_success() {
                return Ok(AcmeResponse { location, body });
            }
            let problem: Problem = serde_json::from_slice(&body).unwrap_or(Problem {
                kind: String::new(),
                detail: String::from_utf8_lossy(&body).into_owned(),
            });
            if problem.kind == BAD_NONCE && !retried {
                retried = true;
                continue;
            }
            return Err(format!("{} from {}: {} {}", status, url, problem.kind, problem.detail));
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        url: &str,
        payload: Option<&Value>,
    ) -> Result<(T, Option<String>), String> {
        let response = self.post(session, url, payload, true).await?;
        let parsed = serde_json::from_slice(&response.body)
            .map_err(|e| format!("decoding response from {}: {}", url, e))?;
        Ok((parsed, response.location))
    }

    async fn open_session(&self) -> Result<Session, String> {
        let directory: Directory = self
            .client
            .get(&self.config.directory_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("directory: {}", e))?
            .json()
            .await
            .map_err(|e| format!("directory: {}", e))?;

        let mut session = Session {
            account_url: String::new(),
            nonce: None,
            directory: directory.clone(),
        };
        // Creating an existing account returns its URL
        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": self.config.contact,
        });
        let response = self
            .post(&mut session, &directory.new_account, Some(&payload), false)
            .await?;
        session.account_url = response
            .location
            .ok_or_else(|| "account response carried no Location".to_string())?;
        tracing::info!(account = %session.account_url, "ACME: account ready");
        Ok(session)
    }

    async fn order(&self, session: &mut Session, domain: &str) -> Result<Certificate, String> {
        let payload = json!({ "identifiers": [{ "type": "dns", "value": domain }] });
        let new_order = session.directory.new_order.clone();
        let (mut order, order_url): (Order, _) =
            self.post_json(session, &new_order, Some(&payload)).await?;
        let order_url = order_url.ok_or_else(|| "order response carried no Location".to_string())?;

        for authz_url in order.authorizations.clone() {
            self.authorize(session, &authz_url).await?;
        }

        let key = KeyPair::generate().map_err(|e| e.to_string())?;
        let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(|e| e.to_string())?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, domain);
        let csr = params.serialize_request(&key).map_err(|e| e.to_string())?;
        let finalize = json!({ "csr": URL_SAFE_NO_PAD.encode(csr.der()) });

        let mut attempts = 0;
        loop {
            match order.status {
                Status::Valid => break,
                Status::Ready => {
                    let url = order.finalize.clone();
                    order = self.post_json(session, &url, Some(&finalize)).await?.0;
                }
                Status::Pending | Status::Processing => {
                    tokio::time::sleep(self.config.poll_interval).await;
                    order = self.post_json(session, &order_url, None).await?.0;
                }
                other => return Err(format!("order became {:?}", other)),
            }
            attempts += 1;
            if attempts > self.config.poll_attempts {
                return Err("order did not complete in time".into());
            }
        }

        let certificate_url = order
            .certificate
            .ok_or_else(|| "valid order carried no certificate URL".to_string())?;
        let chain = self.post(session, &certificate_url, None, true).await?.body;
        let chain_pem = String::from_utf8(chain.to_vec()).map_err(|e| e.to_string())?;
        let expires_at = leaf_expiry(&chain_pem).map_err(|e| e.to_string())?;
        tracing::info!(domain = %domain, "ACME: certificate issued, expires {}", expires_at);

        Ok(Certificate {
            domain: domain.to_string(),
            chain_pem,
            key_pem: key.serialize_pem(),
            source: CertificateSource::Automated,
            expires_at: Some(expires_at),
        })
    }

    async fn authorize(&self, session: &mut Session, authz_url: &str) -> Result<(), String> {
        let (authz, _): (Authorization, _) = self.post_json(session, authz_url, None).await?;
        if authz.status == Status::Valid {
            return Ok(());
        }
        let domain = authz.identifier.value;
        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.kind == "tls-alpn-01")
            .ok_or_else(|| format!("authority offered no tls-alpn-01 challenge for {}", domain))?;
        let token = challenge
            .token
            .as_deref()
            .ok_or_else(|| "challenge carried no token".to_string())?;

        self.challenges
            .insert(&domain, &self.key_authorization(token))
            .map_err(|e| e.to_string())?;
        let result = self.validate(session, &challenge.url, authz_url).await;
        self.challenges.remove(&domain);
        result
    }

    async fn validate(&self, session: &mut Session, challenge_url: &str, authz_url: &str) -> Result<(), String> {
        self.post(session, challenge_url, Some(&json!({})), true).await?;
        for _ in 0..self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval).await;
            let (authz, _): (Authorization, _) = self.post_json(session, authz_url, None).await?;
            match authz.status {
                Status::Valid => return Ok(()),
                Status::Pending => {}
                other => {
                    return Err(format!(
                        "authorization for {} became {:?}",
                        authz.identifier.value, other
                    ))
                }
            }
        }
        Err("authorization did not complete in time".into())
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, domain: &str) -> Result<Certificate, CertError> {
        let failed = |reason: String| CertError::IssuanceFailed {
            domain: domain.to_string(),
            reason,
        };
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_session().await.map_err(failed)?);
        }
        let Some(session) = guard.as_mut() else {
            return Err(failed("no ACME session".into()));
        };
        self.order(session, domain).await.map_err(failed)
    }
}

fn replay_nonce(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("replay-nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `notAfter` of the first certificate in a PEM chain
fn leaf_expiry(chain_pem: &str) -> Result<chrono::DateTime<Utc>, CertError> {
    let certs = switchyard_common::load_certs_from_pem(chain_pem)?;
    let leaf = certs
        .first()
        .ok_or_else(|| CertError::Invalid("empty certificate chain".into()))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| CertError::Invalid(format!("certificate: {}", e)))?;
    Utc.timestamp_opt(parsed.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| CertError::Invalid("certificate expiry out of range".into()))
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};

    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use rcgen::{BasicConstraints, IsCa, Issuer};
    use rustls::pki_types::CertificateSigningRequestDer;
    use tokio::net::TcpListener;

    use super::*;
    use crate::certs::ResolvedCertificate;

    const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";

    #[test]
    fn test_challenge_certificate_carries_key_authorization_digest() {
        let challenges = AlpnChallenges::new();
        challenges.insert("app.example.com", "token.thumb").unwrap();
        let config = challenges.server_config("app.example.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![ACME_TLS_ALPN.to_vec()]);

        let digest = ring::digest::digest(&ring::digest::SHA256, b"token.thumb");
        let key = challenge_certificate("app.example.com", digest.as_ref()).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(key.cert[0].as_ref()).unwrap();
        let extension = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == ACME_IDENTIFIER_OID)
            .expect("acmeIdentifier extension");
        assert!(extension.critical);
        // DER OCTET STRING wrapping the 32-byte digest
        assert_eq!(&extension.value[2..], digest.as_ref());

        challenges.remove("app.example.com");
        assert!(challenges.server_config("app.example.com").is_none());
        assert!(challenges.is_empty());
    }

    #[test]
    fn test_thumbprint_is_stable_for_account_key() {
        let key = KeyPair::generate().unwrap().serialize_pem();
        let mut config = AcmeConfig::new("http://127.0.0.1:1/directory");
        config.account_key_pem = Some(key);
        let a = AcmeIssuer::new(config.clone(), Arc::new(AlpnChallenges::new())).unwrap();
        let b = AcmeIssuer::new(config, Arc::new(AlpnChallenges::new())).unwrap();
        assert_eq!(a.thumbprint(), b.thumbprint());
        assert_eq!(a.key_authorization("tok"), format!("tok.{}", b.thumbprint()));
        // SHA-256, unpadded base64url
        assert_eq!(a.thumbprint().len(), 43);
    }

    #[test]
    fn test_rejects_non_ecdsa_account_key() {
        let mut config = AcmeConfig::new("http://127.0.0.1:1/directory");
        config.account_key_pem = Some("not a key".into());
        assert!(matches!(
            AcmeIssuer::new(config, Arc::new(AlpnChallenges::new())),
            Err(CertError::Invalid(_))
        ));
    }

    /// In-process authority: one account, orders validated on challenge POST
    struct Authority {
        base: String,
        ca: Issuer<'static, KeyPair>,
        ca_pem: String,
        nonces: AtomicU32,
        bad_nonce_once: AtomicU32,
        challenges: Arc<AlpnChallenges>,
        challenge_seen: AtomicU32,
        finalized: AtomicU32,
        protected: parking_lot::Mutex<Vec<Value>>,
        certificate: parking_lot::Mutex<Option<String>>,
    }

    fn decode_jws(body: &[u8]) -> (Value, Option<Value>) {
        let jws: Value = serde_json::from_slice(body).unwrap();
        let protected = URL_SAFE_NO_PAD
            .decode(jws["protected"].as_str().unwrap())
            .unwrap();
        let payload = jws["payload"].as_str().unwrap();
        let payload = (!payload.is_empty())
            .then(|| serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap());
        (serde_json::from_slice(&protected).unwrap(), payload)
    }

    impl Authority {
        fn reply(&self, status: StatusCode, body: Value, location: Option<String>) -> Response<Full<Bytes>> {
            let nonce = self.nonces.fetch_add(1, Ordering::SeqCst);
            let mut builder = Response::builder()
                .status(status)
                .header("replay-nonce", format!("nonce-{}", nonce));
            if let Some(location) = location {
                builder = builder.header("location", location);
            }
            builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
        }

        fn order_body(&self) -> Value {
            let certificate = self.certificate.lock().clone();
            json!({
                "status": if certificate.is_some() { "valid" } else if self.challenge_seen.load(Ordering::SeqCst) > 0 { "ready" } else { "pending" },
                "authorizations": [format!("{}/authz/1", self.base)],
                "finalize": format!("{}/finalize/1", self.base),
                "certificate": certificate.map(|_| format!("{}/cert/1", self.base)),
            })
        }

        async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
            let path = req.uri().path().to_string();
            let method = req.method().clone();
            if method == Method::GET && path == "/directory" {
                return Ok(self.reply(
                    StatusCode::OK,
                    json!({
                        "newNonce": format!("{}/nonce", self.base),
                        "newAccount": format!("{}/account", self.base),
                        "newOrder": format!("{}/order", self.base),
                    }),
                    None,
                ));
            }
            if method == Method::HEAD {
                return Ok(self.reply(StatusCode::OK, json!({}), None));
            }

            let body = req.into_body().collect().await.unwrap().to_bytes();
            let (protected, payload) = decode_jws(&body);
            self.protected.lock().push(protected.clone());
            assert_eq!(protected["alg"], "ES256");
            assert_eq!(protected["url"], format!("{}{}", self.base, path));

            if self.bad_nonce_once.swap(0, Ordering::SeqCst) == 1 {
                return Ok(self.reply(
                    StatusCode::BAD_REQUEST,
                    json!({ "type": BAD_NONCE, "detail": "stale" }),
                    None,
                ));
            }

            let reply = match path.as_str() {
                "/account" => {
                    assert!(protected.get("jwk").is_some());
                    assert_eq!(payload.unwrap()["termsOfServiceAgreed"], true);
                    self.reply(StatusCode::CREATED, json!({ "status": "valid" }), Some(format!("{}/acct/1", self.base)))
                }
                "/order" => {
                    assert_eq!(protected["kid"], format!("{}/acct/1", self.base));
                    assert_eq!(payload.unwrap()["identifiers"][0]["value"], "app.example.com");
                    self.reply(StatusCode::CREATED, self.order_body(), Some(format!("{}/order/1", self.base)))
                }
                "/order/1" => self.reply(StatusCode::OK, self.order_body(), None),
                "/authz/1" => {
                    let status = if self.challenge_seen.load(Ordering::SeqCst) > 0 { "valid" } else { "pending" };
                    self.reply(
                        StatusCode::OK,
                        json!({
                            "status": status,
                            "identifier": { "type": "dns", "value": "app.example.com" },
                            "challenges": [
                                { "type": "http-01", "url": format!("{}/chall/http", self.base), "token": "h" },
                                { "type": "tls-alpn-01", "url": format!("{}/chall/1", self.base), "token": "tok-1" },
                            ],
                        }),
                        None,
                    )
                }
                "/chall/1" => {
                    // The listener must be able to answer while validation runs
                    assert!(self.challenges.server_config("app.example.com").is_some());
                    self.challenge_seen.fetch_add(1, Ordering::SeqCst);
                    self.reply(StatusCode::OK, json!({ "status": "processing" }), None)
                }
                "/finalize/1" => {
                    self.finalized.fetch_add(1, Ordering::SeqCst);
                    let csr = URL_SAFE_NO_PAD
                        .decode(payload.unwrap()["csr"].as_str().unwrap())
                        .unwrap();
                    let csr = rcgen::CertificateSigningRequestParams::from_der(
                        &CertificateSigningRequestDer::from(csr),
                    )
                    .unwrap();
                    let leaf = csr.signed_by(&self.ca).unwrap();
                    *self.certificate.lock() = Some(format!("{}{}", leaf.pem(), self.ca_pem));
                    self.reply(StatusCode::OK, self.order_body(), None)
                }
                "/cert/1" => {
                    let chain = self.certificate.lock().clone().unwrap();
                    let nonce = self.nonces.fetch_add(1, Ordering::SeqCst);
                    return Ok(Response::builder()
                        .header("replay-nonce", format!("nonce-{}", nonce))
                        .header("content-type", "application/pem-certificate-chain")
                        .body(Full::new(Bytes::from(chain)))
                        .unwrap());
                }
                other => panic!("unexpected ACME request {}", other),
            };
            Ok(reply)
        }
    }

    async fn authority(challenges: Arc<AlpnChallenges>) -> Arc<Authority> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "Test ACME CA");
        let ca_pem = params.self_signed(&ca_key).unwrap().pem();

        let authority = Arc::new(Authority {
            base,
            ca: Issuer::new(params, ca_key),
            ca_pem,
            nonces: AtomicU32::new(0),
            bad_nonce_once: AtomicU32::new(0),
            challenges,
            challenge_seen: AtomicU32::new(0),
            finalized: AtomicU32::new(0),
            protected: parking_lot::Mutex::new(Vec::new()),
            certificate: parking_lot::Mutex::new(None),
        });

        let server = authority.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let server = server.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| server.clone().handle(req));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        authority
    }

    fn issuer_for(authority: &Authority, challenges: Arc<AlpnChallenges>) -> AcmeIssuer {
        let mut config = AcmeConfig::new(format!("{}/directory", authority.base));
        config.contact = vec!["mailto:ops@example.com".into()];
        config.poll_interval = Duration::from_millis(10);
        config.poll_attempts = 20;
        AcmeIssuer::new(config, challenges).unwrap()
    }

    #[tokio::test]
    async fn test_order_flow_with_tls_alpn_challenge() {
        let challenges = Arc::new(AlpnChallenges::new());
        let authority = authority(challenges.clone()).await;
        let issuer = issuer_for(&authority, challenges.clone());

        let cert = issuer.issue("app.example.com").await.unwrap();
        assert_eq!(cert.domain, "app.example.com");
        assert_eq!(cert.source, CertificateSource::Automated);
        assert!(cert.expires_at.unwrap() > Utc::now());
        assert!(cert.chain_pem.ends_with(&authority.ca_pem));
        // Issued key and leaf belong together
        ResolvedCertificate::from_certificate(&cert).unwrap();

        assert_eq!(authority.challenge_seen.load(Ordering::SeqCst), 1);
        assert_eq!(authority.finalized.load(Ordering::SeqCst), 1);
        assert!(challenges.is_empty());

        // Every request after registration is signed with the account URL
        let protected = authority.protected.lock().clone();
        assert!(protected[0].get("jwk").is_some());
        assert!(protected[1..].iter().all(|p| p.get("kid").is_some()));
    }

    #[tokio::test]
    async fn test_account_reused_and_bad_nonce_retried() {
        let challenges = Arc::new(AlpnChallenges::new());
        let authority = authority(challenges.clone()).await;
        let issuer = issuer_for(&authority, challenges.clone());

        issuer.issue("app.example.com").await.unwrap();
        let accounts = |a: &Authority| {
            a.protected
                .lock()
                .iter()
                .filter(|p| p["url"].as_str().unwrap().ends_with("/account"))
                .count()
        };
        assert_eq!(accounts(authority.as_ref()), 1);

        authority.challenge_seen.store(0, Ordering::SeqCst);
        *authority.certificate.lock() = None;
        authority.bad_nonce_once.store(1, Ordering::SeqCst);
        issuer.issue("app.example.com").await.unwrap();
        assert_eq!(accounts(authority.as_ref()), 1);
        assert_eq!(authority.finalized.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_authority_fails_issuance() {
        let mut config = AcmeConfig::new("http://127.0.0.1:1/directory");
        config.poll_attempts = 1;
        let issuer = AcmeIssuer::new(config, Arc::new(AlpnChallenges::new())).unwrap();
        match issuer.issue("app.example.com").await {
            Err(CertError::IssuanceFailed { domain, .. }) => assert_eq!(domain, "app.example.com"),
            other => panic!("unexpected {:?}", other.map(|c| c.domain)),
        }
    }

    #[test]
    fn test_leaf_expiry_reads_not_after() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["app.example.com".into()]).unwrap();
        params.not_after = rcgen::date_time_ymd(2031, 5, 17);
        let pem = params.self_signed(&key).unwrap().pem();
        let expiry = leaf_expiry(&pem).unwrap();
        assert_eq!(expiry, Utc.with_ymd_and_hms(2031, 5, 17, 0, 0, 0).unwrap());
        assert!(leaf_expiry("").is_err());
    }
}
