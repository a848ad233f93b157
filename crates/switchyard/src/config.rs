//! Router configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (SWITCHYARD_*)
//! 2. Config file (switchyard.toml)
//! 3. Default values (where applicable)
//!
//! Secret-bearing values accept `file://path`, `env://VAR` or inline content.

use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::Engine;
use serde::Deserialize;

use crate::affinity::KEY_LEN;
use crate::certs::LETS_ENCRYPT_DIRECTORY;
use crate::discovery::Instance;

/// Environment variable prefix
const ENV_PREFIX: &str = "SWITCHYARD";

/// Router configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Plain HTTP listen addresses
    pub http_addrs: Option<Vec<SocketAddr>>,

    /// HTTPS listen addresses
    pub https_addrs: Option<Vec<SocketAddr>>,

    /// Address TCP route ports are bound on
    pub tcp_ip: Option<IpAddr>,

    /// Inclusive port range for TCP routes
    pub tcp_port_range: Option<(u16, u16)>,

    /// Expect PROXY protocol on HTTP listeners and send it on TCP routes
    pub proxy_protocol: Option<bool>,

    /// Sticky session signing key, base64 of 32 bytes (secret)
    pub cookie_key: Option<String>,

    /// Postgres URL; absent means the in-process route store
    pub database_url: Option<String>,

    /// Persistence file for the in-process route store
    pub routes_file: Option<PathBuf>,

    pub drain_timeout_secs: Option<u64>,

    pub tls: Option<TlsSection>,

    pub issuance: Option<IssuanceSection>,

    pub discovery: Option<DiscoverySection>,
}

/// Static fallback keypair
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TlsSection {
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Automated certificate issuance
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct IssuanceSection {
    pub enabled: Option<bool>,
    /// `local` (in-process CA, the default) or `acme`
    pub provider: Option<String>,
    /// ACME directory; Let's Encrypt production when absent
    pub directory_url: Option<String>,
    /// ACME account contacts, e.g. `mailto:ops@example.com`
    pub contact: Vec<String>,
    /// ACME account key, PKCS#8 PEM of a P-256 key (secret)
    pub account_key: Option<String>,
    /// Signing CA certificate for the local provider; generated at startup when absent
    pub ca_cert: Option<String>,
    pub ca_key: Option<String>,
    pub validity_days: Option<u32>,
    /// Only issue for domains with an HTTP route
    pub require_route: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DiscoverySection {
    /// Base URL of an HTTP discovery endpoint
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Static service table, used when no URL is set
    pub services: HashMap<String, Vec<Instance>>,
}

/// Resolved configuration with actual secret values
#[derive(Debug)]
pub struct ResolvedConfig {
    pub http_addrs: Vec<SocketAddr>,
    pub https_addrs: Vec<SocketAddr>,
    pub tcp_ip: IpAddr,
    pub tcp_port_range: (u16, u16),
    pub proxy_protocol: bool,
    pub cookie_key: [u8; KEY_LEN],
    pub database_url: Option<String>,
    pub routes_file: Option<PathBuf>,
    pub drain_timeout: Duration,
    pub static_tls: Option<StaticKeypair>,
    pub issuance: Option<ResolvedIssuance>,
    pub discovery: ResolvedDiscovery,
}

pub struct StaticKeypair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeypair").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ResolvedIssuance {
    pub authority: IssuanceAuthority,
    pub validity_days: u32,
    pub require_route: bool,
}

#[derive(Debug)]
pub enum IssuanceAuthority {
    Local { ca: Option<StaticKeypair> },
    Acme(AcmeSettings),
}

pub struct AcmeSettings {
    pub directory_url: String,
    pub contact: Vec<String>,
    pub account_key_pem: Option<String>,
}

impl std::fmt::Debug for AcmeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeSettings")
            .field("directory_url", &self.directory_url)
            .field("contact", &self.contact)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ResolvedDiscovery {
    Http { url: String, timeout: Duration },
    Static(HashMap<String, Vec<Instance>>),
}

impl ResolvedConfig {
    /// Ports the TCP plane must never hand out
    pub fn reserved_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .http_addrs
            .iter()
            .chain(&self.https_addrs)
            .map(|a| a.port())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_addrs(value: &str) -> anyhow::Result<Vec<SocketAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .with_context(|| format!("Invalid listen address {:?}", s))
        })
        .collect()
}

/// Decode a base64 sticky-cookie key of exactly 32 bytes
pub fn decode_cookie_key(encoded: &str) -> anyhow::Result<[u8; KEY_LEN]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("cookie_key is not valid base64")?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("cookie_key must decode to {} bytes, got {}", KEY_LEN, bytes.len()))
}

impl RouterConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!("No config file at {}, using environment and defaults", path);
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        let config = toml::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve against the process environment
    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        self.resolve_with(|name| env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup
    pub fn resolve_with<F>(self, lookup: F) -> anyhow::Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get_env = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));
        let secret = |source: &str| resolve_secret(source, &lookup);

        let http_addrs = match get_env("HTTP_ADDRS") {
            Some(v) => parse_addrs(&v)?,
            None => self
                .http_addrs
                .unwrap_or_else(|| vec![SocketAddr::from(([0, 0, 0, 0], 8080))]),
        };
        let https_addrs = match get_env("HTTPS_ADDRS") {
            Some(v) => parse_addrs(&v)?,
            None => self
                .https_addrs
                .unwrap_or_else(|| vec![SocketAddr::from(([0, 0, 0, 0], 4433))]),
        };

        let tcp_ip = match get_env("TCP_IP") {
            Some(v) => v.parse().with_context(|| format!("Invalid SWITCHYARD_TCP_IP {:?}", v))?,
            None => self.tcp_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        };

        // TCP port range: ENV > config > default 3000-3500
        let tcp_port_start = get_env("TCP_PORT_START")
            .and_then(|v| v.parse().ok())
            .or(self.tcp_port_range.map(|r| r.0))
            .unwrap_or(3000);
        let tcp_port_end = get_env("TCP_PORT_END")
            .and_then(|v| v.parse().ok())
            .or(self.tcp_port_range.map(|r| r.1))
            .unwrap_or(3500);
        if tcp_port_start > tcp_port_end {
            bail!("Empty TCP port range {}-{}", tcp_port_start, tcp_port_end);
        }

        let proxy_protocol = get_env("PROXY_PROTOCOL")
            .and_then(|v| parse_bool(&v))
            .or(self.proxy_protocol)
            .unwrap_or(false);

        let cookie_key_source = get_env("COOKIE_KEY").or(self.cookie_key).ok_or_else(|| {
            anyhow!("Cookie key required. Set SWITCHYARD_COOKIE_KEY or cookie_key in config")
        })?;
        let cookie_key = decode_cookie_key(
            &secret(&cookie_key_source).context("Failed to resolve cookie key")?,
        )?;

        let database_url = get_env("DATABASE_URL").or(self.database_url);
        let routes_file = get_env("ROUTES_FILE").map(PathBuf::from).or(self.routes_file);

        let drain_timeout = Duration::from_secs(
            get_env("DRAIN_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .or(self.drain_timeout_secs)
                .unwrap_or(10),
        );

        // Static keypair: both halves or neither
        let tls = self.tls.unwrap_or_default();
        let static_tls = match (get_env("TLS_CERT").or(tls.cert), get_env("TLS_KEY").or(tls.key)) {
            (Some(cert), Some(key)) => Some(StaticKeypair {
                cert_pem: secret(&cert).context("Failed to resolve TLS certificate")?,
                key_pem: secret(&key).context("Failed to resolve TLS private key")?,
            }),
            (None, None) => None,
            _ => bail!("TLS cert and key must be configured together"),
        };

        let issuance_section = self.issuance.unwrap_or_default();
        let issuance_enabled = get_env("ISSUANCE_ENABLED")
            .and_then(|v| parse_bool(&v))
            .or(issuance_section.enabled)
            .unwrap_or(false);
        let issuance = if issuance_enabled {
            let provider = get_env("ISSUANCE_PROVIDER")
                .or(issuance_section.provider)
                .unwrap_or_else(|| "local".into());
            let authority = match provider.to_ascii_lowercase().as_str() {
                "local" => {
                    let ca = match (
                        get_env("ISSUANCE_CA_CERT").or(issuance_section.ca_cert),
                        get_env("ISSUANCE_CA_KEY").or(issuance_section.ca_key),
                    ) {
                        (Some(cert), Some(key)) => Some(StaticKeypair {
                            cert_pem: secret(&cert).context("Failed to resolve issuance CA certificate")?,
                            key_pem: secret(&key).context("Failed to resolve issuance CA key")?,
                        }),
                        (None, None) => None,
                        _ => bail!("Issuance CA cert and key must be configured together"),
                    };
                    IssuanceAuthority::Local { ca }
                }
                "acme" => {
                    let account_key_pem = match get_env("ISSUANCE_ACCOUNT_KEY").or(issuance_section.account_key) {
                        Some(key) => Some(secret(&key).context("Failed to resolve ACME account key")?),
                        None => None,
                    };
                    let contact = match get_env("ISSUANCE_CONTACT") {
                        Some(list) => list
                            .split(',')
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .map(str::to_string)
                            .collect(),
                        None => issuance_section.contact,
                    };
                    IssuanceAuthority::Acme(AcmeSettings {
                        directory_url: get_env("ISSUANCE_DIRECTORY_URL")
                            .or(issuance_section.directory_url)
                            .unwrap_or_else(|| LETS_ENCRYPT_DIRECTORY.to_string()),
                        contact,
                        account_key_pem,
                    })
                }
                other => bail!("Unknown issuance provider {:?}, expected local or acme", other),
            };
            Some(ResolvedIssuance {
                authority,
                validity_days: issuance_section.validity_days.unwrap_or(90),
                require_route: issuance_section.require_route.unwrap_or(true),
            })
        } else {
            None
        };

        let discovery_section = self.discovery.unwrap_or_default();
        let discovery = match get_env("DISCOVERY_URL").or(discovery_section.url) {
            Some(url) => ResolvedDiscovery::Http {
                url,
                timeout: Duration::from_secs(discovery_section.timeout_secs.unwrap_or(2)),
            },
            None => ResolvedDiscovery::Static(discovery_section.services),
        };

        Ok(ResolvedConfig {
            http_addrs,
            https_addrs,
            tcp_ip,
            tcp_port_range: (tcp_port_start, tcp_port_end),
            proxy_protocol,
            cookie_key,
            database_url,
            routes_file,
            drain_timeout,
            static_tls,
            issuance,
            discovery,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedConfig> {
        Self::load(path)?.resolve()
    }
}

/// Resolve `file://`, `env://` or inline secret content
fn resolve_secret<F>(source: &str, lookup: &F) -> anyhow::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let value = if let Some(path) = source.strip_prefix("file://") {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?
    } else if let Some(name) = source.strip_prefix("env://") {
        lookup(name).ok_or_else(|| anyhow!("Environment variable {} is not set", name))?
    } else {
        source.to_string()
    };
    Ok(value.trim().to_string())
}
