//! Route data model
//!
//! A route maps an externally reachable address (an HTTP domain or a TCP port)
//! to a logical backend service name that is resolved through discovery at
//! connection time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Which listener a route belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Http,
    Tcp,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Http => "http",
            RouteKind::Tcp => "tcp",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "http" => Some(RouteKind::Http),
            "tcp" => Some(RouteKind::Tcp),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted routing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Globally unique, immutable once created
    pub id: String,
    /// Logical backend service name, resolved through discovery
    pub service: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Store revision of the last mutation that touched this route
    #[serde(default)]
    pub revision: u64,
    #[serde(flatten)]
    pub config: RouteConfig,
}

/// Protocol specific part of a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RouteConfig {
    Http(HttpRoute),
    Tcp(TcpRoute),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRoute {
    /// Exact (`app.example.com`) or leading wildcard (`*.example.com`)
    pub domain: String,
    #[serde(default)]
    pub certificate: Option<RouteCertificate>,
    /// Pin clients to one backend with a signed cookie
    #[serde(default)]
    pub sticky: bool,
    /// Only send traffic to the instance discovery marks as leader
    #[serde(default)]
    pub leader_only: bool,
    #[serde(default)]
    pub disable_keep_alives: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpRoute {
    /// Unset on creation means "allocate one from the configured range"
    #[serde(default)]
    pub port: Option<u16>,
    /// Prepend a PROXY protocol v2 header to the backend stream
    #[serde(default)]
    pub proxy_protocol: bool,
}

/// TLS material attached to an HTTP route
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCertificate {
    pub chain_pem: String,
    pub key_pem: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RouteCertificate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl std::fmt::Debug for RouteCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteCertificate")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Route {
    /// New HTTP route with a fresh id
    pub fn http(service: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::new(
            service,
            RouteConfig::Http(HttpRoute {
                domain: domain.into(),
                ..Default::default()
            }),
        )
    }

    /// New TCP route with a fresh id; `port = None` asks the listener to allocate
    pub fn tcp(service: impl Into<String>, port: Option<u16>) -> Self {
        Self::new(
            service,
            RouteConfig::Tcp(TcpRoute {
                port,
                proxy_protocol: false,
            }),
        )
    }

    pub fn new(service: impl Into<String>, config: RouteConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            created_at: now,
            updated_at: now,
            revision: 0,
            config,
        }
    }

    pub fn kind(&self) -> RouteKind {
        match self.config {
            RouteConfig::Http(_) => RouteKind::Http,
            RouteConfig::Tcp(_) => RouteKind::Tcp,
        }
    }

    pub fn as_http(&self) -> Option<&HttpRoute> {
        match &self.config {
            RouteConfig::Http(http) => Some(http),
            RouteConfig::Tcp(_) => None,
        }
    }

    pub fn as_http_mut(&mut self) -> Option<&mut HttpRoute> {
        match &mut self.config {
            RouteConfig::Http(http) => Some(http),
            RouteConfig::Tcp(_) => None,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpRoute> {
        match &self.config {
            RouteConfig::Tcp(tcp) => Some(tcp),
            RouteConfig::Http(_) => None,
        }
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpRoute> {
        match &mut self.config {
            RouteConfig::Tcp(tcp) => Some(tcp),
            RouteConfig::Http(_) => None,
        }
    }

    /// Normalised domain of an HTTP route
    pub fn domain(&self) -> Option<&str> {
        self.as_http().map(|h| h.domain.as_str())
    }

    /// Port of a TCP route, once assigned
    pub fn port(&self) -> Option<u16> {
        self.as_tcp().and_then(|t| t.port)
    }

    /// Check the route is well formed and normalise its domain.
    ///
    /// Stored TCP routes must carry a concrete port.
    pub fn validate(&mut self) -> Result<(), StoreError> {
        if self.id.trim().is_empty() {
            return Err(StoreError::InvalidRoute("route id is empty".into()));
        }
        if self.service.trim().is_empty() {
            return Err(StoreError::InvalidRoute("service name is empty".into()));
        }
        match &mut self.config {
            RouteConfig::Http(http) => {
                http.domain = normalize_domain(&http.domain)
                    .ok_or_else(|| StoreError::InvalidRoute(format!("invalid domain {:?}", http.domain)))?;
            }
            RouteConfig::Tcp(tcp) => match tcp.port {
                Some(0) | None => {
                    return Err(StoreError::InvalidRoute("TCP route has no port".into()))
                }
                Some(_) => {}
            },
        }
        Ok(())
    }
}

/// Lowercase a host name, strip any port and trailing dot.
///
/// Returns `None` for names that cannot be routed: empty labels, wildcards
/// anywhere but the leading label, or characters outside the host name set.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let host = strip_port(raw.trim());
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.len() > 253 {
        return None;
    }

    for (i, label) in host.split('.').enumerate() {
        if label.is_empty() {
            return None;
        }
        if label == "*" {
            if i != 0 || !host.contains('.') {
                return None;
            }
            continue;
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return None;
        }
    }
    Some(host)
}

/// Host header value without the port
pub fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literal
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

pub fn is_wildcard(domain: &str) -> bool {
    domain.starts_with("*.")
}

/// Wildcard patterns covering `host`, most specific first.
///
/// `a.b.example.com` yields `*.b.example.com`, `*.example.com`, `*.com`.
pub fn wildcard_candidates(host: &str) -> impl Iterator<Item = String> + '_ {
    host.match_indices('.')
        .map(move |(i, _)| format!("*{}", &host[i..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("App.Example.COM."), Some("app.example.com".into()));
        assert_eq!(normalize_domain("app.example.com:8080"), Some("app.example.com".into()));
        assert_eq!(normalize_domain("*.example.com"), Some("*.example.com".into()));
        assert_eq!(normalize_domain("a.*.example.com"), None);
        assert_eq!(normalize_domain("*"), None);
        assert_eq!(normalize_domain("bad..example.com"), None);
        assert_eq!(normalize_domain(""), None);
        assert_eq!(normalize_domain("spa ce.com"), None);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn test_wildcard_candidates() {
        let found: Vec<_> = wildcard_candidates("a.b.example.com").collect();
        assert_eq!(found, vec!["*.b.example.com", "*.example.com", "*.com"]);
        assert_eq!(wildcard_candidates("localhost").count(), 0);
    }

    #[test]
    fn test_validate_requires_tcp_port() {
        let mut route = Route::tcp("db", None);
        assert!(matches!(route.validate(), Err(StoreError::InvalidRoute(_))));

        let mut route = Route::tcp("db", Some(3001));
        assert!(route.validate().is_ok());
    }

    #[test]
    fn test_validate_normalizes_domain() {
        let mut route = Route::http("web", "WWW.Example.com.");
        route.validate().unwrap();
        assert_eq!(route.domain(), Some("www.example.com"));
    }

    #[test]
    fn test_route_json_shape() {
        let route = Route::http("web", "example.com");
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["type"], "http");
        assert_eq!(json["domain"], "example.com");

        let back: Route = serde_json::from_value(json).unwrap();
        assert_eq!(back, route);
    }

    #[test]
    fn test_certificate_expiry() {
        let now = Utc::now();
        let cert = RouteCertificate {
            chain_pem: String::new(),
            key_pem: String::new(),
            expires_at: Some(now - chrono::Duration::hours(1)),
        };
        assert!(cert.is_expired(now));
        let cert = RouteCertificate {
            expires_at: None,
            ..cert
        };
        assert!(!cert.is_expired(now));
    }
}
