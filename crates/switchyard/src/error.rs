//! Error taxonomy
//!
//! Store mutation errors surface synchronously to the caller of the mutation.
//! Proxy and certificate errors are local to a single connection and never
//! take a listener down.

use thiserror::Error;

/// Errors from the route store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("route already exists: {0}")]
    DuplicateId(String),

    #[error("route not found: {0}")]
    NotFound(String),

    #[error("port {0} is already claimed by another route")]
    PortConflict(u16),

    #[error("domain {0} is already claimed by another route")]
    DomainConflict(String),

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("route store unavailable: {0}")]
    Unavailable(String),

    #[error("route watch interrupted: {0}")]
    Watch(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from listener route operations and lifecycle
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no free port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("port {0} is already taken")]
    PortConflict(u16),

    #[error("port {port} is outside the range {start}-{end}")]
    PortOutOfRange { port: u16, start: u16, end: u16 },

    #[error("{actual} route given to the {expected} listener")]
    WrongKind {
        expected: crate::route::RouteKind,
        actual: crate::route::RouteKind,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener already started")]
    AlreadyStarted,

    #[error("initial route sync failed: {0}")]
    Sync(String),

    /// The store accepted the change but this listener's table did not catch up
    #[error("route {route_id} committed at revision {revision} but not yet visible locally")]
    NotVisible { route_id: String, revision: u64 },
}

/// Per-request / per-connection routing failures
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error("no backend available for service {0}")]
    BackendUnavailable(String),

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream timed out")]
    Timeout,
}

/// Certificate resolution failures.
///
/// `Clone` so a single issuance result can be handed to every waiting handshake.
#[derive(Debug, Clone, Error)]
pub enum CertError {
    #[error("no certificate available for {0}")]
    NoCertificate(String),

    #[error("certificate issuance failed for {domain}: {reason}")]
    IssuanceFailed { domain: String, reason: String },

    #[error("certificate cache error: {0}")]
    Cache(String),

    #[error("invalid certificate material: {0}")]
    Invalid(String),
}

impl From<switchyard_common::TlsError> for CertError {
    fn from(e: switchyard_common::TlsError) -> Self {
        CertError::Invalid(e.to_string())
    }
}

/// Errors from the discovery collaborator
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("discovery returned status {0}")]
    Status(u16),

    #[error("discovery timed out")]
    Timeout,

    #[error("invalid discovery URL {0}")]
    InvalidUrl(String),
}
