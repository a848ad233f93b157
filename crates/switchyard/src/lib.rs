//! Switchyard data-plane router library
//!
//! Proxies HTTP(S) by host and TCP by port to services resolved through
//! discovery, with routes kept in a shared store and mirrored into every
//! listener by a watch-driven sync. It can be embedded in other applications
//! or driven directly by tests.

pub mod affinity;
pub mod balancer;
pub mod certs;
pub mod config;
pub mod discovery;
pub mod error;
mod http_plane;
mod listener;
pub mod proxy_protocol;
pub mod route;
mod router;
mod state;
pub mod store;
mod sync;
mod table;
mod tcp_plane;

// Re-export public types
pub use error::{CertError, DiscoveryError, ListenerError, ProxyError, StoreError};
pub use http_plane::{HttpPlane, HttpPlaneConfig};
pub use listener::Listener;
pub use route::{HttpRoute, Route, RouteCertificate, RouteConfig, RouteKind, TcpRoute};
pub use router::Router;
pub use state::PortAllocator;
pub use store::{RouteEvent, RouteStore, RouteWatch};
pub use sync::SyncConfig;
pub use table::RouteTable;
pub use tcp_plane::{TcpPlane, TcpPlaneConfig};
