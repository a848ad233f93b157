//! End-to-end test utilities for the Switchyard router
//!
//! Runs complete routers on loopback against mock backends, with certificates
//! generated at runtime and a route store whose watch side can be faulted.

pub mod certificates;
pub mod flaky_store;
pub mod harness;
pub mod mock_service;
pub mod mock_tcp_service;

pub use certificates::{Leaf, TestCa};
pub use flaky_store::FlakyRouteStore;
pub use harness::{
    eventually, http_client, https_client, init_test, tls_handshake, TestRouter,
    TestRouterOptions,
};
pub use mock_service::{dead_addr, MockHttpService};
pub use mock_tcp_service::{MockTcpService, TcpServiceMode};
