//! Test router harness for E2E tests
//!
//! Starts a complete router (HTTP, HTTPS and TCP planes) on loopback with
//! ephemeral HTTP ports, a private TCP port range, static discovery and a
//! fault-injecting route store.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use switchyard::certs::{AutomationConfig, CertificateManager, LocalCaIssuer, MemoryCertificateCache};
use switchyard::discovery::{Instance, StaticDiscovery};
use switchyard::{
    HttpPlane, HttpPlaneConfig, Listener, Route, Router, SyncConfig, TcpPlane, TcpPlaneConfig,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::certificates::{Leaf, TestCa};
use crate::flaky_store::FlakyRouteStore;

/// Global counter for allocating unique port ranges to each test router
static PORT_RANGE_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Number of ports per test router
const PORTS_PER_ROUTER: u16 = 10;

/// Base port for TCP plane allocations
const BASE_TCP_PORT: u16 = 52000;

pub const COOKIE_KEY: [u8; 32] = [7; 32];

/// Optional router features for one test
#[derive(Default)]
pub struct TestRouterOptions {
    /// Static fallback keypair
    pub static_cert: Option<Leaf>,
    /// Enable automated issuance signed by this CA
    pub issuing_ca: Option<Arc<TestCa>>,
    pub require_route: bool,
    /// PROXY protocol on inbound HTTP and outbound TCP
    pub proxy_protocol: bool,
    pub response_timeout: Option<Duration>,
}

/// A running test router instance
pub struct TestRouter {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub tcp_range: (u16, u16),
    pub store: Arc<FlakyRouteStore>,
    pub discovery: Arc<StaticDiscovery>,
    pub http: Arc<HttpPlane>,
    pub tcp: Arc<TcpPlane>,
    pub router: Router,
}

/// Fast reconnects so resync tests stay short
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        open_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        apply_timeout: Duration::from_secs(2),
    }
}

impl TestRouter {
    pub async fn start() -> Self {
        Self::start_with(TestRouterOptions::default()).await
    }

    pub async fn start_with(options: TestRouterOptions) -> Self {
        Self::start_on(Arc::new(FlakyRouteStore::new()), options).await
    }

    /// Start a router over an existing store, e.g. to share it between routers
    pub async fn start_on(store: Arc<FlakyRouteStore>, options: TestRouterOptions) -> Self {
        let discovery = Arc::new(StaticDiscovery::new());

        let mut certs = CertificateManager::new();
        if let Some(leaf) = &options.static_cert {
            certs = certs
                .with_static(&leaf.chain_pem, &leaf.key_pem)
                .expect("Failed to load static keypair");
        }
        if let Some(ca) = &options.issuing_ca {
            let issuer = LocalCaIssuer::from_pem(&ca.cert_pem, &ca.key_pem, 30)
                .expect("Failed to load issuing CA");
            certs = certs.with_automation(AutomationConfig {
                issuer: Arc::new(issuer),
                cache: Arc::new(MemoryCertificateCache::new()),
                require_route: options.require_route,
                timeout: Duration::from_secs(10),
            });
        }

        let mut http_config = HttpPlaneConfig::new(COOKIE_KEY);
        http_config.addrs = vec!["127.0.0.1:0".parse().unwrap()];
        http_config.tls_addrs = vec!["127.0.0.1:0".parse().unwrap()];
        http_config.proxy_protocol = options.proxy_protocol;
        http_config.drain_timeout = Duration::from_secs(2);
        http_config.sync = test_sync_config();
        if let Some(timeout) = options.response_timeout {
            http_config.response_timeout = timeout;
        }
        let http = Arc::new(HttpPlane::new(
            http_config,
            store.clone(),
            discovery.clone(),
            Arc::new(certs),
        ));

        // Allocate a unique port range for this test router
        let range_index = PORT_RANGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let start_port = BASE_TCP_PORT + (range_index * PORTS_PER_ROUTER);
        let tcp_range = (start_port, start_port + PORTS_PER_ROUTER - 1);
        let tcp = Arc::new(TcpPlane::new(
            TcpPlaneConfig {
                ip: "127.0.0.1".parse().unwrap(),
                port_range: tcp_range,
                proxy_protocol: options.proxy_protocol,
                connect_timeout: Duration::from_secs(2),
                drain_timeout: Duration::from_secs(2),
                sync: test_sync_config(),
                ..TcpPlaneConfig::default()
            },
            store.clone(),
            discovery.clone(),
        ));

        let router = Router::new(http.clone(), tcp.clone());
        router.start().await.expect("Failed to start router");

        let http_addr = http.local_addrs()[0];
        let https_addr = http.tls_local_addrs()[0];

        Self {
            http_addr,
            https_addr,
            tcp_range,
            store,
            discovery,
            http,
            tcp,
            router,
        }
    }

    /// Register backends for a service
    pub fn set_instances(&self, service: &str, instances: Vec<Instance>) {
        self.discovery.set(service, instances);
    }

    pub async fn add_http_route(&self, route: Route) -> Route {
        self.http.add_route(route).await.expect("Failed to add HTTP route")
    }

    pub async fn add_tcp_route(&self, route: Route) -> Route {
        self.tcp.add_route(route).await.expect("Failed to add TCP route")
    }

    /// Plain HTTP URL on the router for a path
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    /// Send raw bytes to the plain HTTP listener behind a PROXY header
    pub async fn connect_http_with_preamble(&self, preamble: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(self.http_addr).await.unwrap();
        stream.write_all(preamble).await.unwrap();
        stream
    }

    pub async fn shutdown(&self) {
        self.router.close().await;
    }
}

/// Client that never reuses connections, so every request opens a new one
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

/// HTTPS client trusting only `ca_pem`, resolving `domain` to the router
pub fn https_client(ca_pem: &str, domain: &str, addr: SocketAddr) -> reqwest::Client {
    let tls = switchyard_common::client_config_from_pem(ca_pem).expect("Failed to build client TLS config");
    reqwest::Client::builder()
        .no_proxy()
        .use_preconfigured_tls(tls)
        .resolve(domain, addr)
        .build()
        .unwrap()
}

/// Complete a TLS handshake for `server_name` trusting only `ca_pem`
pub async fn tls_handshake(addr: SocketAddr, server_name: &str, ca_pem: &str) -> anyhow::Result<()> {
    let config = switchyard_common::client_config_from_pem(ca_pem)
        .context("Failed to build client TLS config")?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .with_context(|| format!("Invalid server name {}", server_name))?;
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    let mut tls = connector
        .connect(name, stream)
        .await
        .with_context(|| format!("TLS handshake for {} failed", server_name))?;
    tls.shutdown().await.ok();
    Ok(())
}

/// Initialize tracing and crypto provider for tests
pub fn init_test() {
    // Install rustls crypto provider (ignore if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("switchyard=debug,switchyard_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
