use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::balancer::Balancer;
use crate::discovery::Discovery;
use crate::error::{ListenerError, ProxyError};
use crate::listener::Listener;
use crate::proxy_protocol;
use crate::route::{Route, RouteKind};
use crate::state::{PlaneState, PortAllocator};
use crate::store::{RouteStore, RouteWatch};
use crate::sync::{SyncConfig, TableObserver};
use crate::table::RouteTable;

/// Attempts to bind a port when a route appears through the watch
const BIND_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct TcpPlaneConfig {
    /// Address every route port is bound on
    pub ip: IpAddr,
    pub port_range: (u16, u16),
    /// Ports never handed out (the process's own HTTP ports)
    pub reserved: Vec<u16>,
    /// Enable PROXY protocol on every route created through this plane
    pub proxy_protocol: bool,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub sync: SyncConfig,
}

impl Default for TcpPlaneConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: (3000, 3500),
            reserved: Vec::new(),
            proxy_protocol: false,
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            sync: SyncConfig::default(),
        }
    }
}

/// TCP data plane: one listening socket per TCP route
pub struct TcpPlane {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    state: PlaneState,
    ip: IpAddr,
    proxy_protocol: bool,
    connect_timeout: Duration,
    allocator: PortAllocator,
    /// Serialises port selection within this process
    allocation: tokio::sync::Mutex<()>,
    bindings: DashMap<u16, Binding>,
    /// Sockets bound by `add_route` before the route reached the store
    prebound: DashMap<u16, std::net::TcpListener>,
    /// Fires once the last accept loop of a port has released its socket
    closed: DashMap<u16, CancellationToken>,
    balancer: Balancer,
}

struct Binding {
    route_id: String,
    cancel: CancellationToken,
}

impl TcpPlane {
    pub fn new(
        config: TcpPlaneConfig,
        store: Arc<dyn RouteStore>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        let (start, end) = config.port_range;
        Self {
            inner: Arc::new(TcpInner {
                state: PlaneState::new(RouteKind::Tcp, store, config.sync, config.drain_timeout),
                ip: config.ip,
                proxy_protocol: config.proxy_protocol,
                connect_timeout: config.connect_timeout,
                allocator: PortAllocator::new(start, end, config.reserved),
                allocation: tokio::sync::Mutex::new(()),
                bindings: DashMap::new(),
                prebound: DashMap::new(),
                closed: DashMap::new(),
                balancer: Balancer::new(discovery),
            }),
        }
    }

    /// Ports with a live accept loop
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.inner.bindings.iter().map(|b| *b.key()).collect();
        ports.sort_unstable();
        ports
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.ip
    }

    /// True while the route watch is down and the table may be stale
    pub fn is_degraded(&self) -> bool {
        self.inner.state.routes.is_degraded()
    }
}

impl TcpInner {
    /// Ports claimed by stored routes or held locally
    async fn taken_ports(&self) -> Result<HashSet<u16>, ListenerError> {
        let mut taken: HashSet<u16> = self
            .state
            .store
            .list()
            .await?
            .iter()
            .filter_map(|r| r.port())
            .collect();
        taken.extend(self.bindings.iter().map(|b| *b.key()));
        taken.extend(self.prebound.iter().map(|b| *b.key()));
        Ok(taken)
    }

    /// Wait for a previous accept loop on `port` to let go of its socket
    async fn wait_closed(&self, port: u16) {
        let closed = self.closed.get(&port).map(|c| c.clone());
        if let Some(closed) = closed {
            closed.cancelled().await;
        }
    }

    fn bind_std(&self, port: u16) -> io::Result<std::net::TcpListener> {
        let listener = std::net::TcpListener::bind(SocketAddr::new(self.ip, port))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Bind a port ahead of storing the route that claims it
    async fn prebind(&self, port: u16) -> io::Result<()> {
        self.wait_closed(port).await;
        let listener = self.bind_std(port)?;
        self.prebound.insert(port, listener);
        Ok(())
    }

    /// Lowest free port the OS lets us bind
    async fn allocate(&self) -> Result<u16, ListenerError> {
        let taken = self.taken_ports().await?;
        for port in self.allocator.candidates(&taken) {
            match self.prebind(port).await {
                Ok(()) => return Ok(port),
                Err(e) => {
                    tracing::debug!(port, "Skipping port the OS refused: {}", e);
                }
            }
        }
        Err(self.allocator.exhausted())
    }

    /// Validate and bind an explicitly requested port
    async fn claim(&self, port: u16) -> Result<(), ListenerError> {
        let taken = self.taken_ports().await?;
        self.allocator.check(port, &taken)?;
        self.prebind(port).await.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => ListenerError::PortConflict(port),
            _ => ListenerError::Bind {
                addr: SocketAddr::new(self.ip, port).to_string(),
                source: e,
            },
        })
    }

    fn bind(self: &Arc<Self>, port: u16, route_id: &str) {
        let cancel = self.state.accept.child_token();
        let previous = self.closed.get(&port).map(|c| c.clone());
        let closed = CancellationToken::new();
        self.closed.insert(port, closed.clone());
        let prebound = self.prebound.remove(&port).map(|(_, l)| l);

        self.bindings.insert(
            port,
            Binding {
                route_id: route_id.to_string(),
                cancel: cancel.clone(),
            },
        );
        tokio::spawn(self.clone().accept_loop(port, prebound, previous, closed, cancel));
    }

    fn unbind(&self, port: u16) {
        if let Some((_, binding)) = self.bindings.remove(&port) {
            tracing::info!(port, route_id = %binding.route_id, "Closing TCP route socket");
            binding.cancel.cancel();
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        port: u16,
        prebound: Option<std::net::TcpListener>,
        previous: Option<CancellationToken>,
        closed: CancellationToken,
        cancel: CancellationToken,
    ) {
        // Declared first so it fires after the socket below is dropped
        let _closed = closed.drop_guard();

        if let Some(previous) = previous {
            previous.cancelled().await;
        }
        let listener = match self.open_listener(port, prebound, &cancel).await {
            Some(listener) => listener,
            None => return,
        };
        tracing::info!(port, "TCP route listening on {}:{}", self.ip, port);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(port, "TCP connection from {}", peer);
                    let this = self.clone();
                    self.state.spawn_connection(async move {
                        if let Err(e) = this.proxy(stream, peer, port).await {
                            tracing::warn!(port, "TCP connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(port, "TCP accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        tracing::debug!(port, "TCP accept loop stopped");
    }

    async fn open_listener(
        &self,
        port: u16,
        prebound: Option<std::net::TcpListener>,
        cancel: &CancellationToken,
    ) -> Option<TcpListener> {
        if let Some(listener) = prebound {
            match TcpListener::from_std(listener) {
                Ok(listener) => return Some(listener),
                Err(e) => tracing::warn!(port, "Pre-bound socket unusable: {}", e),
            }
        }

        let mut delay = Duration::from_millis(100);
        for attempt in 1..=BIND_ATTEMPTS {
            match self.bind_std(port).and_then(TcpListener::from_std) {
                Ok(listener) => return Some(listener),
                Err(e) if attempt == BIND_ATTEMPTS => {
                    tracing::error!(port, "Failed to bind TCP route port: {}", e);
                }
                Err(e) => {
                    tracing::debug!(port, attempt, "Bind failed, retrying: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay *= 2;
                }
            }
        }
        None
    }

    /// Forward one client connection to a backend of the route on `port`
    async fn proxy(&self, mut client: TcpStream, peer: SocketAddr, port: u16) -> Result<(), ProxyError> {
        // Read the route per connection so updates apply to new connections
        let route = self
            .state
            .routes
            .load()
            .by_port(port)
            .cloned()
            .ok_or_else(|| ProxyError::RouteNotFound(format!("port {}", port)))?;
        let proxy_protocol = route.as_tcp().is_some_and(|t| t.proxy_protocol);

        let instance = self.balancer.pick(&route.service, false).await?;
        let mut backend = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&instance.addr))
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|e| ProxyError::Upstream(format!("connect {}: {}", instance.addr, e)))?;

        if proxy_protocol {
            let local = client
                .local_addr()
                .map_err(|e| ProxyError::Upstream(e.to_string()))?;
            backend
                .write_all(&proxy_protocol::encode_v2(peer, local))
                .await
                .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        }

        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut backend)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        tracing::debug!(
            port,
            route_id = %route.id,
            backend = %instance.addr,
            sent,
            received,
            "TCP connection closed"
        );
        Ok(())
    }
}

/// Binds and closes route sockets as the table changes
struct Reconciler(Weak<TcpInner>);

impl TableObserver for Reconciler {
    fn table_swapped(&self, previous: &RouteTable, current: &RouteTable) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };

        let stale: Vec<u16> = inner
            .bindings
            .iter()
            .map(|b| *b.key())
            .filter(|port| current.by_port(*port).is_none())
            .collect();
        for port in stale {
            inner.unbind(port);
        }

        for route in current.routes() {
            let Some(port) = route.port() else {
                continue;
            };
            if inner.bindings.contains_key(&port) {
                if previous.by_port(port).is_some_and(|r| r.id != route.id) {
                    tracing::debug!(port, route_id = %route.id, "Port handed to another route");
                }
                continue;
            }
            inner.bind(port, &route.id);
        }
    }
}

#[async_trait]
impl Listener for TcpPlane {
    fn kind(&self) -> RouteKind {
        RouteKind::Tcp
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let inner = &self.inner;
        inner.state.begin_start()?;
        let (start, end) = inner.allocator.range();
        tracing::info!("TCP plane port range: {}-{} on {}", start, end, inner.ip);

        let reconciler: Arc<dyn TableObserver> = Arc::new(Reconciler(Arc::downgrade(inner)));
        inner.state.start_sync(Some(reconciler)).await
    }

    async fn close(&self) -> Result<(), ListenerError> {
        let inner = &self.inner;
        inner.state.shutdown().await;
        inner.bindings.clear();
        inner.prebound.clear();
        tracing::info!("TCP plane closed");
        Ok(())
    }

    async fn add_route(&self, mut route: Route) -> Result<Route, ListenerError> {
        let inner = &self.inner;
        inner.state.check_kind(&route)?;

        let allocation = inner.allocation.lock().await;
        let port = match route.port() {
            Some(port) => {
                inner.claim(port).await?;
                port
            }
            None => inner.allocate().await?,
        };
        if let Some(tcp) = route.as_tcp_mut() {
            tcp.port = Some(port);
            tcp.proxy_protocol |= inner.proxy_protocol;
        }

        let stored = match inner.state.store.add(route).await {
            Ok(stored) => stored,
            Err(e) => {
                inner.prebound.remove(&port);
                return Err(e.into());
            }
        };
        drop(allocation);

        tracing::info!(route_id = %stored.id, port, service = %stored.service, "TCP route added");
        inner.state.await_applied(&stored).await?;
        Ok(stored)
    }

    async fn update_route(&self, mut route: Route) -> Result<Route, ListenerError> {
        let inner = &self.inner;
        inner.state.check_kind(&route)?;
        let current = inner.state.get(&route.id).await?;

        let allocation = inner.allocation.lock().await;
        let mut claimed = None;
        match route.port() {
            None => {
                if let Some(tcp) = route.as_tcp_mut() {
                    tcp.port = current.port();
                }
            }
            Some(port) if Some(port) == current.port() => {}
            Some(port) => {
                inner.claim(port).await?;
                claimed = Some(port);
            }
        }

        let updated = match inner.state.store.update(route).await {
            Ok(updated) => updated,
            Err(e) => {
                if let Some(port) = claimed {
                    inner.prebound.remove(&port);
                }
                return Err(e.into());
            }
        };
        drop(allocation);

        tracing::info!(route_id = %updated.id, port = ?updated.port(), "TCP route updated");
        inner.state.await_applied(&updated).await?;
        Ok(updated)
    }

    async fn remove_route(&self, id: &str) -> Result<(), ListenerError> {
        let removed = self.inner.state.remove(id).await?;
        tracing::info!(route_id = %removed.id, port = ?removed.port(), "TCP route removed");
        if let Some(port) = removed.port() {
            // Hand the port back only once its socket is closed
            if self.inner.state.routes.load().by_port(port).is_none() {
                let _ = tokio::time::timeout(
                    self.inner.state.sync_config.apply_timeout,
                    self.inner.wait_closed(port),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn get_route(&self, id: &str) -> Result<Route, ListenerError> {
        self.inner.state.get(id).await
    }

    async fn list_routes(&self) -> Result<Vec<Route>, ListenerError> {
        self.inner.state.list().await
    }

    async fn watch(&self) -> Result<RouteWatch, ListenerError> {
        self.inner.state.watch().await
    }
}
