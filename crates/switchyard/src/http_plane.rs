use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;

use crate::affinity::{AffinityKey, KEY_LEN};
use crate::balancer::Balancer;
use crate::certs::{CertificateManager, ACME_TLS_ALPN};
use crate::discovery::Discovery;
use crate::error::{ListenerError, ProxyError};
use crate::listener::Listener;
use crate::proxy_protocol;
use crate::route::{is_wildcard, normalize_domain, Route, RouteKind};
use crate::state::PlaneState;
use crate::store::{RouteStore, RouteWatch};
use crate::sync::{SyncConfig, TableObserver};
use crate::table::RouteTable;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Time allowed for an inbound PROXY protocol header
const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpPlaneConfig {
    pub addrs: Vec<SocketAddr>,
    pub tls_addrs: Vec<SocketAddr>,
    /// Expect a PROXY protocol header on every inbound connection
    pub proxy_protocol: bool,
    pub cookie_key: [u8; KEY_LEN],
    pub connect_timeout: Duration,
    /// Bound on waiting for the backend's response headers
    pub response_timeout: Duration,
    pub drain_timeout: Duration,
    pub sync: SyncConfig,
}

impl HttpPlaneConfig {
    pub fn new(cookie_key: [u8; KEY_LEN]) -> Self {
        Self {
            addrs: Vec::new(),
            tls_addrs: Vec::new(),
            proxy_protocol: false,
            cookie_key,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(10),
            sync: SyncConfig::default(),
        }
    }
}

impl std::fmt::Debug for HttpPlaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPlaneConfig")
            .field("addrs", &self.addrs)
            .field("tls_addrs", &self.tls_addrs)
            .field("proxy_protocol", &self.proxy_protocol)
            .finish_non_exhaustive()
    }
}

/// HTTP data plane: host based routing over plain and TLS listeners
pub struct HttpPlane {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    state: PlaneState,
    addrs: Vec<SocketAddr>,
    tls_addrs: Vec<SocketAddr>,
    proxy_protocol: bool,
    response_timeout: Duration,
    affinity: AffinityKey,
    balancer: Balancer,
    certs: Arc<CertificateManager>,
    client: Client<HttpConnector, ProxyBody>,
    bound: Mutex<Bound>,
}

#[derive(Default)]
struct Bound {
    plain: Vec<SocketAddr>,
    tls: Vec<SocketAddr>,
}

/// Where a request came from, for forwarding headers
#[derive(Clone, Copy)]
struct Origin {
    client: SocketAddr,
    scheme: &'static str,
    port: u16,
}

impl HttpPlane {
    pub fn new(
        config: HttpPlaneConfig,
        store: Arc<dyn RouteStore>,
        discovery: Arc<dyn Discovery>,
        certs: Arc<CertificateManager>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            inner: Arc::new(HttpInner {
                state: PlaneState::new(RouteKind::Http, store, config.sync, config.drain_timeout),
                addrs: config.addrs,
                tls_addrs: config.tls_addrs,
                proxy_protocol: config.proxy_protocol,
                response_timeout: config.response_timeout,
                affinity: AffinityKey::new(&config.cookie_key),
                balancer: Balancer::new(discovery),
                certs,
                client,
                bound: Mutex::new(Bound::default()),
            }),
        }
    }

    /// Bound plain addresses, with real ports when configured with port 0
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.bound.lock().plain.clone()
    }

    pub fn tls_local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.bound.lock().tls.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.state.routes.is_degraded()
    }
}

/// Forgets parsed certificates of routes that went away
struct CertificatePruner(Arc<CertificateManager>);

impl TableObserver for CertificatePruner {
    fn table_swapped(&self, _previous: &RouteTable, current: &RouteTable) {
        self.0.retain_routes(current);
    }
}

impl HttpInner {
    async fn bind_all(&self) -> Result<Vec<(TcpListener, bool)>, ListenerError> {
        let mut listeners = Vec::new();
        let addrs = self.addrs.iter().map(|a| (a, false));
        let tls_addrs = self.tls_addrs.iter().map(|a| (a, true));
        for (addr, tls) in addrs.chain(tls_addrs) {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| ListenerError::Bind {
                    addr: addr.to_string(),
                    source: e,
                })?;
            listeners.push((listener, tls));
        }
        Ok(listeners)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, tls: bool) {
        let cancel = self.state.accept.clone();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("HTTP connection from {}", peer);
                    let this = self.clone();
                    self.state.spawn_connection(this.serve(stream, peer, tls));
                }
                Err(e) => {
                    tracing::warn!("HTTP accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn serve(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr, tls: bool) {
        let client = if self.proxy_protocol {
            match tokio::time::timeout(PROXY_HEADER_TIMEOUT, proxy_protocol::read_header(&mut stream)).await {
                Ok(Ok(Some(client))) => client,
                Ok(Ok(None)) => peer,
                Ok(Err(e)) => {
                    tracing::debug!("Bad PROXY header from {}: {}", peer, e);
                    return;
                }
                Err(_) => {
                    tracing::debug!("Timed out reading PROXY header from {}", peer);
                    return;
                }
            }
        } else {
            peer
        };
        let port = stream.local_addr().map(|a| a.port()).unwrap_or_default();

        if !tls {
            let origin = Origin {
                client,
                scheme: "http",
                port,
            };
            return self.serve_connection(stream, origin).await;
        }

        let start = match LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await {
            Ok(start) => start,
            Err(e) => {
                tracing::debug!("Bad TLS ClientHello from {}: {}", client, e);
                return;
            }
        };
        let hello = start.client_hello();
        let server_name = hello.server_name().map(str::to_string);
        let validation = hello
            .alpn()
            .is_some_and(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN));
        if validation {
            match self.certs.alpn_challenge(server_name.as_deref()) {
                Some(config) => match start.into_stream(config).await {
                    Ok(_) => tracing::info!("Answered TLS-ALPN-01 validation for {:?}", server_name),
                    Err(e) => tracing::debug!("TLS-ALPN-01 handshake from {} failed: {}", client, e),
                },
                None => tracing::debug!("No pending TLS-ALPN-01 challenge for {:?}", server_name),
            }
            return;
        }

        let routes = self.state.routes.load();
        let certificate = match self.certs.certificate_for(server_name.as_deref(), &routes).await {
            Ok(certificate) => certificate,
            Err(e) => {
                tracing::warn!("TLS handshake from {} for {:?} aborted: {}", client, server_name, e);
                return;
            }
        };
        match start.into_stream(certificate.server_config()).await {
            Ok(tls_stream) => {
                let origin = Origin {
                    client,
                    scheme: "https",
                    port,
                };
                self.serve_connection(tls_stream, origin).await;
            }
            Err(e) => {
                tracing::debug!("TLS handshake failed from {}: {}", client, e);
            }
        }
    }

    /// Serve HTTP/1.1 on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, origin: Origin)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let this = self.clone();
        let service = service_fn(move |req| {
            let this = this.clone();
            async move { Ok::<_, Infallible>(this.handle_request(req, origin).await) }
        });

        let connection = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(connection);
        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = self.state.accept.cancelled() => {
                // Finish the in-flight exchange, then close
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };
        if let Err(e) = result {
            tracing::debug!("HTTP connection error from {}: {}", origin.client, e);
        }
    }

    async fn handle_request(&self, req: Request<Incoming>, origin: Origin) -> Response<ProxyBody> {
        tracing::debug!(
            "HTTP request: {} {} (Host: {:?})",
            req.method(),
            req.uri(),
            req.headers().get(header::HOST)
        );

        match self.route_request(req, origin).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Request from {} failed: {}", origin.client, e);
                error_response(&e)
            }
        }
    }

    async fn route_request(
        &self,
        req: Request<Incoming>,
        origin: Origin,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let host = request_host(&req).ok_or_else(|| ProxyError::RouteNotFound(String::new()))?;
        let route = self
            .state
            .routes
            .load()
            .lookup(&host)
            .cloned()
            .ok_or_else(|| ProxyError::RouteNotFound(host.clone()))?;
        let Some(http) = route.as_http() else {
            return Err(ProxyError::RouteNotFound(host));
        };

        let candidates = self.balancer.candidates(&route.service, http.leader_only).await?;

        // A valid cookie naming a live backend pins the request to it
        let pinned = if http.sticky {
            self.affinity
                .from_headers(req.headers())
                .and_then(|addr| candidates.iter().find(|i| i.addr == addr))
        } else {
            None
        };
        let (backend, set_cookie) = match pinned {
            Some(instance) => (instance, false),
            None => {
                let instance = self
                    .balancer
                    .rotate(&route.service, &candidates)
                    .ok_or_else(|| ProxyError::BackendUnavailable(route.service.clone()))?;
                (instance, http.sticky)
            }
        };

        let upstream = build_upstream_request(req, &backend.addr, origin, http.disable_keep_alives)?;
        let response = tokio::time::timeout(self.response_timeout, self.client.request(upstream))
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|e| {
                if e.is_connect() {
                    ProxyError::Upstream(format!("connect {}: {}", backend.addr, e))
                } else {
                    ProxyError::Upstream(format!("{}: {}", backend.addr, e))
                }
            })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        if set_cookie {
            if let Some(cookie) = self.affinity.set_cookie(&backend.addr) {
                parts.headers.append(header::SET_COOKIE, cookie);
            }
        }
        tracing::debug!(
            route_id = %route.id,
            backend = %backend.addr,
            status = %parts.status,
            "Proxied request"
        );
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Normalised host a request is addressed to
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .uri()
        .host()
        .or_else(|| req.headers().get(header::HOST)?.to_str().ok())?;
    let host = normalize_domain(raw)?;
    if is_wildcard(&host) {
        return None;
    }
    Some(host)
}

fn build_upstream_request(
    req: Request<Incoming>,
    backend: &str,
    origin: Origin,
    close: bool,
) -> Result<Request<ProxyBody>, ProxyError> {
    let (mut parts, body) = req.into_parts();
    let original_authority = parts.uri.authority().cloned();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    parts.uri = format!("http://{}{}", backend, path)
        .parse::<Uri>()
        .map_err(|e| ProxyError::Upstream(format!("bad backend address {}: {}", backend, e)))?;

    // Absolute-form targets carry the host in the URI only
    if !parts.headers.contains_key(header::HOST) {
        if let Some(value) = original_authority.and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
            parts.headers.insert(header::HOST, value);
        }
    }
    strip_hop_by_hop(&mut parts.headers);
    add_forwarded_headers(&mut parts.headers, origin);
    if close {
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    Ok(Request::from_parts(parts, body.boxed()))
}

/// Drop hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, origin: Origin) {
    let client_ip = origin.client.ip().to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static(origin.scheme));
    headers.insert("x-forwarded-port", HeaderValue::from(origin.port));
}

/// Gateway style response; no internal detail reaches the client
fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    let status = match error {
        ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
        ProxyError::BackendUnavailable(_) | ProxyError::Discovery(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
    };
    let body = Full::new(Bytes::from(status.canonical_reason().unwrap_or("Error")))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[async_trait]
impl Listener for HttpPlane {
    fn kind(&self) -> RouteKind {
        RouteKind::Http
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let inner = &self.inner;
        inner.state.begin_start()?;

        let pruner: Arc<dyn TableObserver> = Arc::new(CertificatePruner(inner.certs.clone()));
        inner.state.start_sync(Some(pruner)).await?;

        let listeners = match inner.bind_all().await {
            Ok(listeners) => listeners,
            Err(e) => {
                inner.state.shutdown().await;
                return Err(e);
            }
        };

        let mut bound = Bound::default();
        for (listener, tls) in listeners {
            let addr = listener.local_addr().map_err(|e| ListenerError::Bind {
                addr: "listener".into(),
                source: e,
            })?;
            if tls {
                tracing::info!("HTTPS plane listening on {}", addr);
                bound.tls.push(addr);
            } else {
                tracing::info!("HTTP plane listening on {}", addr);
                bound.plain.push(addr);
            }
            tokio::spawn(inner.clone().accept_loop(listener, tls));
        }
        *inner.bound.lock() = bound;
        Ok(())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        self.inner.state.shutdown().await;
        tracing::info!("HTTP plane closed");
        Ok(())
    }

    async fn add_route(&self, route: Route) -> Result<Route, ListenerError> {
        let state = &self.inner.state;
        state.check_kind(&route)?;
        let stored = state.store.add(route).await?;
        tracing::info!(
            route_id = %stored.id,
            domain = stored.domain().unwrap_or_default(),
            service = %stored.service,
            "HTTP route added"
        );
        state.await_applied(&stored).await?;
        Ok(stored)
    }

    async fn update_route(&self, route: Route) -> Result<Route, ListenerError> {
        let updated = self.inner.state.update(route).await?;
        tracing::info!(route_id = %updated.id, "HTTP route updated");
        Ok(updated)
    }

    async fn remove_route(&self, id: &str) -> Result<(), ListenerError> {
        let removed = self.inner.state.remove(id).await?;
        tracing::info!(route_id = %removed.id, "HTTP route removed");
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
