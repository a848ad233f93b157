use std::sync::Arc;

use crate::error::ListenerError;
use crate::listener::Listener;
use crate::route::RouteKind;

/// Owns the HTTP and TCP listeners and starts/stops them as a unit
pub struct Router {
    http: Arc<dyn Listener>,
    tcp: Arc<dyn Listener>,
}

impl Router {
    pub fn new(http: Arc<dyn Listener>, tcp: Arc<dyn Listener>) -> Self {
        Self { http, tcp }
    }

    /// Start HTTP, then TCP. A TCP failure closes HTTP again.
    pub async fn start(&self) -> Result<(), ListenerError> {
        self.http.start().await?;
        if let Err(e) = self.tcp.start().await {
            tracing::error!("TCP listener failed to start: {}", e);
            if let Err(close_err) = self.http.close().await {
                tracing::error!("Error closing HTTP listener after failed start: {}", close_err);
            }
            return Err(e);
        }
        tracing::info!("Router started");
        Ok(())
    }

    /// Close both listeners; failures are logged and not returned
    pub async fn close(&self) {
        if let Err(e) = self.http.close().await {
            tracing::error!("Error closing HTTP listener: {}", e);
        }
        if let Err(e) = self.tcp.close().await {
            tracing::error!("Error closing TCP listener: {}", e);
        }
        tracing::info!("Router closed");
    }

    /// Listener for a route kind name ("http" or "tcp")
    pub fn listener_for(&self, kind: &str) -> Option<Arc<dyn Listener>> {
        match RouteKind::parse(kind)? {
            RouteKind::Http => Some(self.http.clone()),
            RouteKind::Tcp => Some(self.tcp.clone()),
        }
    }

    pub fn http(&self) -> &Arc<dyn Listener> {
        &self.http
    }

    pub fn tcp(&self) -> &Arc<dyn Listener> {
        &self.tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use crate::store::RouteWatch;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockListener {
        kind: RouteKind,
        fail_start: bool,
        starts: AtomicUsize,
        closes: AtomicUsize,
    }

    impl MockListener {
        fn new(kind: RouteKind, fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail_start,
                starts: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Listener for MockListener {
        fn kind(&self) -> RouteKind {
            self.kind
        }

        async fn start(&self) -> Result<(), ListenerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(ListenerError::Sync("mock failure".into()));
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), ListenerError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add_route(&self, route: Route) -> Result<Route, ListenerError> {
            Ok(route)
        }

        async fn update_route(&self, route: Route) -> Result<Route, ListenerError> {
            Ok(route)
        }

        async fn remove_route(&self, _id: &str) -> Result<(), ListenerError> {
            Ok(())
        }

        async fn get_route(&self, id: &str) -> Result<Route, ListenerError> {
            Err(crate::error::StoreError::NotFound(id.to_string()).into())
        }

        async fn list_routes(&self) -> Result<Vec<Route>, ListenerError> {
            Ok(Vec::new())
        }

        async fn watch(&self) -> Result<RouteWatch, ListenerError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
    }

    #[tokio::test]
    async fn test_tcp_failure_rolls_back_http() {
        let http = MockListener::new(RouteKind::Http, false);
        let tcp = MockListener::new(RouteKind::Tcp, true);
        let router = Router::new(http.clone(), tcp.clone());

        let err = router.start().await.unwrap_err();
        assert!(matches!(err, ListenerError::Sync(_)));
        assert_eq!(http.starts.load(Ordering::SeqCst), 1);
        assert_eq!(http.closes.load(Ordering::SeqCst), 1);
        assert_eq!(tcp.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_failure_skips_tcp() {
        let http = MockListener::new(RouteKind::Http, true);
        let tcp = MockListener::new(RouteKind::Tcp, false);
        let router = Router::new(http.clone(), tcp.clone());

        assert!(router.start().await.is_err());
        assert_eq!(tcp.starts.load(Ordering::SeqCst), 0);
        assert_eq!(http.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_reaches_both() {
        let http = MockListener::new(RouteKind::Http, false);
        let tcp = MockListener::new(RouteKind::Tcp, false);
        let router = Router::new(http.clone(), tcp.clone());

        router.start().await.unwrap();
        router.close().await;
        assert_eq!(http.closes.load(Ordering::SeqCst), 1);
        assert_eq!(tcp.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_for() {
        let router = Router::new(
            MockListener::new(RouteKind::Http, false),
            MockListener::new(RouteKind::Tcp, false),
        );
        assert_eq!(router.listener_for("http").unwrap().kind(), RouteKind::Http);
        assert_eq!(router.listener_for("tcp").unwrap().kind(), RouteKind::Tcp);
        assert!(router.listener_for("udp").is_none());
    }
}
