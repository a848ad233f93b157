use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::ListenerError;
use crate::route::{Route, RouteKind};
use crate::store::{RouteStore, RouteWatch};
use crate::sync::{filter_kind, RouteSync, SyncConfig, TableObserver};
use crate::table::RouteTableHandle;

/// Port allocator for TCP routes
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        Self {
            start,
            end,
            reserved: reserved.into_iter().collect(),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    /// Free ports, lowest first
    pub fn candidates<'a>(&'a self, taken: &'a HashSet<u16>) -> impl Iterator<Item = u16> + 'a {
        (self.start..=self.end).filter(move |p| !self.reserved.contains(p) && !taken.contains(p))
    }

    /// Check an explicitly requested port
    pub fn check(&self, port: u16, taken: &HashSet<u16>) -> Result<(), ListenerError> {
        if port < self.start || port > self.end {
            return Err(ListenerError::PortOutOfRange {
                port,
                start: self.start,
                end: self.end,
            });
        }
        if self.reserved.contains(&port) || taken.contains(&port) {
            return Err(ListenerError::PortConflict(port));
        }
        Ok(())
    }

    pub fn exhausted(&self) -> ListenerError {
        ListenerError::PortExhausted {
            start: self.start,
            end: self.end,
        }
    }
}

/// Lifecycle and route plumbing shared by both planes.
///
/// `accept` stops accept loops and the sync task; `force` ends connections
/// still running when the drain window closes.
pub struct PlaneState {
    pub kind: RouteKind,
    pub store: Arc<dyn RouteStore>,
    pub routes: Arc<RouteTableHandle>,
    pub sync_config: SyncConfig,
    pub drain_timeout: Duration,
    pub accept: CancellationToken,
    pub force: CancellationToken,
    pub connections: TaskTracker,
    started: AtomicBool,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaneState {
    pub fn new(
        kind: RouteKind,
        store: Arc<dyn RouteStore>,
        sync_config: SyncConfig,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            store,
            routes: RouteTableHandle::new(),
            sync_config,
            drain_timeout,
            accept: CancellationToken::new(),
            force: CancellationToken::new(),
            connections: TaskTracker::new(),
            started: AtomicBool::new(false),
            sync_task: Mutex::new(None),
        }
    }

    /// Mark started; a listener starts at most once
    pub fn begin_start(&self) -> Result<(), ListenerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ListenerError::AlreadyStarted);
        }
        Ok(())
    }

    pub async fn start_sync(
        &self,
        observer: Option<Arc<dyn TableObserver>>,
    ) -> Result<(), ListenerError> {
        let sync = RouteSync::new(
            self.store.clone(),
            self.kind,
            self.routes.clone(),
            observer,
            self.sync_config.clone(),
        );
        let task = sync.spawn(self.accept.child_token()).await?;
        *self.sync_task.lock() = Some(task);
        Ok(())
    }

    /// Run a connection task that shutdown can wait for and, past the drain
    /// window, cut short
    pub fn spawn_connection<F>(&self, connection: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let force = self.force.clone();
        self.connections.spawn(async move {
            tokio::select! {
                _ = force.cancelled() => {}
                _ = connection => {}
            }
        });
    }

    /// Cancel accept loops and the sync task, then drain connections
    pub async fn shutdown(&self) {
        self.accept.cancel();
        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
        }

        self.connections.close();
        let active = self.connections.len();
        if active > 0 {
            tracing::info!(kind = %self.kind, active, "Draining connections");
        }
        if tokio::time::timeout(self.drain_timeout, self.connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                kind = %self.kind,
                remaining = self.connections.len(),
                "Drain window elapsed, closing remaining connections"
            );
            self.force.cancel();
            self.connections.wait().await;
        }
    }

    pub fn check_kind(&self, route: &Route) -> Result<(), ListenerError> {
        if route.kind() != self.kind {
            return Err(ListenerError::WrongKind {
                expected: self.kind,
                actual: route.kind(),
            });
        }
        Ok(())
    }

    /// Wait until a committed change shows in the local table.
    ///
    /// A listener that has not started has no table to wait for. Past
    /// `apply_timeout` the change stays committed and `NotVisible` is returned.
    pub async fn await_applied(&self, route: &Route) -> Result<(), ListenerError> {
        if !self.routes.is_synced() {
            return Ok(());
        }
        if self
            .routes
            .wait_for_revision(route.revision, self.sync_config.apply_timeout)
            .await
        {
            return Ok(());
        }
        tracing::warn!(
            kind = %self.kind,
            route_id = %route.id,
            revision = route.revision,
            "Route committed but not yet visible locally"
        );
        Err(ListenerError::NotVisible {
            route_id: route.id.clone(),
            revision: route.revision,
        })
    }

    pub async fn update(&self, route: Route) -> Result<Route, ListenerError> {
        self.check_kind(&route)?;
        let route = self.store.update(route).await?;
        self.await_applied(&route).await?;
        Ok(route)
    }

    pub async fn remove(&self, id: &str) -> Result<Route, ListenerError> {
        let current = self.get(id).await?;
        let removed = self.store.remove(&current.id).await?;
        self.await_applied(&removed).await?;
        Ok(removed)
    }

    /// Route by id, only if it belongs to this plane
    pub async fn get(&self, id: &str) -> Result<Route, ListenerError> {
        let route = self.store.get(id).await?;
        self.check_kind(&route)?;
        Ok(route)
    }

    pub async fn list(&self) -> Result<Vec<Route>, ListenerError> {
        let mut routes: Vec<Route> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.kind() == self.kind)
            .collect();
        routes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(routes)
    }

    pub async fn watch(&self) -> Result<RouteWatch, ListenerError> {
        Ok(filter_kind(self.store.watch().await?, self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_port() {
        let allocator = PortAllocator::new(3000, 3005, [3000, 3002]);
        let taken = HashSet::from([3001]);
        let free: Vec<u16> = allocator.candidates(&taken).collect();
        assert_eq!(free, vec![3003, 3004, 3005]);
    }

    #[test]
    fn test_check_explicit_port() {
        let allocator = PortAllocator::new(3000, 3005, [3002]);
        let taken = HashSet::from([3001]);
        assert!(allocator.check(3000, &taken).is_ok());
        assert!(matches!(
            allocator.check(3001, &taken),
            Err(ListenerError::PortConflict(3001))
        ));
        assert!(matches!(
            allocator.check(3002, &taken),
            Err(ListenerError::PortConflict(3002))
        ));
        assert!(matches!(
            allocator.check(4000, &taken),
            Err(ListenerError::PortOutOfRange { port: 4000, .. })
        ));
    }

    #[test]
    fn test_allocation_sequence_stays_in_bounds() {
        let allocator = PortAllocator::new(3000, 3009, [3003, 3007]);
        let mut taken: HashSet<u16> = HashSet::new();
        let mut order: Vec<u16> = Vec::new();
        // Deterministic add/remove interleaving
        let mut seed: u32 = 17;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if seed % 3 == 0 && !order.is_empty() {
                let port = order.remove((seed as usize / 3) % order.len());
                taken.remove(&port);
            } else if let Some(port) = {
                let next = allocator.candidates(&taken).next();
                next
            } {
                assert!(taken.insert(port), "port {} handed out twice", port);
                order.push(port);
            } else {
                assert_eq!(taken.len(), 8);
            }
            assert!(taken
                .iter()
                .all(|p| (3000..=3009).contains(p) && !allocator.is_reserved(*p)));
        }
    }

    #[test]
    fn test_freed_port_is_reused() {
        let allocator = PortAllocator::new(3000, 3001, std::iter::empty());
        let mut taken = HashSet::from([3000, 3001]);
        assert_eq!(allocator.candidates(&taken).next(), None);
        taken.remove(&3000);
        assert_eq!(allocator.candidates(&taken).next(), Some(3000));
    }
}
