//! Listener-local route table.
//!
//! Each listener keeps a derived, read-only snapshot of the routes it serves.
//! Snapshots are never mutated in place: every change builds a new table and
//! swaps it in, so concurrent readers see either the old or the new table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::route::{wildcard_candidates, Route};

/// Immutable snapshot of a listener's routes
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    by_id: HashMap<String, Arc<Route>>,
    by_domain: HashMap<String, Arc<Route>>,
    by_port: HashMap<u16, Arc<Route>>,
    revision: u64,
}

impl RouteTable {
    pub fn from_routes(routes: impl IntoIterator<Item = Route>, revision: u64) -> Self {
        let mut table = Self {
            revision,
            ..Default::default()
        };
        for route in routes {
            table.insert(route);
        }
        table
    }

    /// Insert or replace a route, dropping the index entries of its old version
    pub fn insert(&mut self, route: Route) {
        self.remove(&route.id);
        let route = Arc::new(route);
        if let Some(domain) = route.domain() {
            self.by_domain.insert(domain.to_string(), route.clone());
        }
        if let Some(port) = route.port() {
            self.by_port.insert(port, route.clone());
        }
        self.by_id.insert(route.id.clone(), route);
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Route>> {
        let old = self.by_id.remove(id)?;
        if let Some(domain) = old.domain() {
            if self.by_domain.get(domain).is_some_and(|r| r.id == id) {
                self.by_domain.remove(domain);
            }
        }
        if let Some(port) = old.port() {
            if self.by_port.get(&port).is_some_and(|r| r.id == id) {
                self.by_port.remove(&port);
            }
        }
        Some(old)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Route>> {
        self.by_id.get(id)
    }

    /// Route claiming exactly this host name
    pub fn lookup_exact(&self, host: &str) -> Option<&Arc<Route>> {
        self.by_domain.get(host)
    }

    /// Most specific wildcard route covering this host name
    pub fn lookup_wildcard(&self, host: &str) -> Option<&Arc<Route>> {
        wildcard_candidates(host).find_map(|pattern| self.by_domain.get(&pattern))
    }

    /// Exact match first, then wildcard
    pub fn lookup(&self, host: &str) -> Option<&Arc<Route>> {
        self.lookup_exact(host).or_else(|| self.lookup_wildcard(host))
    }

    pub fn by_port(&self, port: u16) -> Option<&Arc<Route>> {
        self.by_port.get(&port)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.by_id.values()
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.by_port.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Shared handle to a listener's current table and sync progress
pub struct RouteTableHandle {
    current: ArcSwap<RouteTable>,
    applied: watch::Sender<u64>,
    synced: AtomicBool,
    degraded: AtomicBool,
}

impl RouteTableHandle {
    pub fn new() -> Arc<Self> {
        let (applied, _) = watch::channel(0);
        Arc::new(Self {
            current: ArcSwap::from_pointee(RouteTable::default()),
            applied,
            synced: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        })
    }

    /// Current snapshot; cheap, never blocks writers
    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    /// Swap in a new table and publish its revision. Returns the old table.
    pub(crate) fn replace(&self, table: RouteTable) -> Arc<RouteTable> {
        let revision = table.revision();
        let previous = self.current.swap(Arc::new(table));
        self.applied.send_replace(revision);
        previous
    }

    /// Wait until a store revision has been applied to this table.
    ///
    /// Returns false on timeout; the change is committed either way and will
    /// still show up once the watch catches up.
    pub async fn wait_for_revision(&self, revision: u64, timeout: Duration) -> bool {
        let mut rx = self.applied.subscribe();
        let applied = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|applied| *applied >= revision)).await,
            Ok(Ok(_))
        );
        applied
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn set_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// True while the table may be stale because the store cannot be reached
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }
}
