//! Keeps a listener's route table in step with the store.
//!
//! The store's watch stream always starts with a full resync (every route as
//! `Added`, then `Synced`). Resync events are collected into a fresh table that
//! replaces the current one in a single swap, so routes removed while the watch
//! was down disappear. After that every live event produces a new snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ListenerError, StoreError};
use crate::route::RouteKind;
use crate::store::{RouteEvent, RouteStore, RouteWatch};
use crate::table::{RouteTable, RouteTableHandle};

/// Hook for listeners that keep resources tied to routes (bound sockets)
pub trait TableObserver: Send + Sync + 'static {
    /// Called after every swap with the table that was replaced and the new one
    fn table_swapped(&self, previous: &RouteTable, current: &RouteTable);
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on opening a watch and draining its resync
    pub open_timeout: Duration,
    /// Delay before the second reconnect attempt; the first is immediate
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a route mutation waits to become visible locally
    pub apply_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            apply_timeout: Duration::from_secs(5),
        }
    }
}

/// Restrict a watch stream to one route kind. `Synced` markers pass through.
pub fn filter_kind(watch: RouteWatch, kind: RouteKind) -> RouteWatch {
    watch
        .filter(move |item| {
            let keep = match item {
                Ok(event) => event.route().map_or(true, |r| r.kind() == kind),
                Err(_) => true,
            };
            futures_util::future::ready(keep)
        })
        .boxed()
}

pub struct RouteSync {
    store: Arc<dyn RouteStore>,
    kind: RouteKind,
    handle: Arc<RouteTableHandle>,
    observer: Option<Arc<dyn TableObserver>>,
    config: SyncConfig,
}

impl RouteSync {
    pub fn new(
        store: Arc<dyn RouteStore>,
        kind: RouteKind,
        handle: Arc<RouteTableHandle>,
        observer: Option<Arc<dyn TableObserver>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            kind,
            handle,
            observer,
            config,
        }
    }

    /// Apply the initial resync, then keep following the store in the background.
    ///
    /// Fails if the first resync does not complete; the listener must not start
    /// serving from an empty table.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<JoinHandle<()>, ListenerError> {
        let watch = self
            .resync()
            .await
            .map_err(|e| ListenerError::Sync(e.to_string()))?;
        self.handle.set_synced();
        tracing::info!(
            kind = %self.kind,
            routes = self.handle.load().len(),
            "Initial route sync complete"
        );
        Ok(tokio::spawn(self.run(watch, cancel)))
    }

    async fn run(self, mut watch: RouteWatch, cancel: CancellationToken) {
        loop {
            let reason = tokio::select! {
                _ = cancel.cancelled() => return,
                reason = self.follow(&mut watch) => reason,
            };
            tracing::warn!(kind = %self.kind, "Route watch lost: {}", reason);

            watch = match self.reconnect(&cancel).await {
                Some(watch) => watch,
                None => return,
            };
        }
    }

    /// Consume live events until the stream fails or ends
    async fn follow(&self, watch: &mut RouteWatch) -> String {
        loop {
            match watch.next().await {
                Some(Ok(event)) => self.apply(event),
                Some(Err(e)) => return e.to_string(),
                None => return "stream ended".to_string(),
            }
        }
    }

    /// Reopen the watch until a resync succeeds. The first retry is immediate.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<RouteWatch> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
            attempt += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.resync() => result,
            };
            match result {
                Ok(watch) => {
                    if self.handle.is_degraded() {
                        tracing::info!(kind = %self.kind, attempt, "Route watch recovered");
                    }
                    self.handle.set_degraded(false);
                    return Some(watch);
                }
                Err(e) => {
                    self.handle.set_degraded(true);
                    tracing::error!(
                        kind = %self.kind,
                        attempt,
                        "Route watch reconnect failed, serving possibly stale routes: {}",
                        e
                    );
                }
            }
        }
    }

    /// Open a watch and swap in the full route set it replays
    async fn resync(&self) -> Result<RouteWatch, StoreError> {
        let drain = async {
            let mut watch = filter_kind(self.store.watch().await?, self.kind);
            let mut table = RouteTable::default();
            loop {
                match watch.next().await {
                    Some(Ok(RouteEvent::Synced { revision })) => {
                        table.set_revision(revision);
                        return Ok((table, watch));
                    }
                    Some(Ok(RouteEvent::Added(route))) | Some(Ok(RouteEvent::Updated(route))) => {
                        table.insert(route)
                    }
                    Some(Ok(RouteEvent::Removed(route))) => {
                        table.remove(&route.id);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(StoreError::Watch("stream ended during resync".into())),
                }
            }
        };

        let (table, watch) = tokio::time::timeout(self.config.open_timeout, drain)
            .await
            .map_err(|_| StoreError::Unavailable("timed out opening route watch".into()))??;

        tracing::debug!(
            kind = %self.kind,
            routes = table.len(),
            revision = table.revision(),
            "Route table resynced"
        );
        self.swap(table);
        Ok(watch)
    }

    fn apply(&self, event: RouteEvent) {
        let current = self.handle.load();
        let mut next = (*current).clone();
        match event {
            RouteEvent::Added(route) | RouteEvent::Updated(route) => {
                next.set_revision(current.revision().max(route.revision));
                tracing::debug!(kind = %self.kind, route_id = %route.id, "Route applied");
                next.insert(route);
            }
            RouteEvent::Removed(route) => {
                next.set_revision(current.revision().max(route.revision));
                tracing::debug!(kind = %self.kind, route_id = %route.id, "Route removed");
                next.remove(&route.id);
            }
            RouteEvent::Synced { revision } => {
                next.set_revision(current.revision().max(revision));
            }
        }
        self.swap(next);
    }

    fn swap(&self, table: RouteTable) {
        let previous = self.handle.replace(table);
        if let Some(observer) = &self.observer {
            let current = self.handle.load();
            observer.table_swapped(&previous, &current);
        }
    }
}
