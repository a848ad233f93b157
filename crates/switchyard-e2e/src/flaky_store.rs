//! Route store wrapper that can sever and refuse watch subscriptions
//!
//! Mutations always reach the wrapped in-process store; only the watch side is
//! faulted, which is what a listener sees when its store connection drops.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use switchyard::store::MemoryRouteStore;
use switchyard::{Route, RouteStore, RouteWatch, StoreError};

pub struct FlakyRouteStore {
    inner: MemoryRouteStore,
    /// Cancelled to cut every open watch stream
    sever: Mutex<CancellationToken>,
    available: AtomicBool,
    watch_opens: AtomicUsize,
}

impl FlakyRouteStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryRouteStore::new(),
            sever: Mutex::new(CancellationToken::new()),
            available: AtomicBool::new(true),
            watch_opens: AtomicUsize::new(0),
        }
    }

    /// End every open watch with an error
    pub fn disconnect_watchers(&self) {
        let mut sever = self.sever.lock();
        sever.cancel();
        *sever = CancellationToken::new();
    }

    /// While unavailable, `watch` fails immediately
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful `watch` calls so far
    pub fn watch_opens(&self) -> usize {
        self.watch_opens.load(Ordering::SeqCst)
    }
}

impl Default for FlakyRouteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteStore for FlakyRouteStore {
    async fn add(&self, route: Route) -> Result<Route, StoreError> {
        self.inner.add(route).await
    }

    async fn update(&self, route: Route) -> Result<Route, StoreError> {
        self.inner.update(route).await
    }

    async fn remove(&self, id: &str) -> Result<Route, StoreError> {
        self.inner.remove(id).await
    }

    async fn get(&self, id: &str) -> Result<Route, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Route>, StoreError> {
        self.inner.list().await
    }

    async fn watch(&self) -> Result<RouteWatch, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        let sever = self.sever.lock().clone();
        let watch = self.inner.watch().await?;
        self.watch_opens.fetch_add(1, Ordering::SeqCst);

        let severed = stream::once(async { Err(StoreError::Watch("connection severed".into())) });
        Ok(watch
            .take_until(sever.cancelled_owned())
            .chain(severed)
            .boxed())
    }
}
