use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{check_conflicts, merge_update, RouteEvent, RouteStore, RouteWatch};
use crate::error::StoreError;
use crate::route::Route;

/// Buffered events per subscriber before it is considered lagging
const EVENT_CAPACITY: usize = 1024;

/// In-process route store.
///
/// Mutations are serialised by the writer lock. When backed by a file, the new
/// state is written (temp file + rename) before it is installed and the event
/// is broadcast, so no subscriber ever sees a change that is not durable.
pub struct MemoryRouteStore {
    state: Mutex<State>,
    writer: tokio::sync::Mutex<()>,
    events: broadcast::Sender<RouteEvent>,
    path: Option<PathBuf>,
}

#[derive(Default, Serialize, Deserialize)]
struct State {
    revision: u64,
    routes: BTreeMap<String, Route>,
}

impl MemoryRouteStore {
    /// Volatile store, lost when the process exits
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            writer: tokio::sync::Mutex::new(()),
            events,
            path: None,
        }
    }

    /// Store persisted to a JSON file, loading any existing content
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                State::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            State::default()
        };
        tracing::info!(
            "Loaded {} routes from {} (revision {})",
            state.routes.len(),
            path.display(),
            state.revision
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            state: Mutex::new(state),
            writer: tokio::sync::Mutex::new(()),
            events,
            path: Some(path),
        })
    }

    /// Apply `mutate` to a copy of the state, persist it, then install and notify.
    ///
    /// The state lock is only held to copy and to install; the file write
    /// happens in between with just the writer lock held.
    async fn commit<F>(&self, mutate: F) -> Result<Route, StoreError>
    where
        F: FnOnce(&mut State) -> Result<RouteEvent, StoreError> + Send,
    {
        let _writer = self.writer.lock().await;
        let (next, event) = {
            let state = self.state.lock();
            let mut next = State {
                revision: state.revision,
                routes: state.routes.clone(),
            };
            let event = mutate(&mut next)?;
            (next, event)
        };

        if let Some(path) = &self.path {
            write_atomically(path, serde_json::to_vec_pretty(&next)?).await?;
        }

        let route = event.route().cloned().ok_or_else(|| {
            StoreError::InvalidRoute("mutation produced no route".into())
        })?;
        let mut state = self.state.lock();
        *state = next;
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send(event);
        Ok(route)
    }
}

impl Default for MemoryRouteStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_atomically(path: &Path, bytes: Vec<u8>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn add(&self, mut route: Route) -> Result<Route, StoreError> {
        route.validate()?;
        self.commit(|state| {
            if state.routes.contains_key(&route.id) {
                return Err(StoreError::DuplicateId(route.id.clone()));
            }
            check_conflicts(state.routes.values(), &route)?;

            state.revision += 1;
            let now = chrono::Utc::now();
            route.created_at = now;
            route.updated_at = now;
            route.revision = state.revision;
            state.routes.insert(route.id.clone(), route.clone());
            Ok(RouteEvent::Added(route))
        })
        .await
    }

    async fn update(&self, route: Route) -> Result<Route, StoreError> {
        self.commit(|state| {
            let current = state
                .routes
                .get(&route.id)
                .ok_or_else(|| StoreError::NotFound(route.id.clone()))?;
            let mut route = merge_update(current, route)?;
            check_conflicts(state.routes.values(), &route)?;

            state.revision += 1;
            route.revision = state.revision;
            state.routes.insert(route.id.clone(), route.clone());
            Ok(RouteEvent::Updated(route))
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<Route, StoreError> {
        self.commit(|state| {
            let mut route = state
                .routes
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            state.revision += 1;
            route.revision = state.revision;
            Ok(RouteEvent::Removed(route))
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Route, StoreError> {
        self.state
            .lock()
            .routes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Route>, StoreError> {
        Ok(self.state.lock().routes.values().cloned().collect())
    }

    async fn watch(&self) -> Result<RouteWatch, StoreError> {
        // Subscribe and snapshot under the commit lock so no event falls between
        let (receiver, snapshot, revision) = {
            let state = self.state.lock();
            let receiver = self.events.subscribe();
            let snapshot: Vec<Route> = state.routes.values().cloned().collect();
            (receiver, snapshot, state.revision)
        };

        let resync = stream::iter(
            snapshot
                .into_iter()
                .map(|route| Ok(RouteEvent::Added(route)))
                .chain(std::iter::once(Ok(RouteEvent::Synced { revision }))),
        );

        let live = stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Ok(event) => Some((Ok(event), Some(receiver))),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(StoreError::Watch(format!(
                        "subscriber lagged, {} events missed",
                        missed
                    ))),
                    None,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(resync.chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(watch: &mut RouteWatch) -> RouteEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), watch.next())
            .await
            .expect("watch timed out")
            .expect("watch ended")
            .expect("watch error")
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let store = MemoryRouteStore::new();
        let route = store.add(Route::http("web", "example.com")).await.unwrap();
        assert_eq!(route.revision, 1);

        let fetched = store.get(&route.id).await.unwrap();
        assert_eq!(fetched, route);

        let removed = store.remove(&route.id).await.unwrap();
        assert_eq!(removed.revision, 2);
        assert!(matches!(
            store.get(&route.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id() {
        let store = MemoryRouteStore::new();
        let route = store.add(Route::http("web", "a.example.com")).await.unwrap();

        let mut dup = Route::http("web", "b.example.com");
        dup.id = route.id.clone();
        assert!(matches!(
            store.add(dup).await,
            Err(StoreError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_remove_unknown() {
        let store = MemoryRouteStore::new();
        assert!(matches!(
            store.update(Route::http("web", "example.com")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.remove("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_created_at() {
        let store = MemoryRouteStore::new();
        let route = store.add(Route::tcp("db", Some(3000))).await.unwrap();

        let mut changed = route.clone();
        changed.service = "db-v2".into();
        let updated = store.update(changed).await.unwrap();
        assert_eq!(updated.created_at, route.created_at);
        assert_eq!(updated.service, "db-v2");
        assert!(updated.revision > route.revision);
    }

    #[tokio::test]
    async fn test_failed_mutation_changes_nothing() {
        let store = MemoryRouteStore::new();
        store.add(Route::tcp("a", Some(3000))).await.unwrap();
        assert!(matches!(
            store.add(Route::tcp("b", Some(3000))).await,
            Err(StoreError::PortConflict(3000))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_resync_then_live() {
        let store = MemoryRouteStore::new();
        let a = store.add(Route::http("a", "a.example.com")).await.unwrap();
        let b = store.add(Route::http("b", "b.example.com")).await.unwrap();

        let mut watch = store.watch().await.unwrap();
        let mut seen = vec![];
        for _ in 0..2 {
            match next(&mut watch).await {
                RouteEvent::Added(r) => seen.push(r.id),
                other => panic!("unexpected {:?}", other),
            }
        }
        seen.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(next(&mut watch).await, RouteEvent::Synced { revision: 2 });

        let removed = store.remove(&a.id).await.unwrap();
        assert_eq!(next(&mut watch).await, RouteEvent::Removed(removed));
    }

    #[tokio::test]
    async fn test_removed_id_can_be_added_again() {
        let store = MemoryRouteStore::new();
        let route = store.add(Route::http("web", "again.example.com")).await.unwrap();
        store.remove(&route.id).await.unwrap();

        let mut again = Route::http("web", "again.example.com");
        again.id = route.id.clone();
        let readded = store.add(again).await.unwrap();
        assert_eq!(readded.id, route.id);
        assert!(readded.revision > route.revision);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persisted_writes_stay_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        let store = std::sync::Arc::new(MemoryRouteStore::open(&path).unwrap());
        let mut watch = store.watch().await.unwrap();
        assert_eq!(next(&mut watch).await, RouteEvent::Synced { revision: 0 });

        let writes = (0..16u16).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.add(Route::tcp("db", Some(4000 + i))).await })
        });
        for write in futures_util::future::join_all(writes).await {
            write.unwrap().unwrap();
        }

        // Events leave in revision order and the file holds the final state
        for expected in 1..=16 {
            assert_eq!(next(&mut watch).await.route().unwrap().revision, expected);
        }
        let reopened = MemoryRouteStore::open(&path).unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");

        let id = {
            let store = MemoryRouteStore::open(&path).unwrap();
            store.add(Route::tcp("db", Some(3100))).await.unwrap().id
        };

        let reopened = MemoryRouteStore::open(&path).unwrap();
        let route = reopened.get(&id).await.unwrap();
        assert_eq!(route.port(), Some(3100));

        // Revisions keep counting from where they left off
        let next = reopened.add(Route::tcp("db2", Some(3101))).await.unwrap();
        assert_eq!(next.revision, 2);
    }
}
