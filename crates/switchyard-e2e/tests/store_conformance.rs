//! Behavior every route store must share.
//!
//! Runs against the in-process store always, and against Postgres when
//! `SWITCHYARD_TEST_DATABASE_URL` points at a scratch database.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::StreamExt;
use sqlx::postgres::PgPoolOptions;
use switchyard::store::{MemoryRouteStore, PgRouteStore, RouteEvent};
use switchyard::{Route, RouteStore, RouteWatch, StoreError};
use switchyard_e2e::init_test;

const DATABASE_URL_VAR: &str = "SWITCHYARD_TEST_DATABASE_URL";

async fn postgres_store() -> Option<PgRouteStore> {
    let Ok(url) = std::env::var(DATABASE_URL_VAR) else {
        eprintln!("{} not set, skipping Postgres store checks", DATABASE_URL_VAR);
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    let store = PgRouteStore::new(pool);
    store.ensure_schema().await.expect("Failed to create schema");
    Some(store)
}

/// Domain no other test run will claim, so a shared database stays usable
fn unique_domain(label: &str) -> String {
    format!("{}-{}.conformance.test", label, uuid::Uuid::new_v4().simple())
}

/// Open a watch and consume its resync
async fn live_watch(store: &dyn RouteStore) -> RouteWatch {
    let mut watch = store.watch().await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await
            .expect("resync did not finish")
            .expect("watch ended during resync")
            .unwrap();
        if matches!(event, RouteEvent::Synced { .. }) {
            return watch;
        }
    }
}

async fn removed_id_can_be_added_again(store: &dyn RouteStore) {
    let route = store
        .add(Route::http("web", unique_domain("readd")))
        .await
        .unwrap();
    store.remove(&route.id).await.unwrap();
    assert!(matches!(store.get(&route.id).await, Err(StoreError::NotFound(_))));

    let mut again = Route::http("web-v2", route.domain().unwrap());
    again.id = route.id.clone();
    let readded = store.add(again).await.expect("re-adding a removed id");
    assert_eq!(readded.id, route.id);
    assert_eq!(readded.service, "web-v2");
    assert!(readded.revision > route.revision);

    let stored = store.get(&route.id).await.unwrap();
    assert_eq!(stored.service, "web-v2");
    let listed = store.list().await.unwrap();
    assert_eq!(listed.iter().filter(|r| r.id == route.id).count(), 1);

    // A live id is still a duplicate
    let mut duplicate = Route::http("web", unique_domain("dup"));
    duplicate.id = route.id.clone();
    assert!(matches!(store.add(duplicate).await, Err(StoreError::DuplicateId(_))));

    store.remove(&route.id).await.unwrap();
}

async fn interleaved_updates_reach_watchers(store: &dyn RouteStore) {
    let mut watch = live_watch(store).await;

    let a = store.add(Route::http("a0", unique_domain("a"))).await.unwrap();
    let b = store.add(Route::http("b0", unique_domain("b"))).await.unwrap();

    let mut next = a.clone();
    next.service = "a1".into();
    store.update(next).await.unwrap();
    let mut next = b.clone();
    next.service = "b1".into();
    let b_final = store.update(next).await.unwrap();
    let mut next = a.clone();
    next.service = "a2".into();
    let a_final = store.update(next).await.unwrap();

    let ours: HashSet<String> = [a.id.clone(), b.id.clone()].into();
    let mut seen = Vec::new();
    let mut last_revision = 0;
    while !seen.iter().any(|(id, service, _)| *id == a.id && service == "a2")
        || !seen.iter().any(|(id, service, _)| *id == b.id && service == "b1")
    {
        let event = tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await
            .unwrap_or_else(|_| panic!("watch stalled after {:?}", seen))
            .expect("watch ended")
            .unwrap();
        let Some(route) = event.route() else { continue };
        if !ours.contains(&route.id) {
            continue;
        }
        assert!(route.revision > last_revision, "events out of revision order: {:?}", seen);
        last_revision = route.revision;
        seen.push((route.id.clone(), route.service.clone(), route.revision));
    }

    assert_eq!(last_revision, a_final.revision.max(b_final.revision));
    // A slow watcher may skip intermediate states, never the final ones
    let last_of = |id: &str| {
        seen.iter()
            .rev()
            .find(|(seen_id, _, _)| seen_id == id)
            .map(|(_, service, revision)| (service.clone(), *revision))
    };
    assert_eq!(last_of(&a.id), Some(("a2".to_string(), a_final.revision)));
    assert_eq!(last_of(&b.id), Some(("b1".to_string(), b_final.revision)));

    store.remove(&a.id).await.unwrap();
    store.remove(&b.id).await.unwrap();
}

#[tokio::test]
async fn test_memory_store_conformance() {
    init_test();
    let store = MemoryRouteStore::new();
    removed_id_can_be_added_again(&store).await;
    interleaved_updates_reach_watchers(&store).await;
}

#[tokio::test]
async fn test_postgres_store_conformance() {
    init_test();
    let Some(store) = postgres_store().await else {
        return;
    };
    removed_id_can_be_added_again(&store).await;
    interleaved_updates_reach_watchers(&store).await;
}
