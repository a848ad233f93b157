//! Route store abstraction
//!
//! The store is the single source of truth for routes across every router
//! process. Listeners consume [`RouteStore::watch`], which always starts with a
//! full resync (one `Added` per current route, then `Synced`) before switching
//! to live events, so a fresh or recovering subscriber converges without a
//! separate bulk load.

mod memory;
mod postgres;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StoreError;
use crate::route::Route;

pub use memory::MemoryRouteStore;
pub use postgres::{PgRouteStore, SCHEMA};

/// A change notification from the store
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEvent {
    Added(Route),
    Updated(Route),
    Removed(Route),
    /// End of the initial resync; everything after this is live
    Synced { revision: u64 },
}

impl RouteEvent {
    pub fn revision(&self) -> u64 {
        match self {
            RouteEvent::Added(r) | RouteEvent::Updated(r) | RouteEvent::Removed(r) => r.revision,
            RouteEvent::Synced { revision } => *revision,
        }
    }

    pub fn route(&self) -> Option<&Route> {
        match self {
            RouteEvent::Added(r) | RouteEvent::Updated(r) | RouteEvent::Removed(r) => Some(r),
            RouteEvent::Synced { .. } => None,
        }
    }
}

/// Resync-then-live event stream. An `Err` item or the end of the stream means
/// the subscription is gone and the subscriber must call `watch` again.
pub type RouteWatch = BoxStream<'static, Result<RouteEvent, StoreError>>;

/// Persistent, shared table of routes with change notification
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Insert a new route. Fails with `DuplicateId`, `PortConflict` or
    /// `DomainConflict`. Returns the route as stored (timestamps and revision set).
    async fn add(&self, route: Route) -> Result<Route, StoreError>;

    /// Replace an existing route, keeping its id and creation time
    async fn update(&self, route: Route) -> Result<Route, StoreError>;

    /// Delete a route, returning its final state
    async fn remove(&self, id: &str) -> Result<Route, StoreError>;

    async fn get(&self, id: &str) -> Result<Route, StoreError>;

    async fn list(&self) -> Result<Vec<Route>, StoreError>;

    /// Subscribe to changes, starting with a full resync
    async fn watch(&self) -> Result<RouteWatch, StoreError>;
}

/// Enforce the uniqueness rules of `candidate` against the active routes.
///
/// One active TCP route per port; one HTTP route per exact domain. An exact
/// domain and a wildcard covering it may coexist since they are distinct keys.
pub(crate) fn check_conflicts<'a>(
    existing: impl IntoIterator<Item = &'a Route>,
    candidate: &Route,
) -> Result<(), StoreError> {
    for other in existing {
        if other.id == candidate.id {
            continue;
        }
        if let (Some(a), Some(b)) = (other.port(), candidate.port()) {
            if a == b {
                return Err(StoreError::PortConflict(b));
            }
        }
        if let (Some(a), Some(b)) = (other.domain(), candidate.domain()) {
            if a == b {
                return Err(StoreError::DomainConflict(b.to_string()));
            }
        }
    }
    Ok(())
}

/// Carry identity fields over from the stored route on update
pub(crate) fn merge_update(current: &Route, mut update: Route) -> Result<Route, StoreError> {
    if current.kind() != update.kind() {
        return Err(StoreError::InvalidRoute(format!(
            "cannot change route {} from {} to {}",
            current.id,
            current.kind(),
            update.kind()
        )));
    }
    update.validate()?;
    update.created_at = current.created_at;
    update.updated_at = chrono::Utc::now();
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(mut route: Route) -> Route {
        route.validate().unwrap();
        route
    }

    #[test]
    fn test_port_conflict() {
        let a = valid(Route::tcp("a", Some(3000)));
        let b = valid(Route::tcp("b", Some(3000)));
        assert!(matches!(
            check_conflicts([&a], &b),
            Err(StoreError::PortConflict(3000))
        ));
        // A route never conflicts with itself
        assert!(check_conflicts([&a], &a).is_ok());
    }

    #[test]
    fn test_exact_and_wildcard_coexist() {
        let exact = valid(Route::http("a", "foo.example.com"));
        let wildcard = valid(Route::http("b", "*.example.com"));
        assert!(check_conflicts([&exact], &wildcard).is_ok());

        let dup = valid(Route::http("c", "FOO.example.com"));
        assert!(matches!(
            check_conflicts([&exact, &wildcard], &dup),
            Err(StoreError::DomainConflict(d)) if d == "foo.example.com"
        ));
    }

    #[test]
    fn test_merge_update_rejects_kind_change() {
        let current = valid(Route::tcp("a", Some(3000)));
        let mut update = Route::http("a", "example.com");
        update.id = current.id.clone();
        assert!(matches!(
            merge_update(&current, update),
            Err(StoreError::InvalidRoute(_))
        ));
    }
}
