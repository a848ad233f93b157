//! The capability set shared by the HTTP and TCP planes

use async_trait::async_trait;

use crate::error::ListenerError;
use crate::route::{Route, RouteKind};
use crate::store::RouteWatch;

/// A proxy listener: lifecycle, route mutation and read access.
///
/// Mutations go to the shared store; they return once the listener's own table
/// reflects the change (bounded wait), or with the store's error and no state
/// change at all.
#[async_trait]
pub trait Listener: Send + Sync {
    fn kind(&self) -> RouteKind;

    /// Sync the route table and bind sockets
    async fn start(&self) -> Result<(), ListenerError>;

    /// Stop accepting, then drain in-flight connections
    async fn close(&self) -> Result<(), ListenerError>;

    async fn add_route(&self, route: Route) -> Result<Route, ListenerError>;

    async fn update_route(&self, route: Route) -> Result<Route, ListenerError>;

    async fn remove_route(&self, id: &str) -> Result<(), ListenerError>;

    /// Route as stored, by id
    async fn get_route(&self, id: &str) -> Result<Route, ListenerError>;

    /// Routes of this listener's kind as stored
    async fn list_routes(&self) -> Result<Vec<Route>, ListenerError>;

    /// Store changes for this listener's kind, starting with a full resync
    async fn watch(&self) -> Result<RouteWatch, ListenerError>;
}
