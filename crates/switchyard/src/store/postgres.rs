//! Postgres-backed route store shared by every router process.
//!
//! Each mutation runs in one transaction that takes a global advisory lock,
//! draws the next revision, writes the row and issues `pg_notify`. Postgres
//! delivers notifications only on commit, so a subscriber never observes a
//! change before it is durable, and the lock keeps commit order equal to
//! revision order.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

use super::{check_conflicts, merge_update, RouteEvent, RouteStore, RouteWatch};
use crate::error::StoreError;
use crate::route::Route;

/// Notification channel for route changes
const ROUTE_CHANNEL: &str = "switchyard_routes";

/// Advisory lock key serialising route mutations
const ROUTE_LOCK_KEY: i64 = 0x5357_5953_524f_5554;

/// Tables used by the router. Applying it is idempotent.
pub const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS route_revisions;

CREATE TABLE IF NOT EXISTS routes (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    service     TEXT NOT NULL,
    port        INTEGER,
    domain      TEXT,
    route       JSONB NOT NULL,
    revision    BIGINT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    deleted_at  TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS routes_active_port
    ON routes (port) WHERE deleted_at IS NULL AND port IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS routes_active_domain
    ON routes (domain) WHERE deleted_at IS NULL AND domain IS NOT NULL;

CREATE TABLE IF NOT EXISTS tls_certificates (
    domain      TEXT PRIMARY KEY,
    certificate JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

#[derive(Debug, Serialize, Deserialize)]
struct Notification {
    op: Op,
    id: String,
    revision: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Op {
    Added,
    Updated,
    Removed,
}

/// Turns live notifications into watch events.
///
/// Notifications arrive in revision order, but the row read back for one may
/// already carry a later mutation. That later mutation has its own
/// notification still queued, so the stale one is dropped and the row is
/// emitted when its own notification comes up. Events therefore leave in
/// revision order and every committed revision is covered.
#[derive(Debug, Clone, Copy)]
struct LiveCursor {
    /// Highest revision the resync snapshot already contains
    snapshot: u64,
}

impl LiveCursor {
    fn accepts(&self, notification: &Notification) -> bool {
        notification.revision as u64 > self.snapshot
    }

    fn settle(&self, notification: &Notification, row: Option<(Route, bool)>) -> Option<RouteEvent> {
        let (route, deleted) = row?;
        if route.revision > notification.revision as u64 {
            return None;
        }
        Some(match (deleted, notification.op) {
            (true, _) => RouteEvent::Removed(route),
            (false, Op::Added) => RouteEvent::Added(route),
            (false, _) => RouteEvent::Updated(route),
        })
    }
}

/// Route store on a shared Postgres database
#[derive(Clone)]
pub struct PgRouteStore {
    pool: PgPool,
}

impl PgRouteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ROUTE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn next_revision(tx: &mut Transaction<'static, Postgres>) -> Result<u64, StoreError> {
        let revision: i64 = sqlx::query_scalar("SELECT nextval('route_revisions')")
            .fetch_one(&mut **tx)
            .await?;
        Ok(revision as u64)
    }

    async fn active_routes(
        tx: &mut Transaction<'static, Postgres>,
    ) -> Result<Vec<Route>, StoreError> {
        let rows: Vec<Json<Route>> =
            sqlx::query_scalar("SELECT route FROM routes WHERE deleted_at IS NULL")
                .fetch_all(&mut **tx)
                .await?;
        Ok(rows.into_iter().map(|Json(route)| route).collect())
    }

    async fn notify(
        tx: &mut Transaction<'static, Postgres>,
        op: Op,
        route: &Route,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&Notification {
            op,
            id: route.id.clone(),
            revision: route.revision as i64,
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(ROUTE_CHANNEL)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Current active routes and the highest revision, read consistently
    async fn snapshot(&self) -> Result<(Vec<Route>, u64), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        let routes = Self::active_routes(&mut tx).await?;
        let revision: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(revision), 0) FROM routes")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((routes, revision as u64))
    }
}

/// Translate unique index violations raced past the explicit checks
fn map_write_error(err: sqlx::Error, route: &Route) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.constraint() {
            Some("routes_pkey") => return StoreError::DuplicateId(route.id.clone()),
            Some("routes_active_port") => {
                return StoreError::PortConflict(route.port().unwrap_or_default())
            }
            Some("routes_active_domain") => {
                return StoreError::DomainConflict(route.domain().unwrap_or_default().to_string())
            }
            _ => {}
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl RouteStore for PgRouteStore {
    async fn add(&self, mut route: Route) -> Result<Route, StoreError> {
        route.validate()?;
        let mut tx = self.begin().await?;

        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM routes WHERE id = $1 AND deleted_at IS NULL")
                .bind(&route.id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_some() {
            return Err(StoreError::DuplicateId(route.id));
        }
        check_conflicts(&Self::active_routes(&mut tx).await?, &route)?;

        let now = chrono::Utc::now();
        route.created_at = now;
        route.updated_at = now;
        route.revision = Self::next_revision(&mut tx).await?;

        // A removed id leaves a tombstone row; adding it again revives that row
        let written = sqlx::query(
            r#"
            INSERT INTO routes (id, kind, service, port, domain, route, revision, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
               SET kind = EXCLUDED.kind, service = EXCLUDED.service, port = EXCLUDED.port,
                   domain = EXCLUDED.domain, route = EXCLUDED.route, revision = EXCLUDED.revision,
                   created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at,
                   deleted_at = NULL
             WHERE routes.deleted_at IS NOT NULL
            "#,
        )
        .bind(&route.id)
        .bind(route.kind().as_str())
        .bind(&route.service)
        .bind(route.port().map(i32::from))
        .bind(route.domain())
        .bind(Json(&route))
        .bind(route.revision as i64)
        .bind(route.created_at)
        .bind(route.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, &route))?;
        if written.rows_affected() == 0 {
            return Err(StoreError::DuplicateId(route.id));
        }

        Self::notify(&mut tx, Op::Added, &route).await?;
        tx.commit().await?;
        Ok(route)
    }

    async fn update(&self, route: Route) -> Result<Route, StoreError> {
        let mut tx = self.begin().await?;

        let current: Option<Json<Route>> = sqlx::query_scalar(
            "SELECT route FROM routes WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(&route.id)
        .fetch_optional(&mut *tx)
        .await?;
        let Json(current) = current.ok_or_else(|| StoreError::NotFound(route.id.clone()))?;

        let mut route = merge_update(&current, route)?;
        check_conflicts(&Self::active_routes(&mut tx).await?, &route)?;
        route.revision = Self::next_revision(&mut tx).await?;

        sqlx::query(
            r#"
            UPDATE routes
               SET service = $2, port = $3, domain = $4, route = $5, revision = $6, updated_at = $7
             WHERE id = $1
            "#,
        )
        .bind(&route.id)
        .bind(&route.service)
        .bind(route.port().map(i32::from))
        .bind(route.domain())
        .bind(Json(&route))
        .bind(route.revision as i64)
        .bind(route.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, &route))?;

        Self::notify(&mut tx, Op::Updated, &route).await?;
        tx.commit().await?;
        Ok(route)
    }

    async fn remove(&self, id: &str) -> Result<Route, StoreError> {
        let mut tx = self.begin().await?;

        let current: Option<Json<Route>> = sqlx::query_scalar(
            "SELECT route FROM routes WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Json(mut route) = current.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        route.revision = Self::next_revision(&mut tx).await?;

        // Soft delete keeps the payload around for watchers that fetch it later
        sqlx::query(
            "UPDATE routes SET deleted_at = now(), route = $2, revision = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(Json(&route))
        .bind(route.revision as i64)
        .execute(&mut *tx)
        .await?;

        Self::notify(&mut tx, Op::Removed, &route).await?;
        tx.commit().await?;
        Ok(route)
    }

    async fn get(&self, id: &str) -> Result<Route, StoreError> {
        let row: Option<Json<Route>> = sqlx::query_scalar(
            "SELECT route FROM routes WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|Json(route)| route)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Route>, StoreError> {
        let rows: Vec<Json<Route>> = sqlx::query_scalar(
            "SELECT route FROM routes WHERE deleted_at IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(route)| route).collect())
    }

    async fn watch(&self) -> Result<RouteWatch, StoreError> {
        // Listen before the snapshot so nothing committed in between is lost;
        // notifications the snapshot already covers are skipped by revision.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(ROUTE_CHANNEL).await?;
        let (routes, revision) = self.snapshot().await?;

        let resync = stream::iter(
            routes
                .into_iter()
                .map(|route| Ok(RouteEvent::Added(route)))
                .chain(std::iter::once(Ok(RouteEvent::Synced { revision }))),
        );

        let pool = self.pool.clone();
        let cursor = LiveCursor { snapshot: revision };
        let live = stream::unfold(Some((listener, pool)), move |state| async move {
            let (mut listener, pool) = state?;
            loop {
                // try_recv yields None when the connection drops instead of
                // silently reconnecting, which would lose notifications
                let notification = match listener.try_recv().await {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        return Some((
                            Err(StoreError::Watch("notification connection lost".into())),
                            None,
                        ))
                    }
                    Err(e) => return Some((Err(StoreError::Database(e)), None)),
                };

                let parsed: Notification = match serde_json::from_str(notification.payload()) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed route notification: {}", e);
                        continue;
                    }
                };
                if !cursor.accepts(&parsed) {
                    continue;
                }

                let row: Result<Option<(Json<Route>, bool)>, sqlx::Error> = sqlx::query_as(
                    "SELECT route, deleted_at IS NOT NULL FROM routes WHERE id = $1",
                )
                .bind(&parsed.id)
                .fetch_optional(&pool)
                .await;

                let row = match row {
                    Ok(row) => row.map(|(Json(route), deleted)| (route, deleted)),
                    Err(e) => return Some((Err(StoreError::Database(e)), None)),
                };
                if let Some(event) = cursor.settle(&parsed, row) {
                    return Some((Ok(event), Some((listener, pool))));
                }
            }
        });

        Ok(resync.chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload() {
        let json = serde_json::to_string(&Notification {
            op: Op::Removed,
            id: "abc".into(),
            revision: 7,
        })
        .unwrap();
        assert_eq!(json, r#"{"op":"removed","id":"abc","revision":7}"#);
    }

    fn row(id: &str, revision: u64, deleted: bool) -> Option<(Route, bool)> {
        let mut route = Route::http("web", &format!("{id}.example.com"));
        route.id = id.to_string();
        route.revision = revision;
        Some((route, deleted))
    }

    fn notification(op: Op, id: &str, revision: i64) -> Notification {
        Notification {
            op,
            id: id.to_string(),
            revision,
        }
    }

    #[test]
    fn test_interleaved_updates_all_delivered() {
        let cursor = LiveCursor { snapshot: 2 };
        // Rows as they stand once A(3), B(4), A(5) have all committed
        let rows = |id: &str| match id {
            "a" => row("a", 5, false),
            _ => row("b", 4, false),
        };

        let delivered: Vec<(String, u64)> = [
            notification(Op::Updated, "a", 3),
            notification(Op::Updated, "b", 4),
            notification(Op::Updated, "a", 5),
        ]
        .iter()
        .filter(|n| cursor.accepts(n))
        .filter_map(|n| cursor.settle(n, rows(&n.id)))
        .map(|event| {
            let route = event.route().cloned().unwrap();
            (route.id, route.revision)
        })
        .collect();

        assert_eq!(delivered, vec![("b".to_string(), 4), ("a".to_string(), 5)]);
    }

    #[test]
    fn test_snapshot_covers_older_notifications() {
        let cursor = LiveCursor { snapshot: 7 };
        assert!(!cursor.accepts(&notification(Op::Added, "a", 7)));
        assert!(cursor.accepts(&notification(Op::Updated, "a", 8)));
    }

    #[test]
    fn test_settle_maps_tombstones_and_readds() {
        let cursor = LiveCursor { snapshot: 0 };
        let removed = cursor.settle(&notification(Op::Removed, "a", 3), row("a", 3, true));
        assert!(matches!(removed, Some(RouteEvent::Removed(_))));

        let readded = cursor.settle(&notification(Op::Added, "a", 4), row("a", 4, false));
        assert!(matches!(readded, Some(RouteEvent::Added(_))));

        // Removed then re-added before the removal was read back
        let stale = cursor.settle(&notification(Op::Removed, "a", 3), row("a", 4, false));
        assert!(stale.is_none());

        assert!(cursor.settle(&notification(Op::Updated, "gone", 5), None).is_none());
    }

    #[test]
    fn test_schema_declares_partial_indexes() {
        assert!(SCHEMA.contains("routes_active_port"));
        assert!(SCHEMA.contains("routes_active_domain"));
        assert!(SCHEMA.contains("tls_certificates"));
    }
}
