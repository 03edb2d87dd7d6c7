//! Telemetry sources for the routing planner
//!
//! The planner reads a [`TelemetryBreakdown`] per route on every bandit
//! planning call. Two sources are provided: an in-memory snapshot that is
//! swapped wholesale, and a SQLite store that aggregates individual runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::types::TelemetryBreakdown;
use crate::error::{Error, Result};

/// Source of per-route telemetry
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Breakdowns for the given routes; routes without history are omitted
    async fn breakdowns(&self, route_ids: &[String]) -> Result<Vec<TelemetryBreakdown>>;
}

/// Shared, immutable-per-read telemetry snapshot
///
/// Readers clone what they need under a short read lock; `replace` swaps
/// the whole map so a reader never sees half of an update.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    inner: Arc<RwLock<Arc<HashMap<String, TelemetryBreakdown>>>>,
}

impl TelemetrySnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a snapshot from a list of breakdowns
    pub fn from_breakdowns(breakdowns: Vec<TelemetryBreakdown>) -> Self {
        let snapshot = Self::new();
        snapshot.replace(breakdowns);
        snapshot
    }

    /// Replace the whole snapshot
    pub fn replace(&self, breakdowns: Vec<TelemetryBreakdown>) {
        let map: HashMap<String, TelemetryBreakdown> = breakdowns
            .into_iter()
            .map(|b| (b.route_id.clone(), b))
            .collect();
        let count = map.len();
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| {
            warn!("Telemetry snapshot lock was poisoned, recovering");
            self.inner.clear_poison();
            poisoned.into_inner()
        });
        *guard = Arc::new(map);
        debug!(routes = count, "Telemetry snapshot replaced");
    }

    /// Number of routes with telemetry
    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Arc<HashMap<String, TelemetryBreakdown>> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| {
            warn!("Telemetry snapshot lock was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(&*guard)
    }
}

#[async_trait]
impl TelemetrySource for TelemetrySnapshot {
    async fn breakdowns(&self, route_ids: &[String]) -> Result<Vec<TelemetryBreakdown>> {
        let current = self.current();
        Ok(route_ids
            .iter()
            .filter_map(|id| current.get(id).cloned())
            .collect())
    }
}

/// SQL to create the route telemetry table
pub const CREATE_ROUTE_TELEMETRY_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS route_telemetry (
    route_id TEXT PRIMARY KEY NOT NULL,
    run_count INTEGER NOT NULL DEFAULT 0,
    successes INTEGER NOT NULL DEFAULT 0,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0.0,
    latency_sum_ms REAL NOT NULL DEFAULT 0.0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

/// One observed run of a route
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub route_id: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub success: bool,
}

impl RunRecord {
    /// Create a run record with zero tokens and cost
    pub fn new(route_id: impl Into<String>, success: bool) -> Self {
        Self {
            route_id: route_id.into(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            latency_ms: 0.0,
            success,
        }
    }

    /// Set token volume
    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// Set cost
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    /// Set latency
    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// SQLite-backed telemetry aggregate
pub struct SqliteTelemetryStore {
    pool: SqlitePool,
}

impl SqliteTelemetryStore {
    /// Create a new store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new store and connect to the database
    pub async fn connect(database_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", database_path.display());

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_ROUTE_TELEMETRY_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        info!("Route telemetry table initialized");
        Ok(())
    }

    /// Fold one run into the route's aggregate
    pub async fn record_run(&self, run: &RunRecord) -> Result<()> {
        if run.cost_usd < 0.0 || run.latency_ms < 0.0 {
            return Err(Error::ValidationError(format!(
                "run for route '{}' has negative cost or latency",
                run.route_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO route_telemetry (
                route_id, run_count, successes, tokens_in, tokens_out,
                cost_usd, latency_sum_ms, updated_at
            ) VALUES (?, 1, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(route_id) DO UPDATE SET
                run_count = run_count + 1,
                successes = successes + excluded.successes,
                tokens_in = tokens_in + excluded.tokens_in,
                tokens_out = tokens_out + excluded.tokens_out,
                cost_usd = cost_usd + excluded.cost_usd,
                latency_sum_ms = latency_sum_ms + excluded.latency_sum_ms,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&run.route_id)
        .bind(i64::from(run.success))
        .bind(run.tokens_in as i64)
        .bind(run.tokens_out as i64)
        .bind(run.cost_usd)
        .bind(run.latency_ms)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        debug!(route_id = %run.route_id, success = run.success, "Recorded route run");
        Ok(())
    }

    /// Fold a batch of runs atomically
    pub async fn record_runs(&self, runs: &[RunRecord]) -> Result<()> {
        if runs.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        for run in runs {
            sqlx::query(
                r#"
                INSERT INTO route_telemetry (
                    route_id, run_count, successes, tokens_in, tokens_out,
                    cost_usd, latency_sum_ms, updated_at
                ) VALUES (?, 1, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(route_id) DO UPDATE SET
                    run_count = run_count + 1,
                    successes = successes + excluded.successes,
                    tokens_in = tokens_in + excluded.tokens_in,
                    tokens_out = tokens_out + excluded.tokens_out,
                    cost_usd = cost_usd + excluded.cost_usd,
                    latency_sum_ms = latency_sum_ms + excluded.latency_sum_ms,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(&run.route_id)
            .bind(i64::from(run.success))
            .bind(run.tokens_in as i64)
            .bind(run.tokens_out as i64)
            .bind(run.cost_usd)
            .bind(run.latency_ms)
            .execute(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        }

        tx.commit().await.map_err(Error::DatabaseError)?;

        info!(count = runs.len(), "Recorded batch of route runs");
        Ok(())
    }

    /// Load every route's breakdown
    pub async fn load_all(&self) -> Result<Vec<TelemetryBreakdown>> {
        let rows = sqlx::query(
            r#"
            SELECT route_id, run_count, successes, tokens_in, tokens_out,
                   cost_usd, latency_sum_ms
            FROM route_telemetry
            ORDER BY route_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows.iter().map(breakdown_from_row).collect())
    }

    /// Delete one route's history
    pub async fn clear_route(&self, route_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM route_telemetry WHERE route_id = ?")
            .bind(route_id)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let deleted = result.rows_affected();
        info!(route_id = %route_id, deleted = deleted, "Deleted route telemetry");
        Ok(deleted)
    }

    /// Clear all telemetry
    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM route_telemetry")
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let deleted = result.rows_affected();
        warn!(deleted = deleted, "Cleared all route telemetry");
        Ok(deleted)
    }

    /// Summary across all routes
    pub async fn summary(&self) -> Result<TelemetrySummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as route_count,
                SUM(run_count) as total_runs,
                SUM(successes) as total_successes,
                SUM(cost_usd) as total_cost
            FROM route_telemetry
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(TelemetrySummary {
            route_count: row.get::<i64, _>("route_count") as u64,
            total_runs: row.get::<Option<i64>, _>("total_runs").unwrap_or(0) as u64,
            total_successes: row.get::<Option<i64>, _>("total_successes").unwrap_or(0) as u64,
            total_cost_usd: row.get::<Option<f64>, _>("total_cost").unwrap_or(0.0),
        })
    }
}

fn breakdown_from_row(row: &sqlx::sqlite::SqliteRow) -> TelemetryBreakdown {
    let run_count = row.get::<i64, _>("run_count").max(0) as u64;
    let successes = row.get::<i64, _>("successes").max(0) as u64;
    let latency_sum: f64 = row.get("latency_sum_ms");

    let (success_rate, avg_latency_ms) = if run_count == 0 {
        (0.0, 0.0)
    } else {
        (
            successes as f64 / run_count as f64,
            latency_sum / run_count as f64,
        )
    };

    TelemetryBreakdown {
        route_id: row.get("route_id"),
        run_count,
        tokens_in: row.get::<i64, _>("tokens_in").max(0) as u64,
        tokens_out: row.get::<i64, _>("tokens_out").max(0) as u64,
        cost_usd: row.get("cost_usd"),
        avg_latency_ms,
        success_rate,
    }
}

#[async_trait]
impl TelemetrySource for SqliteTelemetryStore {
    async fn breakdowns(&self, route_ids: &[String]) -> Result<Vec<TelemetryBreakdown>> {
        if route_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; route_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT route_id, run_count, successes, tokens_in, tokens_out,
                   cost_usd, latency_sum_ms
            FROM route_telemetry
            WHERE route_id IN ({})
            ORDER BY route_id
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for id in route_ids {
            query = query.bind(id);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(rows.iter().map(breakdown_from_row).collect())
    }
}

/// Summary of stored telemetry
#[derive(Debug, Clone)]
pub struct TelemetrySummary {
    pub route_count: u64,
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_cost_usd: f64,
}

impl TelemetrySummary {
    /// Overall success rate
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            return 0.0;
        }
        self.total_successes as f64 / self.total_runs as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    async fn create_test_store() -> (SqliteTelemetryStore, TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_telemetry.db");

        let store = SqliteTelemetryStore::connect(&db_path).await.unwrap();
        store.init().await.unwrap();

        (store, dir)
    }

    #[tokio::test]
    async fn test_snapshot_returns_requested_routes_only() {
        let snapshot = TelemetrySnapshot::from_breakdowns(vec![
            TelemetryBreakdown::new("a").with_runs(10, 0.9),
            TelemetryBreakdown::new("b").with_runs(3, 0.5),
        ]);

        let result = snapshot
            .breakdowns(&["b".to_string(), "missing".to_string()])
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].route_id, "b");
    }

    #[tokio::test]
    async fn test_snapshot_replace_is_wholesale() {
        let snapshot = TelemetrySnapshot::from_breakdowns(vec![TelemetryBreakdown::new("a")]);
        let reader = snapshot.clone();

        snapshot.replace(vec![TelemetryBreakdown::new("b")]);

        assert_eq!(reader.len(), 1);
        let ids = ["a".to_string(), "b".to_string()];
        let result = reader.breakdowns(&ids).await.unwrap();
        assert_eq!(result[0].route_id, "b");
    }

    #[test]
    fn test_snapshot_replace_survives_poisoned_lock() {
        let snapshot = TelemetrySnapshot::from_breakdowns(vec![TelemetryBreakdown::new("a")]);

        let inner = Arc::clone(&snapshot.inner);
        let result = std::thread::spawn(move || {
            let _guard = inner.write().unwrap();
            panic!("writer panicked");
        })
        .join();
        assert!(result.is_err());

        snapshot.replace(vec![
            TelemetryBreakdown::new("b"),
            TelemetryBreakdown::new("c"),
        ]);
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.inner.is_poisoned());
    }

    #[tokio::test]
    async fn test_record_and_aggregate_runs() {
        let (store, _temp) = create_test_store().await;

        store
            .record_run(
                &RunRecord::new("route-a", true)
                    .with_tokens(1000, 500)
                    .with_cost(0.02)
                    .with_latency(400.0),
            )
            .await
            .unwrap();
        store
            .record_run(
                &RunRecord::new("route-a", false)
                    .with_tokens(1000, 0)
                    .with_cost(0.01)
                    .with_latency(800.0),
            )
            .await
            .unwrap();

        let result = store.breakdowns(&["route-a".to_string()]).await.unwrap();
        assert_eq!(result.len(), 1);

        let b = &result[0];
        assert_eq!(b.run_count, 2);
        assert_eq!(b.tokens_in, 2000);
        assert_eq!(b.tokens_out, 500);
        assert!((b.success_rate - 0.5).abs() < 1e-9);
        assert!((b.avg_latency_ms - 600.0).abs() < 1e-9);
        assert!((b.cost_usd - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_batch_and_summary() {
        let (store, _temp) = create_test_store().await;

        store
            .record_runs(&[
                RunRecord::new("route-a", true).with_cost(0.1),
                RunRecord::new("route-b", true).with_cost(0.2),
                RunRecord::new("route-b", false).with_cost(0.3),
            ])
            .await
            .unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.route_count, 2);
        assert_eq!(summary.total_runs, 3);
        assert_eq!(summary.total_successes, 2);
        assert!((summary.total_cost_usd - 0.6).abs() < 1e-9);

        let all = store.load_all().await.unwrap();
        assert_eq!(all[0].route_id, "route-a");
        assert_eq!(all[1].run_count, 2);
    }

    #[tokio::test]
    async fn test_negative_cost_rejected() {
        let (store, _temp) = create_test_store().await;
        let err = store
            .record_run(&RunRecord::new("route-a", true).with_cost(-1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _temp) = create_test_store().await;
        store
            .record_runs(&[
                RunRecord::new("route-a", true),
                RunRecord::new("route-b", true),
            ])
            .await
            .unwrap();

        assert_eq!(store.clear_route("route-a").await.unwrap(), 1);
        assert_eq!(store.clear_all().await.unwrap(), 1);
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
