//! Measurement document store.
//!
//! Records are ordered by `createdAt`, ties broken by insertion sequence, so
//! "latest" is always a single well-defined record. There is no update path.

use crate::types::{Measurement, MeasurementKind, NewMeasurement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("corrupt document {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("unsupported store url '{0}'")]
    UnsupportedUrl(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            other => StoreError::Database(other),
        }
    }
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Append a record, assigning its id and timestamps.
    async fn insert(&self, new: NewMeasurement) -> Result<Measurement, StoreError>;

    /// Every record, most recent first.
    async fn list_newest_first(&self) -> Result<Vec<Measurement>, StoreError>;

    /// Atomically remove the most recent record and return it.
    async fn delete_latest(&self) -> Result<Option<Measurement>, StoreError>;

    /// Drop every record. Administrative use only; not exposed over HTTP.
    async fn clear(&self) -> Result<u64, StoreError>;
}

pub type SharedStore = Arc<dyn MeasurementStore>;

/// Source of `createdAt` stamps.
pub type Clock = fn() -> DateTime<Utc>;

/// Open the store named by a connection string.
///
/// SQLite stores connect lazily: an unreachable database surfaces as
/// [`StoreError::Unavailable`] on first use, not here.
pub async fn connect(url: &str) -> Result<SharedStore, StoreError> {
    if url.starts_with("memory:") {
        info!("Using in-process measurement store");
        return Ok(Arc::new(MemoryStore::default()));
    }
    if url.starts_with("sqlite:") {
        let store = SqliteStore::connect(url).await?;
        return Ok(Arc::new(store));
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}

fn assign(new: NewMeasurement, clock: Clock) -> Measurement {
    let now = clock();
    Measurement {
        id: Uuid::new_v4().to_string(),
        kind: new.kind,
        geojson: new.geojson,
        value: new.value,
        unit: new.unit,
        created_at: now,
        updated_at: now,
    }
}

/// Process-local store.
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
    clock: Clock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            clock: Utc::now,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    next_seq: u64,
    // (sequence, record) in insertion order
    records: Vec<(u64, Measurement)>,
}

impl MemoryStore {
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            ..Self::default()
        }
    }

    fn newest_index(records: &[(u64, Measurement)]) -> Option<usize> {
        records
            .iter()
            .enumerate()
            .max_by_key(|(_, (seq, m))| (m.created_at, *seq))
            .map(|(i, _)| i)
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn insert(&self, new: NewMeasurement) -> Result<Measurement, StoreError> {
        let record = assign(new, self.clock);
        let mut state = self.inner.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.push((seq, record.clone()));
        Ok(record)
    }

    async fn list_newest_first(&self) -> Result<Vec<Measurement>, StoreError> {
        let state = self.inner.lock().await;
        let mut sorted: Vec<&(u64, Measurement)> = state.records.iter().collect();
        sorted.sort_by(|(sa, a), (sb, b)| (b.created_at, *sb).cmp(&(a.created_at, *sa)));
        Ok(sorted.into_iter().map(|(_, m)| m.clone()).collect())
    }

    async fn delete_latest(&self) -> Result<Option<Measurement>, StoreError> {
        let mut state = self.inner.lock().await;
        Ok(Self::newest_index(&state.records).map(|i| state.records.remove(i).1))
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let mut state = self.inner.lock().await;
        let n = state.records.len() as u64;
        state.records.clear();
        Ok(n)
    }
}

/// SQLite-backed document table. The GeoJSON payload is kept as JSON text.
pub struct SqliteStore {
    pool: SqlitePool,
    schema: OnceCell<()>,
    clock: Clock,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS measurements (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    kind       TEXT NOT NULL CHECK (kind IN ('LineString', 'Polygon')),
    geojson    TEXT NOT NULL,
    value      REAL NOT NULL CHECK (value >= 0),
    unit       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS measurements_created_at ON measurements (created_at DESC, seq DESC);
"#;

const COLUMNS: &str = "id, kind, geojson, value, unit, created_at, updated_at";

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5));
        if url.contains(":memory:") {
            // each connection would get its own empty database; keep exactly one alive
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_lazy_with(options);
        info!("Measurement store configured at {}", url);
        Ok(Self {
            pool,
            schema: OnceCell::new(),
            clock: Utc::now,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The pool, once the schema exists. Retried on every call until it succeeds.
    async fn ready(&self) -> Result<&SqlitePool, StoreError> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::raw_sql(SCHEMA).execute(&self.pool).await.map_err(|e| {
                    warn!("Measurement store unreachable: {}", e);
                    StoreError::Unavailable(e.to_string())
                })?;
                info!("Measurement store schema ready");
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(&self.pool)
    }

    fn from_row(row: &SqliteRow) -> Result<Measurement, StoreError> {
        let id: String = row.try_get("id")?;
        let kind: String = row.try_get("kind")?;
        let geojson: String = row.try_get("geojson")?;
        let kind = MeasurementKind::from_str(&kind).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        let geojson = serde_json::from_str(&geojson).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Measurement {
            id,
            kind,
            geojson,
            value: row.try_get("value")?,
            unit: row.try_get("unit")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl MeasurementStore for SqliteStore {
    async fn insert(&self, new: NewMeasurement) -> Result<Measurement, StoreError> {
        let pool = self.ready().await?;
        let record = assign(new, self.clock);
        sqlx::query(
            "INSERT INTO measurements (id, kind, geojson, value, unit, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(record.geojson.to_string())
        .bind(record.value)
        .bind(&record.unit)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(pool)
        .await?;
        Ok(record)
    }

    async fn list_newest_first(&self) -> Result<Vec<Measurement>, StoreError> {
        let pool = self.ready().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM measurements ORDER BY created_at DESC, seq DESC"
        ))
        .fetch_all(pool)
        .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn delete_latest(&self) -> Result<Option<Measurement>, StoreError> {
        let pool = self.ready().await?;
        let row = sqlx::query(&format!(
            "DELETE FROM measurements WHERE seq = \
             (SELECT seq FROM measurements ORDER BY created_at DESC, seq DESC LIMIT 1) \
             RETURNING {COLUMNS}"
        ))
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let pool = self.ready().await?;
        let result = sqlx::query("DELETE FROM measurements").execute(pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(value: f64) -> NewMeasurement {
        NewMeasurement {
            kind: MeasurementKind::LineString,
            geojson: json!({"type": "Feature", "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]}}),
            value,
            unit: "m".into(),
        }
    }

    async fn exercise(store: SharedStore) {
        assert!(store.delete_latest().await.unwrap().is_none());

        let a = store.insert(line(1.0)).await.unwrap();
        let b = store.insert(line(2.0)).await.unwrap();
        let c = store.insert(line(3.0)).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.created_at, a.updated_at);

        let listed = store.list_newest_first().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str(), b.id.as_str(), a.id.as_str()]);
        assert_eq!(listed[2].geojson, a.geojson);

        let removed = store.delete_latest().await.unwrap().unwrap();
        assert_eq!(removed.id, c.id);
        assert_eq!(store.list_newest_first().await.unwrap().len(), 2);

        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.list_newest_first().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_orders_and_deletes_latest() {
        exercise(connect("memory://").await.unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_store_orders_and_deletes_latest() {
        exercise(connect("sqlite::memory:").await.unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("m.db").display());
        {
            let store = connect(&url).await.unwrap();
            store.insert(line(5.0)).await.unwrap();
        }
        let store = connect(&url).await.unwrap();
        let listed = store.list_newest_first().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value, 5.0);
    }

    fn frozen() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    async fn ties_break_by_insertion(store: SharedStore) {
        let first = store.insert(line(1.0)).await.unwrap();
        let second = store.insert(line(2.0)).await.unwrap();
        assert_eq!(first.created_at, second.created_at);

        let listed = store.list_newest_first().await.unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        let removed = store.delete_latest().await.unwrap().unwrap();
        assert_eq!(removed.id, second.id);
        let listed = store.list_newest_first().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, first.id);
    }

    #[tokio::test]
    async fn memory_store_breaks_timestamp_ties_by_insertion_order() {
        ties_break_by_insertion(Arc::new(MemoryStore::with_clock(frozen))).await;
    }

    #[tokio::test]
    async fn sqlite_store_breaks_timestamp_ties_by_insertion_order() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap().with_clock(frozen);
        ties_break_by_insertion(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn unreachable_sqlite_opens_lazily_and_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("missing/sub/m.db").display());
        let store = connect(&url).await.unwrap();
        assert!(matches!(
            store.list_newest_first().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.insert(line(1.0)).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        assert!(matches!(
            connect("mongodb://localhost").await,
            Err(StoreError::UnsupportedUrl(_))
        ));
    }
}
