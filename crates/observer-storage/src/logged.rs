use crate::error::{Result, StorageError};
use crate::memory::{fold_counter, render_listing};
use crate::{ensure_active, StorageEngine};
use async_trait::async_trait;
use chrono::Utc;
use observer_common::types::{Metric, MetricKind, MetricPayload};
use rusqlite::{
    params, Connection, InterruptHandle, OptionalExtension, Transaction, TransactionBehavior,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metric_names (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metric_id INTEGER NOT NULL REFERENCES metric_names(id),
    type TEXT NOT NULL CHECK (type IN ('gauge', 'counter')),
    value REAL,
    delta TEXT,
    created_at INTEGER NOT NULL,
    CHECK ((type = 'gauge' AND value IS NOT NULL AND delta IS NULL)
        OR (type = 'counter' AND delta IS NOT NULL AND value IS NULL))
);
CREATE INDEX IF NOT EXISTS idx_metrics_metric_type_time
    ON metrics(metric_id, type, created_at);
";

/// Default time spent retrying the first connection.
pub const DEFAULT_CONNECT_BUDGET: Duration = Duration::from_secs(12);

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Append-only relational log of metric writes on SQLite.
///
/// Every write inserts a row; counters store the already-folded cumulative
/// total (as text), so the current value is always the newest row for the
/// `(name, type)` pair.
pub struct LoggedStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    /// Id of the call currently holding the connection. Cleared before the
    /// connection is released, and only read under this lock.
    active: Arc<Mutex<Option<u64>>>,
    next_call: AtomicU64,
    location: String,
}

/// Where a DSN points.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Memory,
    File(String),
}

fn parse_dsn(dsn: &str) -> Result<Location> {
    let dsn = dsn.trim();
    let rest = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .unwrap_or(dsn);
    if rest.contains("://") {
        return Err(StorageError::Connection(format!(
            "unsupported database DSN '{dsn}', expected a SQLite path"
        )));
    }
    let path = rest.split('?').next().unwrap_or(rest);
    match path {
        "" => Err(StorageError::Connection("empty database DSN".to_string())),
        ":memory:" => Ok(Location::Memory),
        path => Ok(Location::File(path.to_string())),
    }
}

fn open_connection(location: &Location) -> Result<Connection> {
    let conn = match location {
        Location::Memory => Connection::open_in_memory()?,
        Location::File(path) => {
            let conn = Connection::open(Path::new(path))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn
        }
    };
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

impl LoggedStore {
    /// Connects to `dsn`, retrying with exponential backoff for up to
    /// `budget` before giving up, and ensures the schema exists.
    pub async fn connect(dsn: &str, budget: Duration) -> Result<Self> {
        let location = parse_dsn(dsn)?;
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let target = location.clone();
            let opened = tokio::task::spawn_blocking(move || open_connection(&target))
                .await
                .map_err(|e| StorageError::Other(format!("connect task failed: {e}")))?;

            match opened {
                Ok(conn) => {
                    let interrupt = Arc::new(conn.get_interrupt_handle());
                    let location = match &location {
                        Location::Memory => ":memory:".to_string(),
                        Location::File(path) => path.clone(),
                    };
                    tracing::info!(db = %location, attempt, "Logged store connected");
                    return Ok(Self {
                        conn: Arc::new(Mutex::new(conn)),
                        interrupt,
                        active: Arc::new(Mutex::new(None)),
                        next_call: AtomicU64::new(0),
                        location,
                    });
                }
                Err(e) if e.is_transient() && started.elapsed() + backoff <= budget => {
                    tracing::warn!(attempt, error = %e, retry_in = ?backoff, "Database not reachable, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Giving up on database connection");
                    return Err(e);
                }
            }
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Runs `work` on the blocking pool with exclusive use of the connection.
    ///
    /// Cancellation interrupts the statement currently executing for this
    /// call; the result of the interrupted work is still awaited so a commit
    /// that raced the cancel is reported as success.
    async fn run<T, F>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        ensure_active(cancel)?;
        let conn = Arc::clone(&self.conn);
        let active = Arc::clone(&self.active);
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let token = cancel.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            let mut guard = lock_connection(&conn);
            if token.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            *lock_active(&active) = Some(call);
            let out = work(&mut *guard);
            *lock_active(&active) = None;
            drop(guard);
            out
        });

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = cancel.cancelled() => {
                // Holding the lock keeps the next caller from marking itself
                // active, so the interrupt can only hit this call's statements.
                {
                    let current = lock_active(&self.active);
                    if *current == Some(call) {
                        self.interrupt.interrupt();
                    }
                    drop(current);
                }
                task.await
            }
        };
        joined.map_err(|e| StorageError::Other(format!("storage task failed: {e}")))?
    }
}

fn lock_active(active: &Mutex<Option<u64>>) -> MutexGuard<'_, Option<u64>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lock the connection, recovering from a poisoned Mutex if necessary.
fn lock_connection(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry lookup with insert-on-miss; the UNIQUE constraint makes
/// concurrent creators converge on one id.
fn name_id(tx: &Transaction<'_>, name: &str) -> Result<i64> {
    tx.prepare_cached("INSERT OR IGNORE INTO metric_names (name) VALUES (?1)")?
        .execute(params![name])?;
    let id = tx
        .prepare_cached("SELECT id FROM metric_names WHERE name = ?1")?
        .query_row(params![name], |row| row.get(0))?;
    Ok(id)
}

fn latest_total(tx: &Transaction<'_>, metric_id: i64, name: &str) -> Result<i64> {
    let raw: Option<String> = tx
        .prepare_cached(
            "SELECT delta FROM metrics WHERE metric_id = ?1 AND type = 'counter'
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )?
        .query_row(params![metric_id], |row| row.get(0))
        .optional()?;
    match raw {
        None => Ok(0),
        Some(text) => text.trim().parse::<i64>().map_err(|e| {
            StorageError::Integrity(format!("stored total for '{name}' is not an integer: {e}"))
        }),
    }
}

/// Applies one metric inside an open transaction and returns its post-fold value.
fn append(tx: &Transaction<'_>, metric: &Metric, created_at: i64) -> Result<Metric> {
    let payload = metric.payload()?;
    let metric_id = name_id(tx, &metric.id)?;
    let mut insert = tx.prepare_cached(
        "INSERT INTO metrics (metric_id, type, value, delta, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    match payload {
        MetricPayload::Gauge(value) => {
            insert.execute(params![
                metric_id,
                MetricKind::Gauge.as_str(),
                value,
                Option::<String>::None,
                created_at
            ])?;
            Ok(Metric::gauge(metric.id.as_str(), value))
        }
        MetricPayload::Counter(delta) => {
            let current = latest_total(tx, metric_id, &metric.id)?;
            let total = fold_counter(&metric.id, current, delta)?;
            insert.execute(params![
                metric_id,
                MetricKind::Counter.as_str(),
                Option::<f64>::None,
                total.to_string(),
                created_at
            ])?;
            Ok(Metric::counter(metric.id.as_str(), total))
        }
    }
}

/// One IMMEDIATE transaction per batch: the write lock is taken before the
/// first counter read, so folds from other connections cannot interleave.
fn write_batch(conn: &mut Connection, metrics: &[Metric]) -> Result<Vec<Metric>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let created_at = Utc::now().timestamp_micros();
    let mut stored = Vec::with_capacity(metrics.len());
    for metric in metrics {
        stored.push(append(&tx, metric, created_at)?);
    }
    tx.commit()?;
    Ok(stored)
}

fn decode_row(name: String, kind: &str, value: Option<f64>, delta: Option<String>) -> Result<Metric> {
    let kind: MetricKind = kind
        .parse()
        .map_err(|e| StorageError::Integrity(format!("row for '{name}': {e}")))?;
    match (kind, value, delta) {
        (MetricKind::Gauge, Some(v), _) => Ok(Metric::gauge(name, v)),
        (MetricKind::Counter, _, Some(text)) => {
            let total = text.trim().parse::<i64>().map_err(|e| {
                StorageError::Integrity(format!("stored total for '{name}' is not an integer: {e}"))
            })?;
            Ok(Metric::counter(name, total))
        }
        (kind, _, _) => Err(StorageError::Integrity(format!(
            "{kind} row for '{name}' has no payload"
        ))),
    }
}

#[async_trait]
impl StorageEngine for LoggedStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.run(cancel, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        tracing::info!(db = %self.location(), "Logged store closed");
        Ok(())
    }

    async fn describe(&self, cancel: &CancellationToken) -> Result<String> {
        let metrics = self
            .run(cancel, |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT n.name, m.type, m.value, m.delta
                     FROM metrics m JOIN metric_names n ON n.id = m.metric_id
                     WHERE m.id = (
                         SELECT l.id FROM metrics l
                         WHERE l.metric_id = m.metric_id AND l.type = m.type
                         ORDER BY l.created_at DESC, l.id DESC LIMIT 1
                     )",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?;
                let mut metrics = Vec::new();
                for row in rows {
                    let (name, kind, value, delta) = row?;
                    metrics.push(decode_row(name, &kind, value, delta)?);
                }
                Ok(metrics)
            })
            .await?;
        Ok(render_listing(metrics))
    }

    async fn read(
        &self,
        name: &str,
        kind: MetricKind,
        cancel: &CancellationToken,
    ) -> Result<Metric> {
        let owned = name.to_string();
        self.run(cancel, move |conn| {
            let row = conn
                .prepare_cached(
                    "SELECT m.value, m.delta
                     FROM metrics m JOIN metric_names n ON n.id = m.metric_id
                     WHERE n.name = ?1 AND m.type = ?2
                     ORDER BY m.created_at DESC, m.id DESC LIMIT 1",
                )?
                .query_row(params![owned, kind.as_str()], |row| {
                    Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .optional()?;
            match row {
                Some((value, delta)) => decode_row(owned, kind.as_str(), value, delta),
                None => Err(StorageError::NotFound { name: owned, kind }),
            }
        })
        .await
    }

    async fn upsert(&self, metric: &Metric, cancel: &CancellationToken) -> Result<Metric> {
        let metric = metric.clone();
        let mut stored = self
            .run(cancel, move |conn| write_batch(conn, std::slice::from_ref(&metric)))
            .await?;
        stored
            .pop()
            .ok_or_else(|| StorageError::Other("empty fold result".to_string()))
    }

    async fn upsert_batch(
        &self,
        metrics: &[Metric],
        cancel: &CancellationToken,
    ) -> Result<Vec<Metric>> {
        let metrics = metrics.to_vec();
        let stored = self
            .run(cancel, move |conn| write_batch(conn, &metrics))
            .await?;
        tracing::debug!(db = %self.location, count = stored.len(), "Batch committed");
        Ok(stored)
    }
}
