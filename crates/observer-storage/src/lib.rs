//! Metric storage for the observer server.
//!
//! Three interchangeable backends implement [`StorageEngine`]:
//!
//! - [`memory::VolatileStore`]: an in-process map, lost on restart.
//! - [`snapshot::SnapshotStore`]: the in-process map plus full snapshots
//!   appended to a line file, either after every write or on a timer.
//! - [`logged::LoggedStore`]: an append-only SQLite log where every write is
//!   a new row and the newest row per metric is the current value.
//!
//! All three give gauges overwrite semantics and counters fold semantics,
//! and apply batches all-or-nothing.

pub mod error;
pub mod logged;
pub mod memory;
pub mod snapshot;


use async_trait::async_trait;
use observer_common::types::{Metric, MetricKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use error::{Result, StorageError};
pub use logged::LoggedStore;
pub use memory::VolatileStore;
pub use snapshot::{FlushPolicy, SnapshotStore};

/// Persistence backend for metrics.
///
/// Implementations must be safe to share across threads (`Send + Sync`)
/// because every HTTP request is served on its own task. Every operation
/// takes the caller's cancellation token; a cancelled call returns
/// [`StorageError::Cancelled`].
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Checks that the backend is reachable.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;

    /// Human-readable listing of every current metric, one `name: value`
    /// entry per line, sorted.
    async fn describe(&self, cancel: &CancellationToken) -> Result<String>;

    /// Reads the current value of `name` as `kind`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if nothing of that kind is stored under
    /// the name.
    async fn read(&self, name: &str, kind: MetricKind, cancel: &CancellationToken)
        -> Result<Metric>;

    /// Applies one metric and returns the post-fold value (the new
    /// cumulative total for counters).
    async fn upsert(&self, metric: &Metric, cancel: &CancellationToken) -> Result<Metric>;

    /// Applies every metric or none of them, returning post-fold values in
    /// input order.
    async fn upsert_batch(
        &self,
        metrics: &[Metric],
        cancel: &CancellationToken,
    ) -> Result<Vec<Metric>>;

    /// Flushes and releases backend resources. Called once on shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Backend selection and persistence settings.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Database DSN; selects [`LoggedStore`] when set.
    pub dsn: Option<String>,
    /// Snapshot file; selects [`SnapshotStore`] when set and no DSN is.
    pub file_path: Option<PathBuf>,
    /// Load the last snapshot on start-up.
    pub restore: bool,
    /// Zero flushes after every write; anything else is the flush period.
    pub store_interval: Duration,
    /// How long [`LoggedStore`] keeps retrying its first connection.
    pub connect_budget: Duration,
}

/// Builds the backend that `config` selects.
///
/// DSN present ⇒ [`LoggedStore`]; else file path present ⇒
/// [`SnapshotStore`]; else [`VolatileStore`].
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn StorageEngine>> {
    if let Some(dsn) = config.dsn.as_deref().filter(|d| !d.trim().is_empty()) {
        let store = LoggedStore::connect(dsn, config.connect_budget).await?;
        return Ok(Arc::new(store));
    }

    if let Some(path) = config.file_path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        let policy = FlushPolicy::from_interval(config.store_interval);
        let store = SnapshotStore::open(path, policy, config.restore).await?;
        return Ok(Arc::new(store));
    }

    Ok(Arc::new(VolatileStore::new()))
}

pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(StorageError::Cancelled)
    } else {
        Ok(())
    }
}
