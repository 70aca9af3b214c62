use crate::error::{Result, StorageError};
use crate::memory::{MetricMap, VolatileStore};
use crate::{ensure_active, StorageEngine};
use async_trait::async_trait;
use observer_common::types::{Metric, MetricKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// When the snapshot file is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Append a snapshot line after every successful write.
    EveryWrite,
    /// Append a snapshot line on a fixed period.
    Periodic(Duration),
}

impl FlushPolicy {
    /// A zero store interval means flush on every write.
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            FlushPolicy::EveryWrite
        } else {
            FlushPolicy::Periodic(interval)
        }
    }
}

struct Ticker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-memory store persisted as full JSON snapshots appended to a file.
///
/// Only the last complete line of the file matters on restore; earlier
/// lines are stale snapshots left by the append-only writer.
pub struct SnapshotStore {
    memory: VolatileStore,
    path: PathBuf,
    policy: FlushPolicy,
    ticker: Mutex<Option<Ticker>>,
}

impl SnapshotStore {
    /// Opens (creating if needed) the snapshot file, optionally restores the
    /// last snapshot, and starts the flush ticker for periodic policies.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn open(path: impl AsRef<Path>, policy: FlushPolicy, restore: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        let map = if restore {
            load_last_snapshot(&path).await?
        } else {
            MetricMap::default()
        };
        tracing::info!(
            path = %path.display(),
            restored = map.len(),
            policy = ?policy,
            "Snapshot store opened"
        );

        let memory = VolatileStore::with_map(map);
        let ticker = match policy {
            FlushPolicy::Periodic(period) => Some(spawn_ticker(
                memory.shared_map().clone(),
                path.clone(),
                period,
            )),
            FlushPolicy::EveryWrite => None,
        };

        Ok(Self {
            memory,
            path,
            policy,
            ticker: Mutex::new(ticker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends the current map as one line, regardless of policy.
    pub async fn flush(&self) -> Result<()> {
        let map = self.memory.shared_map().read().await;
        append_snapshot(&self.path, &map).await
    }

    async fn write_through(
        &self,
        metrics: &[Metric],
        cancel: &CancellationToken,
    ) -> Result<Vec<Metric>> {
        ensure_active(cancel)?;
        let mut map = self.memory.shared_map().write().await;
        let stored = map.apply_batch(metrics)?;
        if self.policy == FlushPolicy::EveryWrite {
            // The in-memory change stays even if the flush fails.
            tokio::select! {
                res = append_snapshot(&self.path, &map) => res?,
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            }
        }
        Ok(stored)
    }
}

fn spawn_ticker(
    map: Arc<RwLock<MetricMap>>,
    path: PathBuf,
    period: Duration,
) -> Ticker {
    let stop = CancellationToken::new();
    let token = stop.clone();
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let snapshot = map.read().await;
                    if snapshot.is_empty() {
                        continue;
                    }
                    if let Err(e) = append_snapshot(&path, &snapshot).await {
                        tracing::error!(path = %path.display(), error = %e, "Periodic snapshot failed");
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    });
    Ticker { stop, handle }
}

async fn append_snapshot(path: &Path, map: &MetricMap) -> Result<()> {
    let mut line = serde_json::to_vec(map)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.write_all(&line)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.sync_data()
        .await
        .map_err(|e| StorageError::io(path, e))?;
    tracing::debug!(path = %path.display(), metrics = map.len(), "Snapshot appended");
    Ok(())
}

/// Returns the newest snapshot that parses, scanning from the end.
///
/// A torn trailing line (crash mid-append) is skipped in favour of the
/// previous one. An empty file or a file with no valid line yields an empty
/// map.
async fn load_last_snapshot(path: &Path) -> Result<MetricMap> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;

    for line in content.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MetricMap>(line) {
            Ok(map) => return Ok(map),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot line")
            }
        }
    }
    Ok(MetricMap::default())
}

#[async_trait]
impl StorageEngine for SnapshotStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)
    }

    async fn describe(&self, cancel: &CancellationToken) -> Result<String> {
        self.memory.describe(cancel).await
    }

    async fn read(
        &self,
        name: &str,
        kind: MetricKind,
        cancel: &CancellationToken,
    ) -> Result<Metric> {
        self.memory.read(name, kind, cancel).await
    }

    async fn upsert(&self, metric: &Metric, cancel: &CancellationToken) -> Result<Metric> {
        self.write_through(std::slice::from_ref(metric), cancel)
            .await?
            .pop()
            .ok_or_else(|| StorageError::Other("empty fold result".to_string()))
    }

    async fn upsert_batch(
        &self,
        metrics: &[Metric],
        cancel: &CancellationToken,
    ) -> Result<Vec<Metric>> {
        self.write_through(metrics, cancel).await
    }

    /// Stops the ticker and writes a final snapshot.
    async fn close(&self) -> Result<()> {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(ticker) = ticker {
            ticker.stop.cancel();
            if let Err(e) = ticker.handle.await {
                tracing::warn!(error = %e, "Snapshot ticker ended abnormally");
            }
        }
        if self.memory.shared_map().read().await.is_empty() {
            return Ok(());
        }
        self.flush().await?;
        tracing::info!(path = %self.path().display(), "Final snapshot written");
        Ok(())
    }
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.ticker.lock() {
            if let Some(ticker) = guard.take() {
                ticker.stop.cancel();
            }
        }
    }
}
