use crate::error::{Result, StorageError};
use crate::{ensure_active, StorageEngine};
use async_trait::async_trait;
use observer_common::types::{Metric, MetricKind, MetricPayload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Current value of every metric, split by kind.
///
/// This is also the on-disk snapshot format, one JSON object per line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricMap {
    #[serde(rename = "gauge_metrics", default)]
    gauges: BTreeMap<String, f64>,
    #[serde(rename = "counter_metrics", default)]
    counters: BTreeMap<String, i64>,
}

impl MetricMap {
    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }

    pub fn get(&self, name: &str, kind: MetricKind) -> Option<Metric> {
        match kind {
            MetricKind::Gauge => self.gauges.get(name).map(|v| Metric::gauge(name, *v)),
            MetricKind::Counter => self.counters.get(name).map(|d| Metric::counter(name, *d)),
        }
    }

    /// Applies a batch all-or-nothing.
    ///
    /// Every metric is validated and folded into a staging area first; the
    /// map is only touched once the whole batch has succeeded.
    pub fn apply_batch(&mut self, metrics: &[Metric]) -> Result<Vec<Metric>> {
        let mut gauges: HashMap<&str, f64> = HashMap::new();
        let mut counters: HashMap<&str, i64> = HashMap::new();
        let mut stored = Vec::with_capacity(metrics.len());

        for metric in metrics {
            let name = metric.id.as_str();
            match metric.payload()? {
                MetricPayload::Gauge(value) => {
                    gauges.insert(name, value);
                    stored.push(Metric::gauge(name, value));
                }
                MetricPayload::Counter(delta) => {
                    let current = counters
                        .get(name)
                        .or_else(|| self.counters.get(name))
                        .copied()
                        .unwrap_or(0);
                    let total = fold_counter(name, current, delta)?;
                    counters.insert(name, total);
                    stored.push(Metric::counter(name, total));
                }
            }
        }

        for (name, value) in gauges {
            self.gauges.insert(name.to_string(), value);
        }
        for (name, total) in counters {
            self.counters.insert(name.to_string(), total);
        }
        Ok(stored)
    }

    pub fn apply(&mut self, metric: &Metric) -> Result<Metric> {
        self.apply_batch(std::slice::from_ref(metric))?
            .pop()
            .ok_or_else(|| StorageError::Other("empty fold result".to_string()))
    }

    /// Renders the map in the `name: value` listing format.
    pub fn describe(&self) -> String {
        let gauges = self
            .gauges
            .iter()
            .map(|(name, value)| Metric::gauge(name.as_str(), *value));
        let counters = self
            .counters
            .iter()
            .map(|(name, total)| Metric::counter(name.as_str(), *total));
        render_listing(gauges.chain(counters))
    }
}

pub(crate) fn fold_counter(name: &str, current: i64, delta: i64) -> Result<i64> {
    current
        .checked_add(delta)
        .ok_or_else(|| StorageError::CounterOverflow {
            name: name.to_string(),
        })
}

/// Sorted `name: value` lines joined by `",\n"`; gauges print with six
/// decimals.
pub(crate) fn render_listing(metrics: impl IntoIterator<Item = Metric>) -> String {
    let mut lines: Vec<String> = metrics
        .into_iter()
        .filter_map(|metric| match (metric.value, metric.delta) {
            (Some(v), _) => Some(format!("{}: {:.6}", metric.id, v)),
            (None, Some(d)) => Some(format!("{}: {}", metric.id, d)),
            (None, None) => None,
        })
        .collect();
    lines.sort();
    lines.join(",\n")
}

/// Mutex-guarded in-memory store with no durability.
#[derive(Debug, Clone, Default)]
pub struct VolatileStore {
    map: Arc<RwLock<MetricMap>>,
}

impl VolatileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(map: MetricMap) -> Self {
        Self {
            map: Arc::new(RwLock::new(map)),
        }
    }

    pub(crate) fn shared_map(&self) -> &Arc<RwLock<MetricMap>> {
        &self.map
    }
}

#[async_trait]
impl StorageEngine for VolatileStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)
    }

    async fn describe(&self, cancel: &CancellationToken) -> Result<String> {
        ensure_active(cancel)?;
        Ok(self.map.read().await.describe())
    }

    async fn read(
        &self,
        name: &str,
        kind: MetricKind,
        cancel: &CancellationToken,
    ) -> Result<Metric> {
        ensure_active(cancel)?;
        self.map
            .read()
            .await
            .get(name, kind)
            .ok_or_else(|| StorageError::NotFound {
                name: name.to_string(),
                kind,
            })
    }

    async fn upsert(&self, metric: &Metric, cancel: &CancellationToken) -> Result<Metric> {
        ensure_active(cancel)?;
        self.map.write().await.apply(metric)
    }

    async fn upsert_batch(
        &self,
        metrics: &[Metric],
        cancel: &CancellationToken,
    ) -> Result<Vec<Metric>> {
        ensure_active(cancel)?;
        self.map.write().await.apply_batch(metrics)
    }
}
