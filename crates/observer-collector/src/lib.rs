//! Metric collection for the observer agent.
//!
//! Each [`Collector`] samples one category of signals (agent process,
//! host CPU/memory, a random value) and returns gauges. The [`Sampler`] runs
//! all of them on every poll tick and folds the result into the shared
//! [`MetricSnapshot`], which also owns the `PollCount` counter.

pub mod process;
pub mod random;
pub mod snapshot;
pub mod system;

use anyhow::Result;
use observer_common::types::Metric;
use std::sync::Arc;

pub use snapshot::{MetricSnapshot, POLL_COUNT};

/// A metric collector that runs on the agent host.
///
/// Implementations are registered with the [`Sampler`] and called at each
/// poll interval. The trait requires `Send + Sync` so the sampler can live on
/// its own task.
pub trait Collector: Send + Sync {
    /// Returns the collector name (e.g., `"system"`), used for logging.
    fn name(&self) -> &str;

    /// Collects current gauge values.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system API call fails. The sampler
    /// logs it, keeps the other collectors' output for the tick, and drops
    /// the gauges this collector reported last time.
    fn collect(&mut self) -> Result<Vec<Metric>>;
}

/// Drives the registered collectors and records each tick into the snapshot.
pub struct Sampler {
    collectors: Vec<Box<dyn Collector>>,
    /// Gauge names each collector reported on its last successful tick.
    reported: Vec<Vec<String>>,
    snapshot: Arc<MetricSnapshot>,
}

impl Sampler {
    pub fn new(collectors: Vec<Box<dyn Collector>>, snapshot: Arc<MetricSnapshot>) -> Self {
        Self {
            reported: vec![Vec::new(); collectors.len()],
            collectors,
            snapshot,
        }
    }

    /// Sampler with the standard process, system and random collectors.
    pub fn with_default_collectors(snapshot: Arc<MetricSnapshot>) -> Self {
        Self::new(
            vec![
                Box::new(process::ProcessCollector::new()),
                Box::new(system::SystemCollector::new()),
                Box::new(random::RandomCollector),
            ],
            snapshot,
        )
    }

    pub fn snapshot(&self) -> &Arc<MetricSnapshot> {
        &self.snapshot
    }

    /// Runs one poll tick and returns the snapshot view after it.
    ///
    /// `PollCount` advances by exactly one per call, even when every
    /// collector fails.
    pub fn sample(&mut self) -> Vec<Metric> {
        let mut points = Vec::new();
        let mut stale = Vec::new();
        for (collector, reported) in self.collectors.iter_mut().zip(&mut self.reported) {
            match collector.collect() {
                Ok(metrics) => {
                    *reported = metrics.iter().map(|m| m.id.clone()).collect();
                    points.extend(metrics);
                }
                Err(e) => {
                    tracing::warn!(collector = collector.name(), error = %e, "Collection failed");
                    stale.append(reported);
                }
            }
        }
        tracing::debug!(count = points.len(), stale = stale.len(), "Collected metrics");
        self.snapshot.record_tick(points, &stale);
        self.snapshot.view()
    }
}
