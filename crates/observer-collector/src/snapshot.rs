use observer_common::types::{Metric, MetricPayload};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Name of the counter incremented on every poll tick.
pub const POLL_COUNT: &str = "PollCount";

#[derive(Debug, Default)]
struct SnapshotState {
    gauges: BTreeMap<String, f64>,
    poll_count: i64,
}

/// Latest agent-side readings, shared between the poll and report loops.
///
/// All access goes through one read-write lock: the sampler is the only
/// writer, the dispatcher reads a full view per report tick.
#[derive(Debug, Default)]
pub struct MetricSnapshot {
    state: RwLock<SnapshotState>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SnapshotState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SnapshotState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores one tick of gauges and advances `PollCount` by one.
    pub fn record(&self, metrics: Vec<Metric>) {
        self.record_tick(metrics, &[]);
    }

    /// Like [`record`](Self::record), but first drops the `stale` gauges
    /// under the same lock, so no view ever holds them next to the new tick.
    pub fn record_tick(&self, metrics: Vec<Metric>, stale: &[String]) {
        let mut state = self.write();
        for name in stale {
            state.gauges.remove(name);
        }
        for metric in metrics {
            match metric.payload() {
                Ok(MetricPayload::Gauge(value)) => {
                    state.gauges.insert(metric.id, value);
                }
                Ok(MetricPayload::Counter(_)) => {
                    tracing::debug!(metric = %metric.id, "Ignoring collector counter");
                }
                Err(e) => tracing::debug!(error = %e, "Dropping malformed sample"),
            }
        }
        state.poll_count = state.poll_count.saturating_add(1);
    }

    /// Plain list export: gauges in name order, then `PollCount`.
    pub fn view(&self) -> Vec<Metric> {
        let state = self.read();
        let mut metrics: Vec<Metric> = state
            .gauges
            .iter()
            .map(|(name, value)| Metric::gauge(name.clone(), *value))
            .collect();
        metrics.push(Metric::counter(POLL_COUNT, state.poll_count));
        metrics
    }

    pub fn poll_count(&self) -> i64 {
        self.read().poll_count
    }

    /// Clears the `PollCount` delta that the server has accepted.
    ///
    /// Subtracts rather than zeroes, so polls that ran while the dispatch was
    /// in flight stay counted.
    pub fn acknowledge(&self, delivered: i64) {
        let mut state = self.write();
        state.poll_count = state.poll_count.saturating_sub(delivered).max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_overwrites_gauges_and_counts_ticks() {
        let snapshot = MetricSnapshot::new();
        snapshot.record(vec![Metric::gauge("Alloc", 1.0)]);
        snapshot.record(vec![Metric::gauge("Alloc", 2.0), Metric::gauge("Heap", 3.0)]);

        assert_eq!(
            snapshot.view(),
            vec![
                Metric::gauge("Alloc", 2.0),
                Metric::gauge("Heap", 3.0),
                Metric::counter(POLL_COUNT, 2),
            ]
        );
    }

    #[test]
    fn acknowledge_keeps_polls_that_raced_the_dispatch() {
        let snapshot = MetricSnapshot::new();
        snapshot.record(vec![]);
        snapshot.record(vec![]);
        let sent = snapshot.poll_count();

        // a poll lands while the batch is on the wire
        snapshot.record(vec![]);
        snapshot.acknowledge(sent);
        assert_eq!(snapshot.poll_count(), 1);
    }

    #[test]
    fn stale_gauges_leave_the_view() {
        let snapshot = MetricSnapshot::new();
        snapshot.record(vec![Metric::gauge("Alloc", 1.0), Metric::gauge("Heap", 2.0)]);
        snapshot.record_tick(vec![Metric::gauge("Alloc", 3.0)], &["Heap".to_string()]);

        assert_eq!(
            snapshot.view(),
            vec![Metric::gauge("Alloc", 3.0), Metric::counter(POLL_COUNT, 2)]
        );
    }

    #[test]
    fn malformed_samples_are_dropped() {
        let snapshot = MetricSnapshot::new();
        snapshot.record(vec![Metric::gauge("Bad", f64::INFINITY), Metric::counter("C", 1)]);
        assert_eq!(snapshot.view(), vec![Metric::counter(POLL_COUNT, 1)]);
    }
}
