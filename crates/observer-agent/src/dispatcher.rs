//! One report cycle: snapshot view out, `PollCount` acknowledged back.
//!
//! With no rate limit the whole view goes out as one `/updates` request.
//! With a rate limit, a fixed pool of workers sends metrics one by one from a
//! shared queue; the first failure stops every worker after its current
//! request and fails the cycle.
//! Either way the poll counter is only acknowledged after a clean cycle.
//!
//! A bounded-mode cycle that fails part way may already have had some
//! metrics applied by the server. Those are sent again next cycle, so a
//! counter among them is counted twice. Acknowledging per metric would
//! close that gap but changes what a failed cycle means for `PollCount`.

use crate::transport::{Transport, TransportError};
use observer_collector::{MetricSnapshot, POLL_COUNT};
use observer_common::types::{Metric, MetricKind};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One `/updates` request for the whole view.
    Bulk,
    /// Individual `/update` requests from this many workers.
    Bounded { workers: usize },
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Bulk => f.write_str("bulk"),
            DispatchMode::Bounded { workers } => write!(f, "bounded({workers})"),
        }
    }
}

/// Outcome of a clean cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub mode: DispatchMode,
    pub delivered: usize,
    /// `PollCount` delta that was sent and is now cleared.
    pub poll_count_acknowledged: i64,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{mode} dispatch failed after {delivered} delivered: {source}")]
    Transport {
        mode: DispatchMode,
        delivered: usize,
        #[source]
        source: TransportError,
    },

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("dispatch worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub struct Dispatcher {
    snapshot: Arc<MetricSnapshot>,
    transport: Arc<Transport>,
    rate_limit: usize,
}

impl Dispatcher {
    pub fn new(snapshot: Arc<MetricSnapshot>, transport: Arc<Transport>, rate_limit: usize) -> Self {
        Self {
            snapshot,
            transport,
            rate_limit,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        if self.rate_limit == 0 {
            DispatchMode::Bulk
        } else {
            DispatchMode::Bounded {
                workers: self.rate_limit,
            }
        }
    }

    /// Sends the current view and acknowledges its `PollCount` on success.
    ///
    /// On any failure the snapshot is left as is, so the next cycle resends
    /// the same gauges and the accumulated `PollCount`.
    pub async fn dispatch(&self, cancel: &CancellationToken) -> Result<DispatchReport, DispatchError> {
        let view = self.snapshot.view();
        if view.is_empty() {
            return Ok(DispatchReport {
                mode: self.mode(),
                delivered: 0,
                poll_count_acknowledged: 0,
            });
        }
        let sent_polls = poll_count_of(&view);

        let report = match self.mode() {
            DispatchMode::Bulk => self.send_bulk(view, cancel).await?,
            DispatchMode::Bounded { workers } => self.send_bounded(view, workers, cancel).await?,
        };

        self.snapshot.acknowledge(sent_polls);
        tracing::debug!(
            mode = %report.mode,
            delivered = report.delivered,
            poll_count = sent_polls,
            "Report cycle delivered"
        );
        Ok(DispatchReport {
            poll_count_acknowledged: sent_polls,
            ..report
        })
    }

    async fn send_bulk(
        &self,
        view: Vec<Metric>,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        match self.transport.send_batch(&view, cancel).await {
            Ok(stored) => Ok(DispatchReport {
                mode: DispatchMode::Bulk,
                delivered: stored.len(),
                poll_count_acknowledged: 0,
            }),
            Err(TransportError::Cancelled) => Err(DispatchError::Cancelled),
            Err(source) => Err(DispatchError::Transport {
                mode: DispatchMode::Bulk,
                delivered: 0,
                source,
            }),
        }
    }

    async fn send_bounded(
        &self,
        view: Vec<Metric>,
        rate_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let workers = rate_limit.min(view.len());
        let mode = DispatchMode::Bounded { workers };
        let (tx, rx) = flume::bounded::<Metric>(view.len());
        let abort = Arc::new(AtomicBool::new(false));
        let first_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));
        let delivered = Arc::new(AtomicUsize::new(0));

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let rx = rx.clone();
            let transport = Arc::clone(&self.transport);
            let abort = Arc::clone(&abort);
            let first_error = Arc::clone(&first_error);
            let delivered = Arc::clone(&delivered);
            let cancel = cancel.clone();
            pool.spawn(async move {
                // The queue is filled up front, so workers check the flag themselves.
                while !abort.load(Ordering::SeqCst) {
                    let Ok(metric) = rx.recv_async().await else {
                        break;
                    };
                    match transport.send_metric(&metric, &cancel).await {
                        Ok(_) => {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            tracing::debug!(metric = %metric.id, error = %err, "Metric delivery failed");
                            abort.store(true, Ordering::SeqCst);
                            let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            break;
                        }
                    }
                }
            });
        }
        drop(rx);

        for metric in view {
            if abort.load(Ordering::SeqCst) {
                break;
            }
            if tx.send_async(metric).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut panicked = None;
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                panicked.get_or_insert(e);
            }
        }
        if let Some(e) = panicked {
            return Err(DispatchError::Worker(e));
        }

        let delivered = delivered.load(Ordering::Relaxed);
        let failure = first_error.lock().unwrap_or_else(|p| p.into_inner()).take();
        match failure {
            None => Ok(DispatchReport {
                mode,
                delivered,
                poll_count_acknowledged: 0,
            }),
            Some(TransportError::Cancelled) => Err(DispatchError::Cancelled),
            Some(source) => Err(DispatchError::Transport {
                mode,
                delivered,
                source,
            }),
        }
    }
}

fn poll_count_of(view: &[Metric]) -> i64 {
    view.iter()
        .find(|m| m.id == POLL_COUNT && m.kind == MetricKind::Counter)
        .and_then(|m| m.delta)
        .unwrap_or(0)
}
