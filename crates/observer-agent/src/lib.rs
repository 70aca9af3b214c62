//! Observer agent: samples the host on one timer and reports on another.
//!
//! The poll loop runs the [`Sampler`] every `poll_interval` and records into
//! the shared [`MetricSnapshot`]. The report loop hands that snapshot to the
//! [`Dispatcher`] every `report_interval`; a cycle finishes before the next
//! one starts. Both loops stop on the same cancellation token, which also
//! aborts any request in flight.

pub mod config;
pub mod dispatcher;
pub mod transport;

use anyhow::{Context, Result};
use observer_collector::{MetricSnapshot, Sampler};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use config::{AgentArgs, AgentConfig};
pub use dispatcher::{DispatchError, DispatchMode, DispatchReport, Dispatcher};
pub use transport::{RetryPolicy, Transport, TransportConfig, TransportError};

/// Runs the agent with the standard collectors until `shutdown` fires.
pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> Result<()> {
    let snapshot = Arc::new(MetricSnapshot::new());
    run_with_sampler(config, Sampler::with_default_collectors(snapshot), shutdown).await
}

/// Runs the agent with a caller-supplied sampler until `shutdown` fires.
pub async fn run_with_sampler(
    config: AgentConfig,
    sampler: Sampler,
    shutdown: CancellationToken,
) -> Result<()> {
    let transport = Transport::new(TransportConfig {
        address: config.address.clone(),
        key: config.key.clone(),
        crypto_key: config.crypto_key.clone(),
        timeout: config.request_timeout,
        retry: RetryPolicy::default(),
    })
    .context("building transport")?;

    let transport = Arc::new(transport);
    let dispatcher = Dispatcher::new(
        Arc::clone(sampler.snapshot()),
        Arc::clone(&transport),
        config.rate_limit,
    );

    tracing::info!(
        server = %transport.base_url(),
        real_ip = ?transport.real_ip(),
        poll_interval = ?config.poll_interval,
        report_interval = ?config.report_interval,
        mode = %dispatcher.mode(),
        signed = config.key.is_some(),
        encrypted = config.crypto_key.is_some(),
        "Starting collection loop"
    );

    let poll = tokio::spawn(poll_loop(sampler, config.poll_interval, shutdown.clone()));
    let report = tokio::spawn(report_loop(dispatcher, config.report_interval, shutdown.clone()));

    let (poll, report) = tokio::join!(poll, report);
    poll.context("poll loop panicked")?;
    report.context("report loop panicked")?;
    tracing::info!("Agent stopped");
    Ok(())
}

async fn poll_loop(mut sampler: Sampler, period: Duration, shutdown: CancellationToken) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let view = sampler.sample();
                tracing::trace!(metrics = view.len(), "Poll tick");
            }
        }
    }
}

async fn report_loop(dispatcher: Dispatcher, period: Duration, shutdown: CancellationToken) {
    // First report one full period after start, so it carries real samples.
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                match dispatcher.dispatch(&shutdown).await {
                    Ok(report) => tracing::debug!(
                        mode = %report.mode,
                        delivered = report.delivered,
                        poll_count = report.poll_count_acknowledged,
                        "Metrics reported"
                    ),
                    Err(DispatchError::Cancelled) => break,
                    Err(e) => tracing::warn!(error = %e, "Report failed, metrics kept for next cycle"),
                }
            }
        }
    }
}
