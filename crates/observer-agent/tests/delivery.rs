use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use observer_agent::config::FileConfig;
use observer_agent::{
    AgentArgs, AgentConfig, DispatchError, DispatchMode, Dispatcher, RetryPolicy, Transport, TransportConfig,
    TransportError,
};
use observer_collector::{Collector, MetricSnapshot, Sampler, POLL_COUNT};
use observer_common::types::{Metric, MetricKind};
use observer_server::app::build_http_app;
use observer_server::{AppState, ServerConfig};
use observer_storage::{StorageEngine, VolatileStore};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PRIVATE_PEM: &str = include_str!("../../observer-common/testdata/rsa_private.pem");
const PUBLIC_PEM: &str = include_str!("../../observer-common/testdata/rsa_public.pem");

struct TestServer {
    address: String,
    storage: Arc<dyn StorageEngine>,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestServer {
    async fn counter(&self, name: &str) -> Option<i64> {
        self.storage
            .read(name, MetricKind::Counter, &CancellationToken::new())
            .await
            .ok()
            .and_then(|m| m.delta)
    }

    async fn gauge(&self, name: &str) -> Option<f64> {
        self.storage
            .read(name, MetricKind::Gauge, &CancellationToken::new())
            .await
            .ok()
            .and_then(|m| m.value)
    }
}

async fn start_server(config: ServerConfig) -> TestServer {
    let storage: Arc<dyn StorageEngine> = Arc::new(VolatileStore::new());
    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::clone(&storage), config, shutdown.clone()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let app = build_http_app(state);
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
    });
    TestServer {
        address,
        storage,
        shutdown,
    }
}

fn plain_server_config() -> ServerConfig {
    ServerConfig {
        file_storage_path: None,
        ..ServerConfig::default()
    }
}

/// Serves `router` on an ephemeral port and returns its address.
async fn start_stub(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { axum::serve(listener, router).await });
    address
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        min_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        multiplier: 2.0,
    }
}

fn transport(address: &str) -> Arc<Transport> {
    let config = TransportConfig {
        retry: fast_retry(),
        ..TransportConfig::new(address)
    };
    Arc::new(Transport::new(config).unwrap())
}

fn snapshot_with(ticks: usize, gauges: &[(&str, f64)]) -> Arc<MetricSnapshot> {
    let snapshot = Arc::new(MetricSnapshot::new());
    for _ in 0..ticks {
        snapshot.record(
            gauges
                .iter()
                .map(|(name, value)| Metric::gauge(*name, *value))
                .collect(),
        );
    }
    snapshot
}

#[tokio::test]
async fn bulk_dispatch_delivers_and_acknowledges_poll_count() {
    let server = start_server(plain_server_config()).await;
    let snapshot = snapshot_with(3, &[("Alloc", 10.0), ("HeapInuse", 2.5)]);
    let dispatcher = Dispatcher::new(Arc::clone(&snapshot), transport(&server.address), 0);
    assert_eq!(dispatcher.mode(), DispatchMode::Bulk);

    let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(report.poll_count_acknowledged, 3);
    assert_eq!(snapshot.poll_count(), 0);
    assert_eq!(server.counter(POLL_COUNT).await, Some(3));
    assert_eq!(server.gauge("HeapInuse").await, Some(2.5));

    // An idle cycle adds nothing to the server-side total.
    dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(server.counter(POLL_COUNT).await, Some(3));

    snapshot.record(vec![Metric::gauge("Alloc", 11.0)]);
    dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(server.counter(POLL_COUNT).await, Some(4));
    assert_eq!(server.gauge("Alloc").await, Some(11.0));
}

#[tokio::test]
async fn bounded_dispatch_sends_every_metric() {
    let server = start_server(plain_server_config()).await;
    let gauges: Vec<(String, f64)> = (0..7).map(|i| (format!("g{i}"), f64::from(i))).collect();
    let refs: Vec<(&str, f64)> = gauges.iter().map(|(n, v)| (n.as_str(), *v)).collect();
    let snapshot = snapshot_with(2, &refs);

    let dispatcher = Dispatcher::new(Arc::clone(&snapshot), transport(&server.address), 3);
    let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.mode, DispatchMode::Bounded { workers: 3 });
    assert_eq!(report.delivered, 8);
    assert_eq!(snapshot.poll_count(), 0);
    assert_eq!(server.counter(POLL_COUNT).await, Some(2));
    for i in 0..7 {
        assert_eq!(server.gauge(&format!("g{i}")).await, Some(f64::from(i)));
    }
}

#[tokio::test]
async fn signed_and_encrypted_reports_are_accepted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let private = dir.path().join("private.pem");
    let public = dir.path().join("public.pem");
    std::fs::write(&private, PRIVATE_PEM)?;
    std::fs::write(&public, PUBLIC_PEM)?;

    let server = start_server(ServerConfig {
        key: Some("shared".into()),
        crypto_key: Some(private),
        ..plain_server_config()
    })
    .await;

    let transport = Transport::new(TransportConfig {
        key: Some("shared".into()),
        crypto_key: Some(public),
        retry: fast_retry(),
        ..TransportConfig::new(&server.address)
    })?;
    let snapshot = snapshot_with(1, &[("Sealed", 42.0)]);
    let dispatcher = Dispatcher::new(Arc::clone(&snapshot), Arc::new(transport), 0);

    dispatcher.dispatch(&CancellationToken::new()).await?;
    assert_eq!(server.gauge("Sealed").await, Some(42.0));
    assert_eq!(server.counter(POLL_COUNT).await, Some(1));
    Ok(())
}

#[tokio::test]
async fn mismatched_key_is_rejected_without_retry() {
    let server = start_server(ServerConfig {
        key: Some("server-side".into()),
        ..plain_server_config()
    })
    .await;
    let transport = Transport::new(TransportConfig {
        key: Some("agent-side".into()),
        retry: fast_retry(),
        ..TransportConfig::new(&server.address)
    })
    .unwrap();
    let snapshot = snapshot_with(2, &[("Alloc", 1.0)]);
    let dispatcher = Dispatcher::new(Arc::clone(&snapshot), Arc::new(transport), 0);

    let err = dispatcher.dispatch(&CancellationToken::new()).await.unwrap_err();
    match err {
        DispatchError::Transport { source, .. } => assert!(matches!(
            source,
            TransportError::Status { status, .. } if status == StatusCode::BAD_REQUEST
        )),
        other => panic!("unexpected error: {other}"),
    }
    // Nothing acknowledged: the next cycle resends the whole count.
    assert_eq!(snapshot.poll_count(), 2);
    assert_eq!(server.counter(POLL_COUNT).await, None);
}

#[tokio::test]
async fn server_errors_are_retried_a_bounded_number_of_times() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new().route(
        "/updates",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "boom")
            }
        }),
    );
    let address = start_stub(router).await;

    let err = transport(&address)
        .send_batch(&[Metric::counter(POLL_COUNT, 1)], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Exhausted { attempts: 3, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new().route(
        "/updates",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (StatusCode::BAD_REQUEST, "nope")
            }
        }),
    );
    let address = start_stub(router).await;

    let err = transport(&address)
        .send_batch(&[Metric::gauge("x", 1.0)], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Status { status, ref body } if status == StatusCode::BAD_REQUEST && body == "nope"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn trusted_subnet_admits_agent_reports() {
    let server = start_server(ServerConfig {
        trusted_subnet: Some("127.0.0.0/8".parse().unwrap()),
        ..plain_server_config()
    })
    .await;
    let transport = transport(&server.address);
    assert_eq!(transport.real_ip(), Some(Ipv4Addr::LOCALHOST.into()));

    let snapshot = snapshot_with(2, &[("Alloc", 5.0)]);
    let dispatcher = Dispatcher::new(Arc::clone(&snapshot), Arc::clone(&transport), 0);
    dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(server.gauge("Alloc").await, Some(5.0));
    assert_eq!(server.counter(POLL_COUNT).await, Some(2));

    let bounded = Dispatcher::new(Arc::clone(&snapshot), transport, 2);
    snapshot.record(vec![Metric::gauge("Alloc", 6.0)]);
    bounded.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(server.gauge("Alloc").await, Some(6.0));
}

#[tokio::test]
async fn bounded_failure_stops_the_pool() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new().route(
        "/update",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (StatusCode::BAD_REQUEST, "rejected")
            }
        }),
    );
    let address = start_stub(router).await;
    let gauges: Vec<(String, f64)> = (0..50).map(|i| (format!("g{i}"), f64::from(i))).collect();
    let refs: Vec<(&str, f64)> = gauges.iter().map(|(n, v)| (n.as_str(), *v)).collect();
    let snapshot = snapshot_with(3, &refs);

    let dispatcher = Dispatcher::new(Arc::clone(&snapshot), transport(&address), 2);
    let err = dispatcher.dispatch(&CancellationToken::new()).await.unwrap_err();
    match err {
        DispatchError::Transport { mode, delivered, source } => {
            assert_eq!(mode, DispatchMode::Bounded { workers: 2 });
            assert_eq!(delivered, 0);
            assert!(matches!(
                source,
                TransportError::Status { status, .. } if status == StatusCode::BAD_REQUEST
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Each worker gives up after its own failed request.
    assert!(hits.load(Ordering::SeqCst) <= 2);
    assert_eq!(snapshot.poll_count(), 3);
}

#[tokio::test]
async fn unreachable_server_exhausts_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = transport(&address)
        .send_metric(&Metric::gauge("x", 1.0), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        TransportError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(last.is_retryable());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancellation_interrupts_a_hanging_request() {
    let router = Router::new().route(
        "/updates",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }),
    );
    let address = start_stub(router).await;
    let snapshot = snapshot_with(1, &[("Alloc", 1.0)]);
    let dispatcher = Dispatcher::new(Arc::clone(&snapshot), transport(&address), 0);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = dispatcher.dispatch(&cancel).await.unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(snapshot.poll_count(), 1);
}

struct FixedCollector;

impl Collector for FixedCollector {
    fn name(&self) -> &str {
        "fixed"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        Ok(vec![Metric::gauge("Fixed", 7.0)])
    }
}

#[tokio::test]
async fn agent_loop_reports_until_shutdown() {
    let server = start_server(plain_server_config()).await;
    let args = AgentArgs {
        address: Some(server.address.clone()),
        poll_interval: Some(Duration::from_millis(20)),
        report_interval: Some(Duration::from_millis(100)),
        ..AgentArgs::default()
    };
    let config = AgentConfig::resolve(args, FileConfig::default()).unwrap();
    let snapshot = Arc::new(MetricSnapshot::new());
    let sampler = Sampler::new(vec![Box::new(FixedCollector)], Arc::clone(&snapshot));

    let shutdown = CancellationToken::new();
    let agent = tokio::spawn(observer_agent::run_with_sampler(config, sampler, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(450)).await;
    shutdown.cancel();
    agent.await.unwrap().unwrap();

    assert_eq!(server.gauge("Fixed").await, Some(7.0));
    let reported = server.counter(POLL_COUNT).await.unwrap_or_default();
    assert!(reported > 0);
    // Every tick is either on the server or still pending locally.
    assert!(reported + snapshot.poll_count() >= 5);
}
