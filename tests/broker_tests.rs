use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broker_lite::config::BrokerConfig;
use broker_lite::job::Job;
use broker_lite::server::{Broker, ClientData, Closer, ConnectionHandle};
use broker_lite::storage::{MemoryStore, Store};
use broker_lite::BrokerError;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CountingCloser(AtomicUsize);

impl Closer for CountingCloser {
    fn close(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> BrokerConfig {
    BrokerConfig::default()
        .with_fetch_timeout(Duration::from_millis(200))
        .with_scheduler_interval(Duration::from_millis(50))
        .with_reap_interval(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(100))
}

fn start_broker(config: BrokerConfig) -> (Arc<Broker>, Arc<dyn Store>, CancellationToken) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(&config));
    let broker = Arc::new(Broker::new(config, store.clone()));
    (broker, store, CancellationToken::new())
}

/// Poll `check` until it holds or `timeout` passes.
async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_scheduler_loop_promotes_due_jobs() {
    let (broker, store, shutdown) = start_broker(fast_config());
    let run = tokio::spawn({
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        async move { broker.run(shutdown).await }
    });

    let mut job = Job::new("Later")
        .with_args(vec![json!("x")])
        .at(Utc::now() + chrono::Duration::milliseconds(300));
    broker.manager().push(&mut job).unwrap();

    let queue = store.get_queue("default").unwrap();
    assert_eq!(queue.size(), 0);
    assert_eq!(store.scheduled().size(), 1);

    let promoted = wait_for(Duration::from_secs(3), || queue.size() == 1).await;
    assert!(promoted, "scheduled job was never promoted");
    assert_eq!(store.scheduled().size(), 0);

    let fetched = broker
        .manager()
        .fetch(&CancellationToken::new(), "w1", &["default"])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.jid, job.jid);
    assert!(fetched.at.is_none());

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reaper_loop_drops_silent_workers() {
    let (broker, _store, shutdown) = start_broker(fast_config());
    let run = tokio::spawn({
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        async move { broker.run(shutdown).await }
    });

    let closer = Arc::new(CountingCloser::default());
    let conn = ConnectionHandle::new(closer.clone());
    let client = ClientData {
        hostname: "localhost".to_string(),
        wid: "silent".to_string(),
        pid: 1,
        ..Default::default()
    };
    broker.workers().heartbeat(&client, Some(&conn)).unwrap();
    assert_eq!(broker.workers().count(), 1);

    let reaped = wait_for(Duration::from_secs(3), || broker.workers().count() == 0).await;
    assert!(reaped, "silent worker was never reaped");
    assert_eq!(closer.0.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_stops_on_shutdown_and_closes_store() {
    let (broker, store, shutdown) = start_broker(fast_config());
    let run = tokio::spawn({
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        async move { broker.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run did not stop after shutdown");
    result.unwrap().unwrap();

    let err = store.get_queue("default").unwrap_err();
    assert!(matches!(err.root(), BrokerError::StoreClosed));
}

#[tokio::test]
async fn test_run_with_already_cancelled_token() {
    let (broker, _store, shutdown) = start_broker(fast_config());
    shutdown.cancel();
    broker.run(shutdown).await.unwrap();
}

#[tokio::test]
async fn test_zero_interval_fails_at_startup() {
    for config in [
        fast_config().with_scheduler_interval(Duration::ZERO),
        fast_config().with_reap_interval(Duration::ZERO),
    ] {
        let (broker, store, shutdown) = start_broker(config);

        let result = tokio::time::timeout(Duration::from_secs(1), broker.run(shutdown))
            .await
            .expect("run should refuse to start instead of waiting for shutdown");

        let err = result.unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)), "{err}");
        // Nothing was started, so the store is still usable.
        assert!(store.get_queue("default").is_ok());
    }
}
