//! Feed Failover Integration Tests
//!
//! Poller supervision and primary feed failover against a local WebSocket
//! server standing in for the push feed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use ltp_feed_proxy::infrastructure::config::SupervisorSettings;
use ltp_feed_proxy::{
    AlternativePriceSource, FallbackPoller, FeedState, FeedSupervisor, LtpRegistry, PriceSource,
    PrimaryFeedClient, PrimaryFeedConfig, RetryConfig, SupervisedTask, TickReceiver,
};

// =============================================================================
// Fakes
// =============================================================================

/// Returns the same price for every symbol.
struct ConstantPrice {
    price: Decimal,
    lookups: AtomicUsize,
}

impl ConstantPrice {
    fn new(price: &str) -> Self {
        Self {
            price: price.parse().unwrap(),
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AlternativePriceSource for ConstantPrice {
    async fn fetch_ltp(&self, _symbol: &str) -> Option<Decimal> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Some(self.price)
    }
}

/// Answers only after `delay`, like a stuck secondary source.
struct SlowPrice {
    delay: Duration,
    price: Decimal,
}

#[async_trait]
impl AlternativePriceSource for SlowPrice {
    async fn fetch_ltp(&self, _symbol: &str) -> Option<Decimal> {
        tokio::time::sleep(self.delay).await;
        Some(self.price)
    }
}

/// A poller that never comes back up.
#[derive(Default)]
struct DeadTask {
    starts: AtomicU32,
    alive: AtomicBool,
}

impl SupervisedTask for DeadTask {
    fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
}

fn drain(rx: &mut TickReceiver) -> usize {
    let mut count = 0;
    while rx.try_recv().is_some() {
        count += 1;
    }
    count
}

// =============================================================================
// Supervision
// =============================================================================

#[tokio::test(start_paused = true)]
async fn stopped_poller_restarted_without_resubscription() {
    let registry = Arc::new(LtpRegistry::default());
    let (c1, mut rx1) = registry.open_connection();
    let (c2, mut rx2) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", Some("NIFTY26JAN26300CE"));
    registry.add_client(&c2, "NSE_FO|2", Some("NIFTY26JAN26400PE"));

    let poller = Arc::new(FallbackPoller::new(
        Arc::clone(&registry),
        Arc::new(ConstantPrice::new("99.5")),
        Duration::from_secs(1),
    ));
    let supervisor = Arc::new(FeedSupervisor::new(
        SupervisorSettings::default(),
        poller.clone(),
        CancellationToken::new(),
    ));
    supervisor.start();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(drain(&mut rx1) > 0);
    assert!(drain(&mut rx2) > 0);

    poller.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!poller.is_running());
    assert!(!supervisor.is_healthy());

    // Next check at 5s, restart 3s later
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(poller.is_running());
    assert!(supervisor.is_healthy());
    assert_eq!(supervisor.snapshot().poller_restarts, 1);

    drain(&mut rx1);
    drain(&mut rx2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(drain(&mut rx1) > 0);
    assert!(drain(&mut rx2) > 0);
}

#[tokio::test(start_paused = true)]
async fn feed_down_after_restart_budget_spent() {
    let task = Arc::new(DeadTask::default());
    let supervisor = Arc::new(FeedSupervisor::new(
        SupervisorSettings::default(),
        task.clone(),
        CancellationToken::new(),
    ));
    supervisor.start();

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(!supervisor.is_healthy());
    assert!(supervisor.snapshot().down);
    assert_eq!(supervisor.snapshot().poller_restarts, 5);
    assert_eq!(task.starts.load(Ordering::SeqCst), 6);

    // Recovery after DOWN does not make the feed healthy again
    task.alive.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!supervisor.is_healthy());
    assert_eq!(task.starts.load(Ordering::SeqCst), 6);
}

// =============================================================================
// Primary Feed
// =============================================================================

/// Accept one feed connection, wait for the client's first request, send
/// `frames`, then close.
async fn serve_one_connection(listener: TcpListener, frames: Vec<String>) {
    let (stream, _) = listener.accept().await.unwrap();
    drop(listener);
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    let first = ws.next().await.unwrap().unwrap();
    assert!(first.is_binary() || first.is_text());

    for frame in frames {
        ws.send(Message::Text(frame.into())).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = ws.close(None).await;
}

/// Accept `connections` feed connections in turn and return the first
/// request the client wrote on each before the server closed it.
async fn record_first_requests(
    listener: TcpListener,
    connections: usize,
) -> Vec<serde_json::Value> {
    let mut requests = Vec::new();

    for _ in 0..connections {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let request: serde_json::Value = match ws.next().await.unwrap().unwrap() {
            Message::Binary(bytes) => serde_json::from_slice(&bytes).unwrap(),
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected first frame {other:?}"),
        };
        requests.push(request);

        let _ = ws.close(None).await;
    }

    requests
}

fn feed_config(url: String) -> PrimaryFeedConfig {
    PrimaryFeedConfig {
        reconnect: RetryConfig::fixed(Duration::from_millis(20), 2),
        ..PrimaryFeedConfig::with_url(url)
    }
}

#[tokio::test]
async fn zero_ltp_falls_back_to_previous_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let frame = serde_json::json!({
        "type": "live_feed",
        "feeds": {"NSE_FO|1": {"ltpc": {"ltp": 0, "cp": 45.2}}}
    })
    .to_string();
    let server = tokio::spawn(serve_one_connection(listener, vec![frame]));

    let registry = Arc::new(LtpRegistry::default());
    let (c1, mut rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", None);

    let fetcher = Arc::new(ConstantPrice::new("1"));
    let (client, _handle) = PrimaryFeedClient::new(
        feed_config(url),
        Arc::clone(&registry),
        fetcher.clone(),
        CancellationToken::new(),
    );
    let status = client.status();
    let run = tokio::spawn(client.run());

    let tick = timeout(Duration::from_secs(5), rx1.recv()).await.unwrap().unwrap();

    assert_eq!(tick.instrument, "NSE_FO|1");
    assert_eq!(tick.price, "45.2".parse::<Decimal>().unwrap());
    assert_eq!(tick.source, PriceSource::Primary);
    assert_eq!(fetcher.lookups.load(Ordering::SeqCst), 0);

    server.await.unwrap();
    let _ = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert_eq!(status.state(), FeedState::Degraded);
}

#[tokio::test]
async fn primary_loss_routes_everything_to_fallback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let frame = serde_json::json!({
        "type": "live_feed",
        "feeds": {"NSE_FO|1": {"ltpc": {"ltp": 101.5}}}
    })
    .to_string();
    let server = tokio::spawn(serve_one_connection(listener, vec![frame]));

    let registry = Arc::new(LtpRegistry::default());
    let (c1, mut rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", Some("NIFTY"));
    assert_eq!(registry.fallback_targets().len(), 1);

    let (client, _handle) = PrimaryFeedClient::new(
        feed_config(url),
        Arc::clone(&registry),
        Arc::new(ConstantPrice::new("1")),
        CancellationToken::new(),
    );
    let run = tokio::spawn(client.run());

    let tick = timeout(Duration::from_secs(5), rx1.recv()).await.unwrap().unwrap();
    assert_eq!(tick.source, PriceSource::Primary);
    // Primary has priced the instrument; fallback no longer polls it
    assert!(registry.fallback_targets().is_empty());

    server.await.unwrap();
    let result = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();

    assert!(result.is_err());
    assert_eq!(
        registry.fallback_targets(),
        vec![("NSE_FO|1".to_string(), "NIFTY".to_string())]
    );
}

#[tokio::test]
async fn closed_segment_routes_to_fallback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let frames = vec![
        serde_json::json!({
            "type": "live_feed",
            "feeds": {"NSE_FO|1": {"ltpc": {"ltp": 10.0}}}
        })
        .to_string(),
        serde_json::json!({
            "type": "market_info",
            "marketInfo": {"segmentStatus": {"NSE_FO": "NORMAL_CLOSE"}}
        })
        .to_string(),
    ];
    let server = tokio::spawn(serve_one_connection(listener, frames));

    let registry = Arc::new(LtpRegistry::default());
    let (c1, mut rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", None);

    let cancel = CancellationToken::new();
    let (client, _handle) = PrimaryFeedClient::new(
        feed_config(url),
        Arc::clone(&registry),
        Arc::new(ConstantPrice::new("1")),
        cancel.clone(),
    );
    let status = client.status();
    let run = tokio::spawn(client.run());

    timeout(Duration::from_secs(5), rx1.recv()).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), async {
        while status.snapshot().segments.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(registry.fallback_targets().len(), 1);

    cancel.cancel();
    server.await.unwrap();
    let _ = timeout(Duration::from_secs(5), run).await.unwrap();
}

#[tokio::test]
async fn reconnect_resubscribes_live_instruments() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(record_first_requests(listener, 2));

    let registry = Arc::new(LtpRegistry::default());
    let (c1, _rx1) = registry.open_connection();
    let (c2, _rx2) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", None);
    registry.add_client(&c2, "NSE_FO|2", Some("NIFTY26JAN26400PE"));

    let (client, _handle) = PrimaryFeedClient::new(
        feed_config(url),
        Arc::clone(&registry),
        Arc::new(ConstantPrice::new("1")),
        CancellationToken::new(),
    );
    let run = tokio::spawn(client.run());

    let requests = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();

    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request["method"], "sub");
        assert_eq!(request["data"]["mode"], "ltpc");
        let mut keys: Vec<String> =
            serde_json::from_value(request["data"]["instrumentKeys"].clone()).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["NSE_FO|1", "NSE_FO|2"]);
    }
    assert_ne!(requests[0]["guid"], requests[1]["guid"]);

    run.abort();
}

#[tokio::test]
async fn slow_lookup_does_not_delay_healthy_instruments() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let frames = vec![
        serde_json::json!({
            "type": "live_feed",
            "feeds": {"NSE_FO|A": {"ltpc": {"ltp": 0}}}
        })
        .to_string(),
        serde_json::json!({
            "type": "live_feed",
            "feeds": {"NSE_FO|B": {"ltpc": {"ltp": 10.5}}}
        })
        .to_string(),
    ];
    let server = tokio::spawn(serve_one_connection(listener, frames));

    let registry = Arc::new(LtpRegistry::default());
    let (ca, mut rx_a) = registry.open_connection();
    let (cb, mut rx_b) = registry.open_connection();
    registry.add_client(&ca, "NSE_FO|A", None);
    registry.add_client(&cb, "NSE_FO|B", None);

    let (client, _handle) = PrimaryFeedClient::new(
        feed_config(url),
        Arc::clone(&registry),
        Arc::new(SlowPrice {
            delay: Duration::from_secs(3),
            price: "7.25".parse().unwrap(),
        }),
        CancellationToken::new(),
    );
    let started = Instant::now();
    let run = tokio::spawn(client.run());

    let tick = timeout(Duration::from_secs(5), rx_b.recv()).await.unwrap().unwrap();

    assert_eq!(tick.price, "10.5".parse::<Decimal>().unwrap());
    assert_eq!(tick.source, PriceSource::Primary);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "healthy price took {:?}",
        started.elapsed()
    );

    // The slow lookup still lands for the unpriced instrument
    let tick = timeout(Duration::from_secs(5), rx_a.recv()).await.unwrap().unwrap();
    assert_eq!(tick.price, "7.25".parse::<Decimal>().unwrap());
    assert_eq!(tick.source, PriceSource::Fallback);

    server.await.unwrap();
    run.abort();
}
