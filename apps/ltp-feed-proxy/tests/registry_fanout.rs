//! Registry Fan-out Integration Tests
//!
//! Upstream subscription reference counting, per-connection delivery and
//! fallback pricing through the public registry API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use ltp_feed_proxy::{
    AlternativePriceSource, FallbackPoller, FeedMode, InstrumentKey, LtpRegistry, PriceSource,
    RegistryConfig, RetryConfig, UpstreamError, UpstreamFeed,
};

// =============================================================================
// Fakes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Sub(Vec<InstrumentKey>),
    Unsub(Vec<InstrumentKey>),
}

#[derive(Default)]
struct RecordingFeed {
    calls: Mutex<Vec<Call>>,
}

impl RecordingFeed {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn count(&self, wanted: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == wanted).count()
    }
}

#[async_trait]
impl UpstreamFeed for RecordingFeed {
    async fn subscribe(
        &self,
        instruments: &[InstrumentKey],
        _mode: FeedMode,
    ) -> Result<(), UpstreamError> {
        self.calls.lock().push(Call::Sub(instruments.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&self, instruments: &[InstrumentKey]) -> Result<(), UpstreamError> {
        self.calls.lock().push(Call::Unsub(instruments.to_vec()));
        Ok(())
    }

    fn is_active(&self) -> bool {
        true
    }
}

/// Prices keyed by display symbol.
#[derive(Default)]
struct SymbolPrices {
    prices: Mutex<HashMap<String, Decimal>>,
    lookups: Mutex<Vec<String>>,
}

impl SymbolPrices {
    fn with(symbol: &str, price: &str) -> Self {
        let source = Self::default();
        source.prices.lock().insert(symbol.to_string(), price.parse().unwrap());
        source
    }
}

#[async_trait]
impl AlternativePriceSource for SymbolPrices {
    async fn fetch_ltp(&self, symbol: &str) -> Option<Decimal> {
        self.lookups.lock().push(symbol.to_string());
        self.prices.lock().get(symbol).copied()
    }
}

fn sub(key: &str) -> Call {
    Call::Sub(vec![key.to_string()])
}

fn unsub(key: &str) -> Call {
    Call::Unsub(vec![key.to_string()])
}

fn registry_with_feed() -> (Arc<LtpRegistry>, Arc<RecordingFeed>) {
    let registry = Arc::new(LtpRegistry::new(RegistryConfig {
        forward_retry: RetryConfig::fixed(Duration::from_millis(5), 3),
    }));
    let feed = Arc::new(RecordingFeed::default());
    registry.attach_upstream(feed.clone(), FeedMode::Ltpc);
    (registry, feed)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// =============================================================================
// Upstream Reference Counting
// =============================================================================

#[tokio::test]
async fn one_upstream_subscribe_per_interest_period() {
    let (registry, feed) = registry_with_feed();
    let (c1, _rx1) = registry.open_connection();
    let (c2, _rx2) = registry.open_connection();
    let (c3, _rx3) = registry.open_connection();

    registry.add_client(&c1, "NSE_FO|12345", None);
    registry.add_client(&c2, "NSE_FO|12345", None);
    registry.add_client(&c3, "NSE_FO|12345", None);
    settle().await;

    assert_eq!(feed.calls(), vec![sub("NSE_FO|12345")]);

    registry.remove_client(c1.id());
    registry.remove_client(c2.id());
    settle().await;
    assert_eq!(feed.count(&unsub("NSE_FO|12345")), 0);

    registry.remove_client(c3.id());
    settle().await;
    assert_eq!(feed.calls(), vec![sub("NSE_FO|12345"), unsub("NSE_FO|12345")]);

    // A new interest period subscribes again
    let (c4, _rx4) = registry.open_connection();
    registry.add_client(&c4, "NSE_FO|12345", None);
    settle().await;
    assert_eq!(feed.count(&sub("NSE_FO|12345")), 2);
}

#[tokio::test]
async fn removing_unknown_connection_is_ignored() {
    let (registry, feed) = registry_with_feed();
    let (c1, _rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", None);

    registry.remove_client(c1.id());
    registry.remove_client(c1.id());
    registry.remove_client(9_999);
    settle().await;

    assert_eq!(feed.count(&unsub("NSE_FO|1")), 1);
}

#[tokio::test]
async fn moving_connection_releases_previous_instrument() {
    let (registry, feed) = registry_with_feed();
    let (c1, _rx1) = registry.open_connection();

    registry.add_client(&c1, "NSE_FO|1", None);
    registry.add_client(&c1, "NSE_FO|2", None);
    settle().await;

    assert_eq!(feed.calls(), vec![sub("NSE_FO|1"), unsub("NSE_FO|1"), sub("NSE_FO|2")]);
    assert!(!registry.is_subscribed("NSE_FO|1"));
    assert!(registry.is_subscribed("NSE_FO|2"));
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn update_without_interest_is_noop() {
    let registry = LtpRegistry::default();
    let (c1, mut rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", None);

    let delivered = registry.update_price("NSE_FO|2", Decimal::new(100, 0), PriceSource::Primary);

    assert_eq!(delivered, 0);
    assert!(rx1.try_recv().is_none());
    assert_eq!(registry.stats().clients, 1);
}

#[tokio::test]
async fn each_interested_connection_gets_one_delivery() {
    let registry = LtpRegistry::default();
    let (c1, mut rx1) = registry.open_connection();
    let (c2, mut rx2) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", None);
    registry.add_client(&c2, "NSE_FO|1", None);

    let delivered = registry.update_price("NSE_FO|1", Decimal::new(2415, 1), PriceSource::Primary);

    assert_eq!(delivered, 2);
    assert_eq!(rx1.try_recv().unwrap().price, Decimal::new(2415, 1));
    assert_eq!(rx2.try_recv().unwrap().price, Decimal::new(2415, 1));
    assert!(rx1.try_recv().is_none());
    assert!(rx2.try_recv().is_none());
}

#[tokio::test]
async fn failed_delivery_isolated_to_one_connection() {
    let registry = LtpRegistry::default();
    let (c1, rx1) = registry.open_connection();
    let (c2, mut rx2) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", None);
    registry.add_client(&c2, "NSE_FO|1", None);
    drop(c1);
    drop(rx1);

    let delivered = registry.update_price("NSE_FO|1", Decimal::new(5, 0), PriceSource::Fallback);

    assert_eq!(delivered, 1);
    assert_eq!(rx2.try_recv().unwrap().price, Decimal::new(5, 0));
    // The failed connection was deregistered
    assert_eq!(registry.stats().clients, 1);
}

// =============================================================================
// Fallback Pricing
// =============================================================================

#[tokio::test]
async fn fallback_price_reaches_client_as_json() {
    let registry = Arc::new(LtpRegistry::default());
    let (c1, mut rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|12345", Some("NIFTY26JAN26300CE"));

    let source = Arc::new(SymbolPrices::with("NIFTY26JAN26300CE", "181.35"));
    let poller = FallbackPoller::new(Arc::clone(&registry), source.clone(), Duration::from_secs(1));

    assert_eq!(poller.poll_once().await, 1);

    let tick = rx1.try_recv().unwrap();
    assert_eq!(tick.source, PriceSource::Fallback);
    assert_eq!(
        serde_json::to_value(&tick).unwrap(),
        serde_json::json!({"instrument": "NSE_FO|12345", "ltp": 181.35})
    );
    assert_eq!(source.lookups.lock().clone(), vec!["NIFTY26JAN26300CE".to_string()]);
}

#[tokio::test]
async fn fallback_lookup_derives_symbol_from_key() {
    let registry = Arc::new(LtpRegistry::default());
    let (c1, mut rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|NIFTY26JAN26400PE", None);

    let source = Arc::new(SymbolPrices::with("NIFTY26JAN26400PE", "12.05"));
    let poller = FallbackPoller::new(Arc::clone(&registry), source, Duration::from_secs(1));

    poller.poll_once().await;

    assert_eq!(rx1.try_recv().unwrap().price, "12.05".parse::<Decimal>().unwrap());
}

#[tokio::test]
async fn fallback_result_after_last_client_left_is_discarded() {
    let registry = Arc::new(LtpRegistry::default());
    let (c1, _rx1) = registry.open_connection();
    registry.add_client(&c1, "NSE_FO|1", Some("NIFTY"));
    registry.remove_client(c1.id());

    let delivered = registry.update_price("NSE_FO|1", Decimal::ONE, PriceSource::Fallback);

    assert_eq!(delivered, 0);
    assert!(registry.fallback_targets().is_empty());
}
