//! LTP Subscription Registry
//!
//! Shared state between the serving layer, the primary feed adapter and the
//! fallback poller. Owns:
//!
//! - connection interest and display symbols (`SubscriptionBook`)
//! - fallback routing (`FallbackRouting`)
//! - one single-slot latest-price mailbox per client connection
//!
//! All mutation happens behind a single mutex. Fan-out overwrites each
//! mailbox without waiting, so a slow client skips intermediate prices and
//! always reads the most recent one. Upstream subscribe/unsubscribe
//! requests are queued under the same lock and executed in order by one
//! dispatcher task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::retry::{RetryConfig, retry};
use crate::application::ports::{FeedMode, UpstreamError, UpstreamFeed};
use crate::domain::market::{InstrumentKey, PriceSource, PriceTick, SegmentStatus};
use crate::domain::subscription::{
    ConnectionId, FallbackRouting, SubscriptionBook, SubscriptionChanges,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Schedule for upstream subscribe/unsubscribe forwarding.
    pub forward_retry: RetryConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            forward_retry: RetryConfig::fixed(Duration::from_secs(2), 3),
        }
    }
}

// =============================================================================
// Client Connections
// =============================================================================

type TickSender = Arc<watch::Sender<Option<PriceTick>>>;

/// Non-owning delivery handle for one client connection.
///
/// The serving layer keeps the [`TickReceiver`] and writes ticks to its
/// socket; the registry only ever publishes.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    sender: TickSender,
}

impl ClientConnection {

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Receiving half of a connection's latest-price mailbox.
///
/// Holds at most one unread tick. A newer tick replaces an unread one.
#[derive(Debug)]
pub struct TickReceiver {
    inner: watch::Receiver<Option<PriceTick>>,
}

impl TickReceiver {
    /// Wait for the next unread tick.
    ///
    /// Returns `None` once the connection is deregistered and its handle
    /// dropped. Cancel safe.
    pub async fn recv(&mut self) -> Option<PriceTick> {
        loop {
            self.inner.changed().await.ok()?;
            if let Some(tick) = self.inner.borrow_and_update().clone() {
                return Some(tick);
            }
        }
    }

    /// Take the unread tick, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<PriceTick> {
        if !self.inner.has_changed().unwrap_or(false) {
            return None;
        }
        self.inner.borrow_and_update().clone()
    }
}

/// Registry size snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Registered connections.
    pub clients: usize,
    /// Instruments with at least one interested connection.
    pub instruments: usize,
    /// Instruments currently served by fallback.
    pub fallback_targets: usize,
}

// =============================================================================
// Upstream Commands
// =============================================================================

#[derive(Debug)]
enum UpstreamCommand {
    Subscribe(Vec<InstrumentKey>),
    Unsubscribe(Vec<InstrumentKey>),
}

impl UpstreamCommand {
    const fn method(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "sub",
            Self::Unsubscribe(_) => "unsub",
        }
    }

    fn instruments(&self) -> &[InstrumentKey] {
        match self {
            Self::Subscribe(keys) | Self::Unsubscribe(keys) => keys,
        }
    }

    async fn send_to(
        &self,
        upstream: &dyn UpstreamFeed,
        mode: FeedMode,
    ) -> Result<(), UpstreamError> {
        match self {
            Self::Subscribe(keys) => upstream.subscribe(keys, mode).await,
            Self::Unsubscribe(keys) => upstream.unsubscribe(keys).await,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    book: SubscriptionBook,
    routing: FallbackRouting,
    senders: HashMap<ConnectionId, TickSender>,
    upstream: Option<mpsc::UnboundedSender<UpstreamCommand>>,
}

impl RegistryState {
    /// Forget released instruments and queue upstream requests.
    fn apply(&mut self, changes: SubscriptionChanges) {
        for instrument in &changes.unsubscribe {
            self.routing.forget(instrument);
        }

        // Serve new instruments from fallback until the primary delivers
        if !self.routing.is_all() {
            for instrument in &changes.subscribe {
                self.routing.activate(instrument);
            }
        }

        let Some(upstream) = &self.upstream else {
            return;
        };

        if !changes.unsubscribe.is_empty()
            && upstream
                .send(UpstreamCommand::Unsubscribe(changes.unsubscribe))
                .is_err()
        {
            tracing::debug!("Upstream dispatcher gone, unsubscribe not forwarded");
        }
        if !changes.subscribe.is_empty()
            && upstream
                .send(UpstreamCommand::Subscribe(changes.subscribe))
                .is_err()
        {
            tracing::debug!("Upstream dispatcher gone, subscribe not forwarded");
        }
    }

    fn fallback_count(&self) -> usize {
        self.book
            .subscribed()
            .iter()
            .filter(|key| self.routing.routes(key))
            .count()
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            clients: self.senders.len(),
            instruments: self.book.instrument_count(),
            fallback_targets: self.fallback_count(),
        }
    }

    fn publish_sizes(&self) {
        let stats = self.stats();
        metrics::set_registry_sizes(stats.clients, stats.instruments, stats.fallback_targets);
    }
}

/// Subscription registry and per-instrument fan-out.
///
/// # Example
///
/// ```rust
/// use ltp_feed_proxy::application::services::registry::LtpRegistry;
/// use ltp_feed_proxy::domain::market::PriceSource;
/// use rust_decimal::Decimal;
///
/// let registry = LtpRegistry::default();
/// let (connection, mut rx) = registry.open_connection();
///
/// registry.add_client(&connection, "NSE_FO|12345", Some("NIFTY26JAN26300CE"));
/// registry.update_price("NSE_FO|12345", Decimal::new(18135, 2), PriceSource::Fallback);
///
/// let tick = rx.try_recv().unwrap();
/// assert_eq!(tick.price, Decimal::new(18135, 2));
///
/// // A slow reader only sees the most recent price
/// registry.update_price("NSE_FO|12345", Decimal::new(182, 0), PriceSource::Fallback);
/// registry.update_price("NSE_FO|12345", Decimal::new(183, 0), PriceSource::Fallback);
/// let tick = rx.try_recv().unwrap();
/// assert_eq!(tick.price, Decimal::new(183, 0));
/// assert!(rx.try_recv().is_none());
/// ```
#[derive(Debug)]
pub struct LtpRegistry {
    state: Mutex<RegistryState>,
    next_connection: AtomicU64,
    config: RegistryConfig,
}

impl Default for LtpRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl LtpRegistry {
    /// Create an empty registry with every instrument routed to fallback.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_connection: AtomicU64::new(1),
            config,
        }
    }

    /// Allocate a connection id and its latest-price mailbox.
    #[must_use]
    pub fn open_connection(&self) -> (ClientConnection, TickReceiver) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        let connection = ClientConnection {
            id,
            sender: Arc::new(sender),
        };
        (connection, TickReceiver { inner: receiver })
    }

    // -------------------------------------------------------------------------
    // Client interest
    // -------------------------------------------------------------------------

    /// Register a connection's interest in an instrument.
    ///
    /// Subscribes upstream on the instrument's first interest. A connection
    /// already watching another instrument is moved.
    pub fn add_client(
        &self,
        connection: &ClientConnection,
        instrument: &str,
        display_symbol: Option<&str>,
    ) {
        let mut state = self.state.lock();
        state
            .senders
            .insert(connection.id, Arc::clone(&connection.sender));

        let changes = state.book.add(connection.id, instrument, display_symbol);
        let first_interest = !changes.subscribe.is_empty();
        state.apply(changes);
        state.publish_sizes();

        tracing::info!(
            connection = connection.id,
            instrument,
            symbol = display_symbol.unwrap_or_default(),
            first_interest,
            "Client subscribed"
        );
    }

    /// Drop a connection. Unknown connections are ignored.
    pub fn remove_client(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        if state.senders.remove(&connection).is_none() {
            return;
        }

        let changes = state.book.remove(connection);
        let last_interest = !changes.unsubscribe.is_empty();
        state.apply(changes);
        state.publish_sizes();

        tracing::info!(connection, last_interest, "Client removed");
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Fan a price out to every connection interested in `instrument`.
    ///
    /// Returns the number of connections the tick was published to. An
    /// unread older tick is replaced. Connections whose receiver is gone are
    /// removed.
    pub fn update_price(&self, instrument: &str, price: Decimal, source: PriceSource) -> usize {
        let mut state = self.state.lock();

        let targets = state.book.connections_for(instrument);
        if targets.is_empty() {
            tracing::trace!(instrument, "No subscribers, price discarded");
            return 0;
        }

        metrics::record_price_update(source);
        let tick = PriceTick::new(instrument, price, source);

        let mut delivered = 0;
        let mut closed = Vec::new();

        for connection in targets {
            let Some(sender) = state.senders.get(&connection) else {
                continue;
            };

            if sender.send(Some(tick.clone())).is_ok() {
                delivered += 1;
            } else {
                closed.push(connection);
            }
        }

        for connection in closed {
            metrics::record_delivery_failure();
            tracing::info!(connection, instrument, "Client channel closed, removing");
            state.senders.remove(&connection);
            let changes = state.book.remove(connection);
            state.apply(changes);
        }

        state.publish_sizes();
        metrics::record_deliveries(source, delivered as u64);

        delivered
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Client-supplied display symbol, if any.
    #[must_use]
    pub fn get_display_symbol(&self, instrument: &str) -> Option<String> {
        self.state
            .lock()
            .book
            .display_symbol(instrument)
            .map(str::to_string)
    }

    /// Display symbol, derived from the key when none was supplied.
    #[must_use]
    pub fn resolve_display_symbol(&self, instrument: &str) -> String {
        self.state
            .lock()
            .book
            .resolve_display_symbol(instrument)
            .to_string()
    }

    /// Snapshot of live instruments.
    #[must_use]
    pub fn subscribed_instruments(&self) -> Vec<InstrumentKey> {
        self.state.lock().book.subscribed()
    }

    /// Whether an instrument has at least one interested connection.
    #[must_use]
    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.state.lock().book.is_subscribed(instrument)
    }

    /// Live instruments routed to fallback, paired with their display symbol.
    #[must_use]
    pub fn fallback_targets(&self) -> Vec<(InstrumentKey, String)> {
        let state = self.state.lock();
        state
            .book
            .subscribed()
            .into_iter()
            .filter(|key| state.routing.routes(key))
            .map(|key| {
                let symbol = state.book.resolve_display_symbol(&key).to_string();
                (key, symbol)
            })
            .collect()
    }

    /// Registry size snapshot.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.state.lock().stats()
    }

    // -------------------------------------------------------------------------
    // Fallback routing
    // -------------------------------------------------------------------------

    /// Route every live instrument to fallback.
    pub fn activate_fallback_for_all(&self) {
        let mut state = self.state.lock();
        if !state.routing.is_all() {
            tracing::warn!(
                instruments = state.book.instrument_count(),
                "Fallback activated for all instruments"
            );
        }
        state.routing.activate_all();
        state.publish_sizes();
    }

    /// Route one instrument to fallback.
    pub fn activate_fallback(&self, instrument: &str) {
        let mut state = self.state.lock();
        state.routing.activate(instrument);
        state.publish_sizes();
    }

    /// Record a segment status from the primary feed.
    pub fn set_segment_status(&self, segment: &str, status: SegmentStatus) {
        let mut state = self.state.lock();
        if state.routing.set_segment_status(segment, status) {
            let affected = state
                .book
                .subscribed()
                .iter()
                .filter(|key| crate::domain::market::segment_of(key) == Some(segment))
                .count();
            tracing::info!(segment, affected, "Segment closed, routing to fallback");
        }
        state.publish_sizes();
    }

    /// Primary feed reached `CONNECTED`.
    ///
    /// Live instruments stay on fallback until the primary prices them.
    pub fn primary_connected(&self) {
        let mut state = self.state.lock();
        let live = state.book.subscribed();
        state.routing.primary_connected(live);
        state.publish_sizes();
    }

    /// Primary feed delivered a usable price for an instrument.
    pub fn primary_price_received(&self, instrument: &str) {
        self.state.lock().routing.primary_price(instrument);
    }

    // -------------------------------------------------------------------------
    // Upstream forwarding
    // -------------------------------------------------------------------------

    /// Attach the primary feed and spawn the forwarding dispatcher.
    ///
    /// Replaces any previously attached feed.
    pub fn attach_upstream(
        &self,
        upstream: Arc<dyn UpstreamFeed>,
        mode: FeedMode,
    ) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().upstream = Some(tx);

        tokio::spawn(run_dispatcher(
            rx,
            upstream,
            mode,
            self.config.forward_retry.clone(),
        ))
    }
}

/// Execute upstream requests one at a time, in submission order.
async fn run_dispatcher(
    mut commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    upstream: Arc<dyn UpstreamFeed>,
    mode: FeedMode,
    schedule: RetryConfig,
) {
    while let Some(command) = commands.recv().await {
        if !upstream.is_active() {
            tracing::debug!(
                method = command.method(),
                instruments = ?command.instruments(),
                "Primary feed inactive, request not forwarded"
            );
            continue;
        }

        let feed = upstream.as_ref();
        let pending = &command;
        let result = retry(&schedule, move |_| pending.send_to(feed, mode)).await;

        match result {
            Ok(()) => tracing::debug!(
                method = command.method(),
                instruments = ?command.instruments(),
                "Upstream request sent"
            ),
            Err(error) => {
                metrics::record_upstream_failure(command.method());
                tracing::error!(
                    method = command.method(),
                    instruments = ?command.instruments(),
                    error = %error,
                    "Upstream request abandoned"
                );
            }
        }
    }

    tracing::debug!("Upstream dispatcher stopped");
}

// =============================================================================
// Tests
// =============================================================================
