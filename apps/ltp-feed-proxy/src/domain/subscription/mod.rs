//! Subscription Tracking
//!
//! Domain types for tracking which client connections want which instrument,
//! and which instruments are currently served by the fallback source.
//!
//! # Design
//!
//! The subscription book tracks:
//! - The single instrument each connection is interested in
//! - The set of connections interested in each instrument
//! - Display symbols supplied by clients
//!
//! An instrument is live while its connection set is non-empty. The book
//! reports 0→1 and 1→0 transitions so the caller can issue exactly one
//! upstream subscribe/unsubscribe per transition.
//!
//! These types hold no locks; the registry service serialises access.

use std::collections::{HashMap, HashSet};

use crate::domain::market::{InstrumentKey, SegmentStatus, derive_display_symbol, segment_of};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a client connection.
pub type ConnectionId = u64;

/// Upstream changes produced by a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Instruments that gained their first interested connection.
    pub subscribe: Vec<InstrumentKey>,
    /// Instruments that lost their last interested connection.
    pub unsubscribe: Vec<InstrumentKey>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    fn merge(&mut self, other: Self) {
        self.subscribe.extend(other.subscribe);
        self.unsubscribe.extend(other.unsubscribe);
    }
}

// =============================================================================
// Subscription Book
// =============================================================================

/// Connection ↔ instrument interest with display-symbol aliases.
///
/// # Example
///
/// ```rust
/// use ltp_feed_proxy::domain::subscription::SubscriptionBook;
///
/// let mut book = SubscriptionBook::default();
///
/// // First interest subscribes upstream
/// let changes = book.add(1, "NSE_FO|12345", Some("NIFTY26JAN26300CE"));
/// assert_eq!(changes.subscribe, vec!["NSE_FO|12345".to_string()]);
///
/// // A second connection on the same instrument changes nothing upstream
/// assert!(book.add(2, "NSE_FO|12345", None).is_empty());
///
/// // Last departure unsubscribes
/// assert!(book.remove(1).is_empty());
/// assert_eq!(book.remove(2).unsubscribe, vec!["NSE_FO|12345".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    /// Instrument each connection is interested in.
    connection_instrument: HashMap<ConnectionId, InstrumentKey>,
    /// Connections interested in each live instrument.
    instrument_connections: HashMap<InstrumentKey, HashSet<ConnectionId>>,
    /// Client-supplied display symbols of live instruments.
    display_symbols: HashMap<InstrumentKey, String>,
}

impl SubscriptionBook {
    /// Register a connection's interest in an instrument.
    ///
    /// Moves the interest if the connection already watched another
    /// instrument. A supplied display symbol overwrites any prior mapping.
    pub fn add(
        &mut self,
        connection: ConnectionId,
        instrument: &str,
        display_symbol: Option<&str>,
    ) -> SubscriptionChanges {
        if let Some(symbol) = display_symbol.filter(|s| !s.is_empty()) {
            self.display_symbols
                .insert(instrument.to_string(), symbol.to_string());
        }

        let mut changes = SubscriptionChanges::default();

        match self.connection_instrument.get(&connection) {
            Some(current) if current == instrument => return changes,
            Some(_) => changes.merge(self.remove(connection)),
            None => {}
        }

        self.connection_instrument
            .insert(connection, instrument.to_string());

        let connections = self
            .instrument_connections
            .entry(instrument.to_string())
            .or_default();
        connections.insert(connection);

        // First interest - needs upstream subscribe
        if connections.len() == 1 {
            changes.subscribe.push(instrument.to_string());
        }

        changes
    }

    /// Remove a connection from whatever instrument it watched.
    pub fn remove(&mut self, connection: ConnectionId) -> SubscriptionChanges {
        let Some(instrument) = self.connection_instrument.remove(&connection) else {
            return SubscriptionChanges::default();
        };

        let mut changes = SubscriptionChanges::default();

        if let Some(connections) = self.instrument_connections.get_mut(&instrument) {
            connections.remove(&connection);

            // Last interest removed - needs upstream unsubscribe
            if connections.is_empty() {
                self.instrument_connections.remove(&instrument);
                self.display_symbols.remove(&instrument);
                changes.unsubscribe.push(instrument);
            }
        }

        changes
    }

    /// Connections interested in an instrument.
    #[must_use]
    pub fn connections_for(&self, instrument: &str) -> Vec<ConnectionId> {
        self.instrument_connections
            .get(instrument)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Instrument a connection is interested in.
    #[must_use]
    pub fn instrument_of(&self, connection: ConnectionId) -> Option<&str> {
        self.connection_instrument
            .get(&connection)
            .map(String::as_str)
    }

    /// Whether an instrument has at least one interested connection.
    #[must_use]
    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.instrument_connections.contains_key(instrument)
    }

    /// All live instruments.
    #[must_use]
    pub fn subscribed(&self) -> Vec<InstrumentKey> {
        self.instrument_connections.keys().cloned().collect()
    }

    /// Client-supplied display symbol for an instrument.
    #[must_use]
    pub fn display_symbol(&self, instrument: &str) -> Option<&str> {
        self.display_symbols.get(instrument).map(String::as_str)
    }

    /// Display symbol, or one derived from the key when none was supplied.
    #[must_use]
    pub fn resolve_display_symbol<'a>(&'a self, instrument: &'a str) -> &'a str {
        self.display_symbol(instrument)
            .unwrap_or_else(|| derive_display_symbol(instrument))
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_instrument.len()
    }

    /// Number of live instruments.
    #[must_use]
    pub fn instrument_count(&self) -> usize {
        self.instrument_connections.len()
    }
}

// =============================================================================
// Fallback Routing
// =============================================================================

/// Decides which live instruments the fallback poller must serve.
///
/// An instrument is routed to fallback when any of these hold:
/// - the primary feed is absent, down or degraded (`all`)
/// - the primary feed lost it and has not delivered a price since
/// - its market segment is closed
#[derive(Debug)]
pub struct FallbackRouting {
    all: bool,
    instruments: HashSet<InstrumentKey>,
    closed_segments: HashSet<String>,
}

impl Default for FallbackRouting {
    /// Everything is routed to fallback until a primary feed reports in.
    fn default() -> Self {
        Self {
            all: true,
            instruments: HashSet::new(),
            closed_segments: HashSet::new(),
        }
    }
}

impl FallbackRouting {
    /// Route every live instrument to fallback.
    pub const fn activate_all(&mut self) {
        self.all = true;
    }

    /// Route a single instrument to fallback.
    pub fn activate(&mut self, instrument: &str) {
        self.instruments.insert(instrument.to_string());
    }

    /// Primary feed is live again.
    ///
    /// Currently live instruments stay on fallback until the primary
    /// delivers a price for each of them.
    pub fn primary_connected(&mut self, live: impl IntoIterator<Item = InstrumentKey>) {
        self.all = false;
        self.instruments.extend(live);
    }

    /// Primary delivered a usable price for an instrument.
    pub fn primary_price(&mut self, instrument: &str) {
        self.instruments.remove(instrument);
    }

    /// Record a segment status change.
    ///
    /// Returns `true` when the segment transitioned to closed.
    pub fn set_segment_status(&mut self, segment: &str, status: SegmentStatus) -> bool {
        match status {
            SegmentStatus::Closed => self.closed_segments.insert(segment.to_string()),
            SegmentStatus::Open => {
                self.closed_segments.remove(segment);
                false
            }
        }
    }

    /// Forget an instrument that has no more subscribers.
    pub fn forget(&mut self, instrument: &str) {
        self.instruments.remove(instrument);
    }

    /// Whether every instrument is routed to fallback.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.all
    }

    /// Whether a live instrument should be polled from fallback.
    #[must_use]
    pub fn routes(&self, instrument: &str) -> bool {
        self.all
            || self.instruments.contains(instrument)
            || segment_of(instrument).is_some_and(|s| self.closed_segments.contains(s))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NIFTY: &str = "NSE_FO|12345";
    const SENSEX: &str = "BSE_FO|67890";

    #[test]
    fn first_interest_subscribes() {
        let mut book = SubscriptionBook::default();

        let changes = book.add(1, NIFTY, None);

        assert_eq!(changes.subscribe, vec![NIFTY.to_string()]);
        assert!(changes.unsubscribe.is_empty());
        assert!(book.is_subscribed(NIFTY));
    }

    #[test]
    fn second_interest_no_upstream_change() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, None);

        let changes = book.add(2, NIFTY, None);

        assert!(changes.is_empty());
        assert_eq!(book.connections_for(NIFTY).len(), 2);
    }

    #[test]
    fn same_connection_same_instrument_is_idempotent() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, None);

        assert!(book.add(1, NIFTY, None).is_empty());
        assert_eq!(book.connection_count(), 1);
    }

    #[test]
    fn last_departure_unsubscribes_once() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, None);
        book.add(2, NIFTY, None);

        assert!(book.remove(1).is_empty());
        assert_eq!(book.remove(2).unsubscribe, vec![NIFTY.to_string()]);
        // Already gone - nothing further
        assert!(book.remove(2).is_empty());
        assert!(!book.is_subscribed(NIFTY));
    }

    #[test]
    fn remove_unknown_connection_no_changes() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, None);

        assert!(book.remove(99).is_empty());
        assert_eq!(book.instrument_count(), 1);
    }

    #[test]
    fn moving_interest_releases_previous_instrument() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, None);

        let changes = book.add(1, SENSEX, None);

        assert_eq!(changes.subscribe, vec![SENSEX.to_string()]);
        assert_eq!(changes.unsubscribe, vec![NIFTY.to_string()]);
        assert_eq!(book.instrument_of(1), Some(SENSEX));
        assert_eq!(book.instrument_count(), 1);
    }

    #[test]
    fn moving_interest_keeps_shared_instrument() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, None);
        book.add(2, NIFTY, None);

        let changes = book.add(1, SENSEX, None);

        assert!(changes.unsubscribe.is_empty());
        assert_eq!(book.connections_for(NIFTY), vec![2]);
    }

    #[test]
    fn display_symbol_overwrites_and_derives() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, Some("NIFTY26JAN26300CE"));
        book.add(2, NIFTY, Some("NIFTY26JAN26400CE"));

        assert_eq!(book.display_symbol(NIFTY), Some("NIFTY26JAN26400CE"));
        assert_eq!(book.display_symbol(SENSEX), None);
        assert_eq!(book.resolve_display_symbol(SENSEX), "67890");
    }

    #[test]
    fn display_symbol_released_with_last_interest() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, Some("NIFTY26JAN26300CE"));
        book.add(2, NIFTY, None);

        book.remove(1);
        assert_eq!(book.display_symbol(NIFTY), Some("NIFTY26JAN26300CE"));

        book.remove(2);
        assert_eq!(book.display_symbol(NIFTY), None);
        assert!(book.display_symbols.is_empty());
    }

    #[test]
    fn moving_interest_releases_previous_symbol() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, Some("NIFTY26JAN26300CE"));

        book.add(1, SENSEX, Some("SENSEX26JAN80000CE"));

        assert_eq!(book.display_symbol(NIFTY), None);
        assert_eq!(book.display_symbol(SENSEX), Some("SENSEX26JAN80000CE"));
        assert_eq!(book.display_symbols.len(), 1);
    }

    #[test]
    fn empty_display_symbol_ignored() {
        let mut book = SubscriptionBook::default();
        book.add(1, NIFTY, Some(""));

        assert_eq!(book.display_symbol(NIFTY), None);
    }

    #[test]
    fn routing_defaults_to_all() {
        let routing = FallbackRouting::default();

        assert!(routing.is_all());
        assert!(routing.routes(NIFTY));
    }

    #[test]
    fn routing_after_primary_connects() {
        let mut routing = FallbackRouting::default();

        routing.primary_connected(vec![NIFTY.to_string()]);

        assert!(!routing.is_all());
        assert!(routing.routes(NIFTY));
        assert!(!routing.routes(SENSEX));

        routing.primary_price(NIFTY);
        assert!(!routing.routes(NIFTY));
    }

    #[test]
    fn closed_segment_routes_its_instruments() {
        let mut routing = FallbackRouting::default();
        routing.primary_connected(Vec::new());

        assert!(routing.set_segment_status("NSE_FO", SegmentStatus::Closed));
        // Repeated close is not a transition
        assert!(!routing.set_segment_status("NSE_FO", SegmentStatus::Closed));

        assert!(routing.routes(NIFTY));
        assert!(!routing.routes(SENSEX));

        // A primary price does not override a closed segment
        routing.primary_price(NIFTY);
        assert!(routing.routes(NIFTY));

        routing.set_segment_status("NSE_FO", SegmentStatus::Open);
        assert!(!routing.routes(NIFTY));
    }

    #[test]
    fn activate_single_and_forget() {
        let mut routing = FallbackRouting::default();
        routing.primary_connected(Vec::new());

        routing.activate(SENSEX);
        assert!(routing.routes(SENSEX));

        routing.forget(SENSEX);
        assert!(!routing.routes(SENSEX));
    }
}
