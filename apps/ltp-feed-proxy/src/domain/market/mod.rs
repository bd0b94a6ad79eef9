//! Market Data Types
//!
//! Core domain types for last-traded-price distribution: instrument keys,
//! display symbols, price ticks and feed/segment states. These types are
//! source-agnostic; both the primary push feed and the fallback poller
//! produce the same `PriceTick`.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;

// =============================================================================
// Instrument Identity
// =============================================================================

/// Canonical identifier for a tradable contract (e.g. `NSE_FO|12345`).
pub type InstrumentKey = String;

/// Separator between the segment prefix and the exchange token.
const KEY_SEPARATOR: char = '|';

/// Market segment of an instrument key (text before the first `|`).
///
/// Returns `None` for keys without a segment prefix.
#[must_use]
pub fn segment_of(key: &str) -> Option<&str> {
    key.split_once(KEY_SEPARATOR).map(|(segment, _)| segment)
}

/// Derive a display symbol by stripping the key's prefix.
///
/// `NSE_FO|NIFTY26JAN26300CE` becomes `NIFTY26JAN26300CE`; keys without a
/// separator are returned unchanged.
#[must_use]
pub fn derive_display_symbol(key: &str) -> &str {
    key.rsplit(KEY_SEPARATOR).next().unwrap_or(key)
}

// =============================================================================
// Price Ticks
// =============================================================================

/// Parse a price from its textual form, accepting scientific notation.
#[must_use]
pub fn parse_price(text: &str) -> Option<Decimal> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// Which upstream produced a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Low-latency push feed.
    Primary,
    /// Polled secondary source.
    Fallback,
}

impl PriceSource {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

/// A last-traded-price update for one instrument.
///
/// Serializes to the client wire shape `{"instrument": <key>, "ltp": <number>}`;
/// the source tag is internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceTick {
    /// Instrument the price belongs to.
    pub instrument: InstrumentKey,
    /// Last traded price.
    #[serde(rename = "ltp", with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Producer of the price.
    #[serde(skip)]
    pub source: PriceSource,
}

impl PriceTick {
    /// Create a new price tick.
    #[must_use]
    pub fn new(instrument: impl Into<InstrumentKey>, price: Decimal, source: PriceSource) -> Self {
        Self {
            instrument: instrument.into(),
            price,
            source,
        }
    }
}

// =============================================================================
// Feed State
// =============================================================================

/// Connection state of the primary push feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// Connect or handshake in progress.
    Connecting,
    /// Live and delivering events.
    Connected,
    /// Reconnect budget exhausted; fallback serves every instrument.
    Degraded,
}

impl FeedState {
    /// State name for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

/// Trading status of a market segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SegmentStatus {
    /// Segment is trading (including pre-open phases).
    Open,
    /// Segment is closed or closing.
    Closed,
}

impl SegmentStatus {
    /// Interpret an upstream status string such as `NORMAL_OPEN` or `CLOSING_END`.
    #[must_use]
    pub fn from_upstream(status: &str) -> Self {
        let status = status.to_uppercase();
        if status.contains("CLOS") {
            Self::Closed
        } else if status.contains("OPEN") {
            Self::Open
        } else {
            Self::Closed
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
