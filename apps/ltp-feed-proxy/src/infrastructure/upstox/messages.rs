//! Upstox Market Data Feed Message Types
//!
//! Wire types for the primary push feed. Inbound events are JSON objects
//! tagged by `type`:
//!
//! - `market_info`: segment statuses under `marketInfo.segmentStatus`
//! - `live_feed` / `initial_feed`: per-instrument blocks under `feeds`
//!
//! Each instrument block carries an `ltpc` object either directly or nested
//! in `fullFeed.marketFF` (tradables) / `fullFeed.indexFF` (indices).
//!
//! Outbound requests are `{"guid", "method", "data": {"mode", "instrumentKeys"}}`.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::application::ports::FeedMode;
use crate::domain::market::{InstrumentKey, SegmentStatus, parse_price};

// =============================================================================
// Inbound Wire Types
// =============================================================================

/// Envelope shared by every inbound event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFeedEvent {
    /// Event type discriminator.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Present on `market_info` events.
    #[serde(default)]
    pub market_info: Option<MarketInfo>,
    /// Present on feed events; entries are decoded one by one.
    #[serde(default)]
    pub feeds: HashMap<String, serde_json::Value>,
}

/// Market segment status block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketInfo {
    /// Segment name to upstream status string.
    #[serde(default)]
    pub segment_status: HashMap<String, String>,
}

/// Per-instrument feed block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentFeed {
    /// Present in `ltpc` mode.
    #[serde(default)]
    pub ltpc: Option<Ltpc>,
    /// Present in `full` mode.
    #[serde(default)]
    pub full_feed: Option<FullFeed>,
}

/// `full` mode payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FullFeed {
    /// Tradable instrument block.
    #[serde(rename = "marketFF", default)]
    pub market_ff: Option<FeedBlock>,
    /// Index block.
    #[serde(rename = "indexFF", default)]
    pub index_ff: Option<FeedBlock>,
}

/// Block that carries an `ltpc` object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedBlock {
    /// Last traded price and close.
    #[serde(default)]
    pub ltpc: Option<Ltpc>,
}

/// Last traded price, time, quantity and previous close.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ltpc {
    /// Last traded price.
    #[serde(default)]
    pub ltp: Option<serde_json::Number>,
    /// Last trade time (epoch millis, sent as string).
    #[serde(default)]
    pub ltt: Option<String>,
    /// Previous close.
    #[serde(default)]
    pub cp: Option<serde_json::Number>,
}

impl InstrumentFeed {
    /// The `ltpc` block wherever it sits.
    #[must_use]
    pub fn ltpc(&self) -> Option<&Ltpc> {
        self.ltpc.as_ref().or_else(|| {
            let full = self.full_feed.as_ref()?;
            full.market_ff
                .as_ref()
                .and_then(|b| b.ltpc.as_ref())
                .or_else(|| full.index_ff.as_ref().and_then(|b| b.ltpc.as_ref()))
        })
    }
}

/// Convert a JSON number to a decimal without going through `f64` arithmetic.
#[must_use]
pub fn number_to_decimal(number: &serde_json::Number) -> Option<Decimal> {
    parse_price(&number.to_string())
}

// =============================================================================
// Decoded Events
// =============================================================================

/// Price fields for one instrument from a feed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    /// Instrument the quote belongs to.
    pub instrument: InstrumentKey,
    /// Last traded price, if sent.
    pub ltp: Option<Decimal>,
    /// Previous close, if sent.
    pub close: Option<Decimal>,
}

impl PriceQuote {
    /// `ltp` when non-zero, else the previous close when non-zero.
    #[must_use]
    pub fn usable_price(&self) -> Option<Decimal> {
        self.ltp
            .filter(|p| !p.is_zero())
            .or_else(|| self.close.filter(|p| !p.is_zero()))
    }
}

/// Primary feed event after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Segment status refresh.
    MarketStatus(Vec<(String, SegmentStatus)>),
    /// Price batch (malformed entries already dropped).
    Prices(Vec<PriceQuote>),
    /// Any other event type.
    Unknown(String),
}

// =============================================================================
// Outbound Requests
// =============================================================================

/// Subscription request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMethod {
    /// Subscribe.
    Sub,
    /// Unsubscribe.
    Unsub,
}

/// Request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    /// Feed mode; omitted on unsubscribe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    /// Target instruments.
    pub instrument_keys: Vec<InstrumentKey>,
}

/// Subscription request sent over the feed socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedRequest {
    /// Unique request id.
    pub guid: String,
    /// Request method.
    pub method: RequestMethod,
    /// Request payload.
    pub data: RequestData,
}

impl FeedRequest {
    /// Build a subscribe request.
    #[must_use]
    pub fn subscribe(instruments: Vec<InstrumentKey>, mode: FeedMode) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            method: RequestMethod::Sub,
            data: RequestData {
                mode: Some(mode.as_str()),
                instrument_keys: instruments,
            },
        }
    }

    /// Build an unsubscribe request.
    #[must_use]
    pub fn unsubscribe(instruments: Vec<InstrumentKey>) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            method: RequestMethod::Unsub,
            data: RequestData {
                mode: None,
                instrument_keys: instruments,
            },
        }
    }
}

// =============================================================================
// Authorisation
// =============================================================================

/// Response of the feed authorisation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    /// Response payload.
    pub data: AuthorizeData,
}

/// Authorised socket location.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeData {
    /// One-time WebSocket URL.
    pub authorized_redirect_uri: String,
}
