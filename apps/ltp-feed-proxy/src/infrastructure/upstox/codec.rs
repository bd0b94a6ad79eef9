//! Primary Feed Codec
//!
//! Decodes inbound frames into [`FeedEvent`] at the adapter boundary and
//! encodes subscription requests as binary frames.
//!
//! Feed entries are decoded independently: one malformed instrument is
//! logged and skipped while the rest of the batch goes through.

use tokio_tungstenite::tungstenite::Message;

use super::messages::{
    FeedEvent, FeedRequest, InstrumentFeed, PriceQuote, RawFeedEvent, number_to_decimal,
};
use crate::domain::market::SegmentStatus;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame payload was not valid UTF-8.
    #[error("invalid UTF-8 in binary frame")]
    InvalidUtf8,
}

/// Decode a JSON event frame.
///
/// # Errors
///
/// Returns an error only when the envelope itself is not valid JSON.
pub fn decode(text: &str) -> Result<FeedEvent, CodecError> {
    let raw: RawFeedEvent = serde_json::from_str(text.trim())?;

    let event = match raw.kind.as_str() {
        "market_info" => {
            let statuses = raw
                .market_info
                .map(|info| {
                    info.segment_status
                        .into_iter()
                        .map(|(segment, status)| {
                            let parsed = SegmentStatus::from_upstream(&status);
                            (segment, parsed)
                        })
                        .collect()
                })
                .unwrap_or_default();
            FeedEvent::MarketStatus(statuses)
        }
        "live_feed" | "initial_feed" => FeedEvent::Prices(decode_feeds(raw.feeds)),
        other => FeedEvent::Unknown(other.to_string()),
    };

    Ok(event)
}

/// Decode a binary frame carrying the same JSON payload.
///
/// # Errors
///
/// Returns an error if the payload is not UTF-8 or not valid JSON.
pub fn decode_binary(bytes: &[u8]) -> Result<FeedEvent, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    decode(text)
}

fn decode_feeds(feeds: std::collections::HashMap<String, serde_json::Value>) -> Vec<PriceQuote> {
    feeds
        .into_iter()
        .filter_map(|(instrument, value)| {
            match serde_json::from_value::<InstrumentFeed>(value) {
                Ok(feed) => {
                    let ltpc = feed.ltpc();
                    Some(PriceQuote {
                        ltp: ltpc.and_then(|l| l.ltp.as_ref()).and_then(number_to_decimal),
                        close: ltpc.and_then(|l| l.cp.as_ref()).and_then(number_to_decimal),
                        instrument,
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        instrument = %instrument,
                        error = %e,
                        "Skipping malformed feed entry"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Encode a subscription request as a binary frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(request: &FeedRequest) -> Result<Message, CodecError> {
    let bytes = serde_json::to_vec(request)?;
    Ok(Message::Binary(bytes.into()))
}
