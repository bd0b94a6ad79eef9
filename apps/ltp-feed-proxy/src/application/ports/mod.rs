//! Port Interfaces
//!
//! Contracts between the registry/poller and the price sources, following
//! the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamFeed`: subscription control on the primary push feed
//! - `AlternativePriceSource`: single-instrument lookup on the fallback source

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::market::InstrumentKey;

// =============================================================================
// Upstream Feed
// =============================================================================

/// Data granularity requested from the primary feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedMode {
    /// Last traded price and close only.
    #[default]
    Ltpc,
    /// Full market depth and OHLC.
    Full,
}

impl FeedMode {
    /// Parse a mode name, defaulting to `ltpc`.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "full" => Self::Full,
            _ => Self::Ltpc,
        }
    }

    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ltpc => "ltpc",
            Self::Full => "full",
        }
    }
}

/// Upstream subscription failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// No live connection to send the request over.
    #[error("primary feed not connected")]
    NotConnected,
    /// The connection task went away while the request was queued.
    #[error("primary feed connection closed")]
    Closed,
    /// The request could not be written.
    #[error("failed to send request: {0}")]
    Send(String),
}

/// Subscription control on the primary push feed.
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    /// Subscribe instruments over the live connection.
    async fn subscribe(
        &self,
        instruments: &[InstrumentKey],
        mode: FeedMode,
    ) -> Result<(), UpstreamError>;

    /// Unsubscribe instruments over the live connection.
    async fn unsubscribe(&self, instruments: &[InstrumentKey]) -> Result<(), UpstreamError>;

    /// Whether requests should be forwarded at all (false once degraded).
    fn is_active(&self) -> bool;
}

// =============================================================================
// Alternative Price Source
// =============================================================================

/// Point lookup against the secondary price source.
///
/// Implementations swallow their own errors: `None` covers no data, bad
/// status, timeouts and parse failures alike.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlternativePriceSource: Send + Sync {
    /// Latest price for a display symbol.
    async fn fetch_ltp(&self, symbol: &str) -> Option<Decimal>;
}
