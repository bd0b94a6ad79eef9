#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! LTP Feed Proxy - Last Traded Price Fan-out with Feed Failover
//!
//! Keeps one upstream subscription per instrument regardless of how many
//! clients watch it, serves prices from the primary push feed while it is
//! healthy, and falls back to polling a secondary HTTP source when the
//! primary is down, an instrument stops receiving prices, or its market
//! segment closes.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Instrument keys, price ticks, subscription book and
//!   fallback routing
//!
//! - **Application**: Port traits and services
//!   - `ports`: primary feed and secondary price source interfaces
//!   - `services`: subscription registry, bounded retry helper
//!
//! - **Infrastructure**: Adapters and process surface
//!   - `upstox`: primary WebSocket feed client
//!   - `groww`: secondary price fetcher and fallback poller
//!   - `supervisor`: poller restarts and aggregate health
//!   - `server`: client WebSocket and health endpoints
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Upstox WS ──► PrimaryFeedClient ──┐
//!                                   ├──► LtpRegistry ──► mailbox ──► /ws/ltp
//! Groww HTTP ◄── FallbackPoller ────┘
//!                      ▲
//!               FeedSupervisor
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{FeedState, InstrumentKey, PriceSource, PriceTick, SegmentStatus};
pub use domain::subscription::ConnectionId;

// Ports
pub use application::ports::{AlternativePriceSource, FeedMode, UpstreamError, UpstreamFeed};

// Registry
pub use application::services::{
    ClientConnection, LtpRegistry, RegistryConfig, RegistryStats, RetryConfig, TickReceiver,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ProxyConfig};

// Adapters
pub use infrastructure::groww::{FallbackPoller, GrowwPriceFetcher};
pub use infrastructure::upstox::{
    FeedStatus, PrimaryFeedClient, PrimaryFeedConfig, PrimaryFeedError, PrimaryFeedHandle,
};

// Supervision and serving
pub use infrastructure::server::{AppState, HttpServer, ServerError, router};
pub use infrastructure::supervisor::{FeedSupervisor, SupervisedTask, SupervisorSnapshot};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
