//! Groww Secondary Price Source
//!
//! HTTP price lookups by display symbol and the polling loop that drives
//! them for every instrument routed to fallback.

pub mod fetcher;
pub mod poller;

pub use fetcher::{FetchError, GrowwPriceFetcher};
pub use poller::FallbackPoller;
