//! Upstox Market Data Feed Adapter
//!
//! WebSocket client for the primary push feed. Decodes status and price
//! events, forwards subscription requests and drives failover to the
//! fallback source when the connection is lost.

pub mod client;
pub mod codec;
pub mod messages;
pub mod status;

pub use client::{PrimaryFeedClient, PrimaryFeedConfig, PrimaryFeedError, PrimaryFeedHandle};
pub use status::{FeedStatus, FeedStatusSnapshot};
