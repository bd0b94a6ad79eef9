//! Application Layer - Use cases and port definitions.
//!
//! Services here coordinate domain state with the upstream feeds through
//! the port traits; they never name a concrete adapter.

/// Port interfaces for the primary feed and the secondary price source.
pub mod ports;

/// Subscription registry and the shared retry helper.
pub mod services;
