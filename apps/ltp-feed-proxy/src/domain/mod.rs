//! Domain Layer - Core price distribution types and rules.
//!
//! This layer contains the source-agnostic types for last-traded-price
//! distribution with no I/O. All types here are pure Rust with
//! serialization support.

/// Instrument keys, price ticks, feed and segment states.
pub mod market;

/// Connection interest tracking and fallback routing.
pub mod subscription;
