//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the process
//! surface (configuration, HTTP server, telemetry).

/// Environment-driven configuration.
pub mod config;

/// Groww price fetcher and fallback poller.
pub mod groww;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Client WebSocket and health endpoints.
pub mod server;

/// Poller and primary feed supervision.
pub mod supervisor;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Upstox market data feed adapter.
pub mod upstox;
