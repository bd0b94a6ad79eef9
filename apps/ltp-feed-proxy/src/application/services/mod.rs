//! Application Services
//!
//! - `registry`: client interest, fallback routing and price fan-out
//! - `retry`: bounded retry schedule shared by upstream forwarding and
//!   primary feed reconnects

pub mod registry;
pub mod retry;

pub use registry::{ClientConnection, LtpRegistry, RegistryConfig, RegistryStats, TickReceiver};
pub use retry::{RetryConfig, RetryError, RetryPolicy, retry};
