//! HTTP Server
//!
//! Single axum listener serving the client price socket and the health
//! surface.
//!
//! # Endpoints
//!
//! - `GET /ws/ltp` - WebSocket price stream for one instrument per socket
//! - `GET /health` - JSON health report
//! - `GET /healthz` - Liveness probe
//! - `GET /readyz` - Readiness probe (supervisor health)
//! - `GET /metrics` - Prometheus metrics in text format

mod health;
mod socket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::registry::LtpRegistry;
use crate::infrastructure::supervisor::FeedSupervisor;

pub use health::{HealthResponse, HealthStatus};
pub use socket::SubscribeRequest;

// =============================================================================
// Shared State
// =============================================================================

/// State shared by every handler.
#[derive(Debug)]
pub struct AppState {
    version: String,
    started_at: Instant,
    registry: Arc<LtpRegistry>,
    supervisor: Arc<FeedSupervisor>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create handler state.
    #[must_use]
    pub fn new(
        version: impl Into<String>,
        registry: Arc<LtpRegistry>,
        supervisor: Arc<FeedSupervisor>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            version: version.into(),
            started_at: Instant::now(),
            registry,
            supervisor,
            shutdown,
        }
    }
}

/// Build the application router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/ltp", get(socket::ltp_socket_handler))
        .route("/health", get(health::health_handler))
        .route("/healthz", get(health::liveness_handler))
        .route("/readyz", get(health::readiness_handler))
        .route("/metrics", get(health::metrics_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// HTTP and WebSocket server.
#[derive(Debug)]
pub struct HttpServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a server bound to `port` once run.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the server stops with an
    /// I/O error.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the server stops with an I/O error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server failed while running.
    #[error("server failed: {0}")]
    ServerFailed(String),
}
