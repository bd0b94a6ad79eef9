//! LTP Feed Proxy Binary
//!
//! Starts the price fan-out service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ltp-feed-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Primary feed (optional)
//! - `LTP_PROXY_PRIMARY_ENABLED`: Run the Upstox feed (default: false)
//! - `UPSTOX_ACCESS_TOKEN`: Bearer token for feed authorisation
//! - `UPSTOX_FEED_URL`: Fixed socket URL, skips authorisation
//! - `LTP_PROXY_FEED_MODE`: ltpc | full (default: ltpc)
//!
//! ## Fallback
//! - `GROWW_BASE_URL`: Secondary source base URL (default: <https://groww.in>)
//! - `LTP_PROXY_POLL_INTERVAL_MS`: Poll interval (default: 1000)
//!
//! ## Server
//! - `LTP_PROXY_HTTP_PORT`: WebSocket and health port (default: 8090)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ltp_feed_proxy::application::ports::{AlternativePriceSource, UpstreamFeed};
use ltp_feed_proxy::infrastructure::telemetry;
use ltp_feed_proxy::{
    AppState, FallbackPoller, FeedSupervisor, GrowwPriceFetcher, HttpServer, LtpRegistry,
    PrimaryFeedClient, PrimaryFeedConfig, ProxyConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv_from_ancestors();

    let _telemetry_guard = telemetry::init().context("failed to initialise telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting LTP feed proxy");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = ProxyConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let registry = Arc::new(LtpRegistry::new(config.registry.registry_config()));

    let fetcher: Arc<dyn AlternativePriceSource> = Arc::new(
        GrowwPriceFetcher::new(&config.fallback).context("failed to build fallback HTTP client")?,
    );

    let poller = Arc::new(FallbackPoller::new(
        Arc::clone(&registry),
        Arc::clone(&fetcher),
        config.fallback.poll_interval,
    ));

    let mut supervisor = FeedSupervisor::new(
        config.supervisor.clone(),
        poller.clone(),
        shutdown_token.child_token(),
    );

    if config.primary.enabled {
        let (client, handle) = PrimaryFeedClient::new(
            PrimaryFeedConfig::from_settings(&config.primary),
            Arc::clone(&registry),
            Arc::clone(&fetcher),
            shutdown_token.child_token(),
        );
        let upstream: Arc<dyn UpstreamFeed> = Arc::new(handle);
        registry.attach_upstream(upstream, config.primary.mode);
        supervisor = supervisor.with_primary(client);
    } else {
        tracing::info!("Primary feed disabled, serving from fallback only");
    }

    let supervisor = Arc::new(supervisor);
    supervisor.start();

    let state = Arc::new(AppState::new(
        env!("CARGO_PKG_VERSION"),
        Arc::clone(&registry),
        Arc::clone(&supervisor),
        shutdown_token.clone(),
    ));
    let server = HttpServer::new(config.server.http_port, state, shutdown_token.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("LTP feed proxy ready");

    await_shutdown(&shutdown_token).await;

    poller.stop();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server_task).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "HTTP server did not stop in time"
        );
    }

    tracing::info!("LTP feed proxy stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        http_port = config.server.http_port,
        primary_enabled = config.primary.enabled,
        feed_mode = config.primary.mode.as_str(),
        poll_interval_ms = config.fallback.poll_interval.as_millis(),
        max_restarts = config.supervisor.max_restart_attempts,
        "Configuration loaded"
    );
    tracing::debug!(
        fallback_base_url = %config.fallback.base_url,
        authorize_url = %config.primary.authorize_url,
        fixed_feed_url = config.primary.feed_url.is_some(),
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGINT or SIGTERM, then cancel the shutdown token.
async fn await_shutdown(shutdown_token: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
