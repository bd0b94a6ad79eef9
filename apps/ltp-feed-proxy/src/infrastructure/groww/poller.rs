//! Fallback Poller
//!
//! Periodically prices every instrument the registry routes to fallback.
//! Lookups within a cycle run concurrently; one failing instrument never
//! holds back the others.
//!
//! The `running` flag is owned by a drop guard inside the loop task, so it
//! clears on every exit path including a panic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::application::ports::AlternativePriceSource;
use crate::application::services::registry::LtpRegistry;
use crate::domain::market::PriceSource;

/// Clears the running flag when the loop task ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Supervised fallback polling loop.
pub struct FallbackPoller {
    registry: Arc<LtpRegistry>,
    source: Arc<dyn AlternativePriceSource>,
    interval: Duration,
    running: Arc<AtomicBool>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPoller")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl FallbackPoller {
    /// Create a stopped poller.
    #[must_use]
    pub fn new(
        registry: Arc<LtpRegistry>,
        source: Arc<dyn AlternativePriceSource>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            source,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Whether the loop task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the loop. No-op while already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Fallback poller already running");
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let guard = RunningGuard(Arc::clone(&self.running));
        let registry = Arc::clone(&self.registry);
        let source = Arc::clone(&self.source);
        let interval = self.interval;

        tokio::spawn(async move {
            let _guard = guard;
            tracing::info!(interval_ms = interval.as_millis(), "Fallback poller started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = poll_cycle(&registry, source.as_ref()) => {}
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }

            tracing::info!("Fallback poller stopped");
        });
    }

    /// Cancel the loop. The running flag clears once the task exits.
    pub fn stop(&self) {
        self.cancel.lock().cancel();
    }

    /// Run a single cycle inline; returns the number of instruments priced.
    pub async fn poll_once(&self) -> usize {
        poll_cycle(&self.registry, self.source.as_ref()).await
    }
}

/// Price every fallback target once.
async fn poll_cycle(registry: &LtpRegistry, source: &dyn AlternativePriceSource) -> usize {
    let targets = registry.fallback_targets();
    if targets.is_empty() {
        return 0;
    }

    let lookups = targets.into_iter().map(|(instrument, symbol)| async move {
        let price = source.fetch_ltp(&symbol).await;
        (instrument, symbol, price)
    });

    let mut priced = 0;
    for (instrument, symbol, price) in join_all(lookups).await {
        match price {
            Some(price) if !price.is_zero() => {
                registry.update_price(&instrument, price, PriceSource::Fallback);
                priced += 1;
            }
            _ => tracing::debug!(instrument = %instrument, symbol = %symbol, "No fallback price"),
        }
    }

    priced
}
