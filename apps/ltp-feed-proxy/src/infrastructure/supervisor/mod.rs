//! Feed Supervisor
//!
//! Owns the fallback poller's lifecycle and, when deployed, the primary
//! feed's connection task. A fixed-interval health loop restarts a stopped
//! poller up to a bounded number of consecutive times; past that the feed
//! is marked DOWN and stays down until the process restarts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::SupervisorSettings;
use crate::infrastructure::groww::FallbackPoller;
use crate::infrastructure::metrics;
use crate::infrastructure::upstox::{FeedStatus, FeedStatusSnapshot, PrimaryFeedClient};

// =============================================================================
// Supervised Task
// =============================================================================

/// A restartable background loop the supervisor keeps alive.
pub trait SupervisedTask: Send + Sync {
    /// Whether the loop is currently alive.
    fn is_running(&self) -> bool;

    /// Start the loop; a no-op while it is alive.
    fn start(&self);
}

impl SupervisedTask for FallbackPoller {
    fn is_running(&self) -> bool {
        Self::is_running(self)
    }

    fn start(&self) {
        Self::start(self);
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Health report for the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    /// Health loop is running.
    pub running: bool,
    /// Restart budget spent; feed marked DOWN.
    pub down: bool,
    /// Fallback poller is alive.
    pub poller_running: bool,
    /// Poller restarts issued since start.
    pub poller_restarts: u32,
    /// Restarts since the poller was last seen alive.
    pub consecutive_restarts: u32,
    /// Primary feed status, when deployed.
    pub primary: Option<FeedStatusSnapshot>,
}

/// Keeps the fallback poller (and optionally the primary feed) running.
pub struct FeedSupervisor {
    settings: SupervisorSettings,
    poller: Arc<dyn SupervisedTask>,
    primary: Mutex<Option<PrimaryFeedClient>>,
    primary_status: Option<Arc<FeedStatus>>,
    running: AtomicBool,
    down: AtomicBool,
    restarts: AtomicU32,
    consecutive_restarts: AtomicU32,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FeedSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSupervisor")
            .field("settings", &self.settings)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl FeedSupervisor {
    /// Create a supervisor for a poller.
    #[must_use]
    pub fn new(
        settings: SupervisorSettings,
        poller: Arc<dyn SupervisedTask>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            poller,
            primary: Mutex::new(None),
            primary_status: None,
            running: AtomicBool::new(false),
            down: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            consecutive_restarts: AtomicU32::new(0),
            cancel,
        }
    }

    /// Also run the primary feed when started.
    #[must_use]
    pub fn with_primary(mut self, client: PrimaryFeedClient) -> Self {
        self.primary_status = Some(client.status());
        self.primary = Mutex::new(Some(client));
        self
    }

    /// Start the poller, the primary feed (if any) and the health loop.
    ///
    /// Returns `None` when already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Feed supervisor already running");
            return None;
        }

        self.poller.start();

        if let Some(client) = self.primary.lock().take() {
            tokio::spawn(async move {
                match client.run().await {
                    Ok(()) => tracing::info!("Primary feed exited normally"),
                    Err(e) => tracing::error!(
                        error = %e,
                        "Primary feed stopped, fallback serving all instruments"
                    ),
                }
            });
        }

        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move { supervisor.health_loop().await }))
    }

    /// Stop the health loop (the poller keeps whatever state it has).
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn health_loop(&self) {
        let max = self.settings.max_restart_attempts;
        tracing::info!(
            interval_secs = self.settings.health_check_interval.as_secs(),
            max_restarts = max,
            "Feed health monitor started"
        );

        loop {
            if !self.pause(self.settings.health_check_interval).await {
                break;
            }

            if self.poller.is_running() {
                self.consecutive_restarts.store(0, Ordering::SeqCst);
                continue;
            }

            let consecutive = self.consecutive_restarts.load(Ordering::SeqCst);
            if consecutive >= max {
                tracing::error!(
                    restarts = consecutive,
                    "Fallback poller restart limit reached, feed marked DOWN"
                );
                self.down.store(true, Ordering::SeqCst);
                return;
            }

            tracing::warn!(attempt = consecutive + 1, "Fallback poller stopped, restarting");
            if !self.pause(self.settings.restart_delay).await {
                break;
            }

            self.consecutive_restarts.fetch_add(1, Ordering::SeqCst);
            self.restarts.fetch_add(1, Ordering::SeqCst);
            metrics::record_poller_restart();
            self.poller.start();
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Feed health monitor stopped");
    }

    /// Sleep unless cancelled; returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    /// Supervisor running, poller alive and feed not DOWN.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.poller.is_running()
            && !self.down.load(Ordering::SeqCst)
    }

    /// Whether the restart budget has been spent.
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Primary feed status, when deployed.
    #[must_use]
    pub fn primary_status(&self) -> Option<Arc<FeedStatus>> {
        self.primary_status.clone()
    }

    /// Copy of the supervisor's health state.
    #[must_use]
    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            running: self.running.load(Ordering::SeqCst),
            down: self.down.load(Ordering::SeqCst),
            poller_running: self.poller.is_running(),
            poller_restarts: self.restarts.load(Ordering::SeqCst),
            consecutive_restarts: self.consecutive_restarts.load(Ordering::SeqCst),
            primary: self.primary_status.as_ref().map(|s| s.snapshot()),
        }
    }
}
