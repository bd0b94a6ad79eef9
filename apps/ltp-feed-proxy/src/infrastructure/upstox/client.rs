//! Primary Feed WebSocket Client
//!
//! Holds the single upstream connection to the push feed and keeps the
//! registry's fallback routing in step with its health.
//!
//! # State Machine
//!
//! ```text
//! DISCONNECTED ─► CONNECTING ─► CONNECTED ─► DISCONNECTED ─► CONNECTING ...
//!                                                 │
//!                                                 └─► DEGRADED (budget spent)
//! ```
//!
//! - On connect: reset the reconnect budget, tell the registry the primary
//!   is live and resubscribe every live instrument.
//! - On error or close: route everything to fallback, then back off and
//!   reconnect. Once the budget is spent the feed stays degraded for the
//!   rest of the process lifetime.
//! - A quote without a usable price triggers one lookup on the alternative
//!   source. Lookups run on their own tasks so the read loop keeps pumping
//!   frames, and at most one is in flight per instrument.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{self, CodecError};
use super::messages::{AuthorizeResponse, FeedEvent, FeedRequest, PriceQuote};
use super::status::FeedStatus;
use crate::application::ports::{AlternativePriceSource, FeedMode, UpstreamError, UpstreamFeed};
use crate::application::services::registry::LtpRegistry;
use crate::application::services::retry::{RetryConfig, RetryPolicy};
use crate::domain::market::{FeedState, InstrumentKey, PriceSource};
use crate::infrastructure::config::{AccessToken, PrimaryFeedSettings};
use crate::infrastructure::metrics;

/// Upper bound on waiting for the connection task to accept a request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the primary feed client.
#[derive(Debug, thiserror::Error)]
pub enum PrimaryFeedError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Authorisation request failed.
    #[error("feed authorisation failed: {0}")]
    Authorize(String),

    /// Neither a feed URL nor an access token is configured.
    #[error("no feed URL and no access token configured")]
    MissingToken,

    /// Connection closed by the server.
    #[error("connection closed")]
    ConnectionClosed,

    /// No frame arrived within the idle timeout.
    #[error("no data for {0:?}")]
    IdleTimeout(Duration),

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    ReconnectExhausted(u32),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the primary feed client.
#[derive(Debug, Clone)]
pub struct PrimaryFeedConfig {
    /// Fixed WebSocket URL; skips authorisation when set.
    pub feed_url: Option<String>,
    /// Endpoint returning a one-time socket URL.
    pub authorize_url: String,
    /// Bearer token for authorisation.
    pub access_token: Option<AccessToken>,
    /// Feed mode for subscriptions.
    pub mode: FeedMode,
    /// Reconnect schedule.
    pub reconnect: RetryConfig,
    /// Maximum silence before the connection is considered dead.
    pub idle_timeout: Duration,
}

impl PrimaryFeedConfig {
    /// Config pointing straight at a socket URL.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            feed_url: Some(url.into()),
            ..Self::from_settings(&PrimaryFeedSettings::default())
        }
    }

    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &PrimaryFeedSettings) -> Self {
        Self {
            feed_url: settings.feed_url.clone(),
            authorize_url: settings.authorize_url.clone(),
            access_token: settings.access_token.clone(),
            mode: settings.mode,
            reconnect: RetryConfig::exponential(
                settings.reconnect_delay_initial,
                settings.reconnect_delay_max,
                settings.reconnect_attempts,
            ),
            idle_timeout: settings.idle_timeout,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

struct Command {
    request: FeedRequest,
    reply: oneshot::Sender<Result<(), UpstreamError>>,
}

/// Cloneable control surface for the running client.
///
/// Requests are handed to the connection task, which writes them to the
/// live socket.
#[derive(Clone)]
pub struct PrimaryFeedHandle {
    commands: mpsc::Sender<Command>,
    status: Arc<FeedStatus>,
}

impl std::fmt::Debug for PrimaryFeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryFeedHandle")
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

impl PrimaryFeedHandle {
    /// Shared connection status.
    #[must_use]
    pub fn status(&self) -> Arc<FeedStatus> {
        Arc::clone(&self.status)
    }

    async fn send(&self, request: FeedRequest) -> Result<(), UpstreamError> {
        if !self.status.is_connected() {
            return Err(UpstreamError::NotConnected);
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command { request, reply })
            .await
            .map_err(|_| UpstreamError::Closed)?;

        match tokio::time::timeout(REQUEST_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::Closed),
            Err(_) => Err(UpstreamError::Send("timed out waiting for connection".to_string())),
        }
    }
}

#[async_trait]
impl UpstreamFeed for PrimaryFeedHandle {
    async fn subscribe(
        &self,
        instruments: &[InstrumentKey],
        mode: FeedMode,
    ) -> Result<(), UpstreamError> {
        self.send(FeedRequest::subscribe(instruments.to_vec(), mode)).await
    }

    async fn unsubscribe(&self, instruments: &[InstrumentKey]) -> Result<(), UpstreamError> {
        self.send(FeedRequest::unsubscribe(instruments.to_vec())).await
    }

    fn is_active(&self) -> bool {
        self.status.state() != FeedState::Degraded
    }
}

// =============================================================================
// Client
// =============================================================================

/// Primary push feed client.
pub struct PrimaryFeedClient {
    config: PrimaryFeedConfig,
    registry: Arc<LtpRegistry>,
    fetcher: Arc<dyn AlternativePriceSource>,
    lookups: Arc<Mutex<HashSet<InstrumentKey>>>,
    status: Arc<FeedStatus>,
    commands: mpsc::Receiver<Command>,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl PrimaryFeedClient {
    /// Create a client and the handle the registry forwards requests to.
    #[must_use]
    pub fn new(
        config: PrimaryFeedConfig,
        registry: Arc<LtpRegistry>,
        fetcher: Arc<dyn AlternativePriceSource>,
        cancel: CancellationToken,
    ) -> (Self, PrimaryFeedHandle) {
        let (tx, rx) = mpsc::channel(64);
        let status = Arc::new(FeedStatus::default());
        let handle = PrimaryFeedHandle {
            commands: tx,
            status: Arc::clone(&status),
        };

        let client = Self {
            config,
            registry,
            fetcher,
            lookups: Arc::default(),
            status,
            commands: rx,
            http: reqwest::Client::new(),
            cancel,
        };

        (client, handle)
    }

    /// Shared connection status.
    #[must_use]
    pub fn status(&self) -> Arc<FeedStatus> {
        Arc::clone(&self.status)
    }

    /// Run the connection loop until cancelled or degraded.
    ///
    /// # Errors
    ///
    /// Returns [`PrimaryFeedError::ReconnectExhausted`] once the reconnect
    /// budget is spent; the feed is then left `DEGRADED`.
    pub async fn run(mut self) -> Result<(), PrimaryFeedError> {
        let mut reconnect_policy = RetryPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Primary feed cancelled");
                self.status.set_state(FeedState::Disconnected);
                return Ok(());
            }

            self.status.set_state(FeedState::Connecting);

            match self.connect_and_run(&mut reconnect_policy).await {
                Ok(()) => {
                    tracing::info!("Primary feed closed gracefully");
                    self.status.set_state(FeedState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Primary feed connection error");

                    self.status.set_state(FeedState::Disconnected);
                    self.registry.activate_fallback_for_all();
                    self.reject_pending();

                    if let Some(delay) = reconnect_policy.next_delay() {
                        let attempt = reconnect_policy.attempt_count();
                        self.status.set_reconnect_attempts(attempt);
                        metrics::record_reconnect();
                        tracing::info!(
                            attempt,
                            delay_ms = delay.as_millis(),
                            "Reconnecting to primary feed"
                        );

                        tokio::select! {
                            () = self.cancel.cancelled() => {
                                tracing::info!("Primary feed cancelled during reconnect delay");
                                return Ok(());
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        let attempts = reconnect_policy.attempt_count();
                        tracing::error!(
                            attempts,
                            "Primary feed reconnect budget exhausted, fallback serving all"
                        );
                        self.status.set_state(FeedState::Degraded);
                        self.registry.activate_fallback_for_all();
                        return Err(PrimaryFeedError::ReconnectExhausted(attempts));
                    }
                }
            }
        }
    }

    /// Connect and pump frames until error or cancellation.
    async fn connect_and_run(&mut self, policy: &mut RetryPolicy) -> Result<(), PrimaryFeedError> {
        let url = self.resolve_url().await?;
        tracing::info!("Connecting to primary feed");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        self.status.set_state(FeedState::Connected);
        self.status.set_reconnect_attempts(0);
        policy.reset();
        self.registry.primary_connected();

        let live = self.registry.subscribed_instruments();
        tracing::info!(instruments = live.len(), "Primary feed connected");
        if !live.is_empty() {
            let request = FeedRequest::subscribe(live, self.config.mode);
            write.send(codec::encode(&request)?).await?;
        }

        let idle = self.config.idle_timeout;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(command) = self.commands.recv() => {
                    let result = match codec::encode(&command.request) {
                        Ok(frame) => write
                            .send(frame)
                            .await
                            .map_err(|e| UpstreamError::Send(e.to_string())),
                        Err(e) => Err(UpstreamError::Send(e.to_string())),
                    };
                    tracing::debug!(
                        method = ?command.request.method,
                        instruments = ?command.request.data.instrument_keys,
                        ok = result.is_ok(),
                        "Subscription request written"
                    );
                    let _ = command.reply.send(result);
                }
                frame = tokio::time::timeout(idle, read.next()) => {
                    match frame {
                        Err(_) => return Err(PrimaryFeedError::IdleTimeout(idle)),
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.handle_decoded(codec::decode(&text));
                        }
                        Ok(Some(Ok(Message::Binary(bytes)))) => {
                            self.handle_decoded(codec::decode_binary(&bytes));
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            tracing::info!("Primary feed sent close frame");
                            return Err(PrimaryFeedError::ConnectionClosed);
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(None) => {
                            tracing::info!("Primary feed stream ended");
                            return Err(PrimaryFeedError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Fixed URL, or a fresh one-time URL from the authorisation endpoint.
    async fn resolve_url(&self) -> Result<String, PrimaryFeedError> {
        if let Some(url) = &self.config.feed_url {
            return Ok(url.clone());
        }

        let token = self
            .config
            .access_token
            .as_ref()
            .ok_or(PrimaryFeedError::MissingToken)?;

        let response = self
            .http
            .get(&self.config.authorize_url)
            .bearer_auth(token.expose())
            .header("Accept", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| PrimaryFeedError::Authorize(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PrimaryFeedError::Authorize(format!("HTTP {status}")));
        }

        let body: AuthorizeResponse = response
            .json()
            .await
            .map_err(|e| PrimaryFeedError::Authorize(e.to_string()))?;

        Ok(body.data.authorized_redirect_uri)
    }

    /// Fail requests queued while no connection is up.
    fn reject_pending(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let _ = command.reply.send(Err(UpstreamError::NotConnected));
        }
    }

    fn handle_decoded(&self, decoded: Result<FeedEvent, CodecError>) {
        self.status.record_message();
        match decoded {
            Ok(event) => self.handle_event(event),
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable primary frame"),
        }
    }

    /// Apply one decoded event to the registry.
    fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::MarketStatus(statuses) => {
                for (segment, status) in statuses {
                    let previous = self.status.set_segment(&segment, status);
                    if previous != Some(status) {
                        tracing::info!(
                            segment = %segment,
                            status = ?status,
                            "Segment status changed"
                        );
                    }
                    self.registry.set_segment_status(&segment, status);
                }
            }
            FeedEvent::Prices(quotes) => {
                for quote in quotes {
                    self.apply_quote(quote);
                }
            }
            FeedEvent::Unknown(kind) => {
                tracing::trace!(kind = %kind, "Ignoring primary event");
            }
        }
    }

    fn apply_quote(&self, quote: PriceQuote) {
        if let Some(price) = quote.usable_price() {
            self.registry.primary_price_received(&quote.instrument);
            self.registry
                .update_price(&quote.instrument, price, PriceSource::Primary);
            return;
        }

        if self.registry.is_subscribed(&quote.instrument) {
            self.spawn_lookup(quote.instrument);
        }
    }

    /// One alternative-source lookup for an instrument the primary could not
    /// price, off the read loop.
    fn spawn_lookup(&self, instrument: InstrumentKey) {
        if !self.lookups.lock().insert(instrument.clone()) {
            tracing::trace!(instrument = %instrument, "Lookup already in flight");
            return;
        }

        let registry = Arc::clone(&self.registry);
        let fetcher = Arc::clone(&self.fetcher);
        let lookups = Arc::clone(&self.lookups);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let symbol = registry.resolve_display_symbol(&instrument);
            let price = tokio::select! {
                () = cancel.cancelled() => None,
                price = fetcher.fetch_ltp(&symbol) => price,
            };
            lookups.lock().remove(&instrument);

            match price {
                Some(price) => {
                    registry.update_price(&instrument, price, PriceSource::Fallback);
                }
                None => tracing::debug!(
                    instrument = %instrument,
                    symbol = %symbol,
                    "No price from primary or fallback lookup"
                ),
            }
        });
    }
}
