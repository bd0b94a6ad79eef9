//! Primary Feed Status
//!
//! Shared, lock-protected view of the adapter's connection state and the
//! latest segment statuses. Read by the health endpoint and the supervisor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::market::{FeedState, SegmentStatus};
use crate::infrastructure::metrics;

/// Point-in-time copy of [`FeedStatus`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedStatusSnapshot {
    /// Connection state.
    pub state: FeedState,
    /// Latest status per market segment.
    pub segments: BTreeMap<String, SegmentStatus>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Inbound frames decoded since start.
    pub messages_received: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: FeedState,
    segments: BTreeMap<String, SegmentStatus>,
    reconnect_attempts: u32,
}

/// Connection state shared between the adapter task and its handle.
#[derive(Debug, Default)]
pub struct FeedStatus {
    inner: RwLock<Inner>,
    messages_received: AtomicU64,
}

impl FeedStatus {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> FeedState {
        self.inner.read().state
    }

    /// Move to a new state. `Degraded` is terminal.
    pub fn set_state(&self, state: FeedState) {
        let mut inner = self.inner.write();
        if inner.state == FeedState::Degraded {
            return;
        }
        inner.state = state;
        metrics::set_primary_connected(state == FeedState::Connected);
    }

    /// Record the latest reconnect attempt number.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.inner.write().reconnect_attempts = attempts;
    }

    /// Store a segment status; returns the previous one.
    pub fn set_segment(&self, segment: &str, status: SegmentStatus) -> Option<SegmentStatus> {
        self.inner.write().segments.insert(segment.to_string(), status)
    }

    /// Count a decoded inbound frame.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the feed is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == FeedState::Connected
    }

    /// Copy the current status.
    #[must_use]
    pub fn snapshot(&self) -> FeedStatusSnapshot {
        let inner = self.inner.read();
        FeedStatusSnapshot {
            state: inner.state,
            segments: inner.segments.clone(),
            reconnect_attempts: inner.reconnect_attempts,
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}
