//! Relay metrics for observability
//!
//! Counters are bumped on the hot paths of the hub and relay and exposed as a
//! JSON snapshot on `/metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Connection metrics
    /// Currently open visitor WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Frame metrics
    pub frames_received: AtomicU64,
    /// Malformed, unknown or out-of-order frames
    pub frames_dropped: AtomicU64,
    /// Outbound frames that hit a full or closed connection
    pub sends_dropped: AtomicU64,
    pub broadcasts: AtomicU64,

    // Session metrics
    pub sessions_started: AtomicU64,
    pub sessions_closed: AtomicU64,

    // Message metrics
    pub messages_persisted: AtomicU64,
    pub deliveries_ok: AtomicU64,
    pub deliveries_failed: AtomicU64,
    pub agent_messages: AtomicU64,

    // Backend handle metrics
    pub handles_created: AtomicU64,
    pub handle_fallbacks: AtomicU64,
    pub handle_failures: AtomicU64,

    // Error metrics
    pub store_failures: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_persisted(&self) {
        self.messages_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery(&self, ok: bool) {
        if ok {
            self.deliveries_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn agent_message(&self) {
        self.agent_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle_created(&self, fell_back: bool) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
        if fell_back {
            self.handle_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn handle_failed(&self) {
        self.handle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
                sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                started: self.sessions_started.load(Ordering::Relaxed),
                closed: self.sessions_closed.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                persisted: self.messages_persisted.load(Ordering::Relaxed),
                delivered: self.deliveries_ok.load(Ordering::Relaxed),
                delivery_failed: self.deliveries_failed.load(Ordering::Relaxed),
                from_agents: self.agent_messages.load(Ordering::Relaxed),
            },
            handles: HandleMetrics {
                created: self.handles_created.load(Ordering::Relaxed),
                fallbacks: self.handle_fallbacks.load(Ordering::Relaxed),
                failures: self.handle_failures.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                store: self.store_failures.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub frames: FrameMetrics,
    pub sessions: SessionMetrics,
    pub messages: MessageMetrics,
    pub handles: HandleMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub received: u64,
    pub dropped: u64,
    pub sends_dropped: u64,
    pub broadcasts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub started: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub persisted: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub from_agents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleMetrics {
    pub created: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub store: u64,
}
