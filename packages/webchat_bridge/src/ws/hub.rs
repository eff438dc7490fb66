//! Transport Hub
//!
//! Process-local table of live visitor connections keyed by session id.
//! Each session may have several connections (one per browser tab). There is
//! no cross-session lock: every session's entry in the map is mutated
//! independently.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::metrics::RelayMetrics;

use super::protocol::{ClientFrame, HelloPayload, ServerFrame, decode_client_frame};

pub type ConnectionId = u64;

/// Receives decoded frames. Implemented by the session relay.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_hello(&self, session_id: &str, payload: HelloPayload);
    async fn on_visitor_message(&self, session_id: &str, text: &str);
}

/// One open WebSocket. The socket writer task drains the paired receiver.
pub struct LiveConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    session: Mutex<Option<String>>,
}

impl LiveConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The session this connection is attached to, if any.
    pub fn session(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_session(&self, session_id: &str) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(session_id.to_string())
    }

    fn take_session(&self) -> Option<String> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Non-blocking send. A full buffer drops the frame; a closed one means
    /// the connection is already gone.
    fn send(&self, json: Arc<String>, metrics: &RelayMetrics) -> bool {
        match self.tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = self.id, "Outbound buffer full, dropping frame");
                metrics.send_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics.send_dropped();
                false
            }
        }
    }
}

pub struct TransportHub {
    sessions: DashMap<String, HashMap<ConnectionId, Arc<LiveConnection>>>,
    handler: OnceLock<Weak<dyn FrameHandler>>,
    next_id: AtomicU64,
    send_capacity: usize,
    metrics: Arc<RelayMetrics>,
}

fn encode(frame: &ServerFrame) -> Option<Arc<String>> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            error!("Failed to serialize frame: {}", e);
            None
        }
    }
}

impl TransportHub {
    pub fn new(metrics: Arc<RelayMetrics>, send_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            handler: OnceLock::new(),
            next_id: AtomicU64::new(1),
            send_capacity: send_capacity.max(1),
            metrics,
        }
    }

    /// Install the frame handler. Only the first call takes effect.
    pub fn set_handler(&self, handler: Weak<dyn FrameHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    fn handler(&self) -> Option<Arc<dyn FrameHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    /// Create a connection with no session attached yet. The caller pumps
    /// the returned receiver into the socket.
    pub fn register(&self) -> (Arc<LiveConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(self.send_capacity);
        let conn = Arc::new(LiveConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
            session: Mutex::new(None),
        });
        self.metrics.connection_opened();
        debug!(conn_id = conn.id, "Visitor connection registered");
        (conn, rx)
    }

    /// Attach `conn` to `session_id`, moving it off any previous session.
    pub fn attach(&self, conn: &Arc<LiveConnection>, session_id: &str) {
        if let Some(previous) = conn.set_session(session_id) {
            if previous != session_id {
                self.detach(conn.id, &previous);
            }
        }
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(conn.id, conn.clone());
    }

    fn detach(&self, conn_id: ConnectionId, session_id: &str) {
        if let Some(mut conns) = self.sessions.get_mut(session_id) {
            conns.remove(&conn_id);
        }
        self.sessions.remove_if(session_id, |_, conns| conns.is_empty());
    }

    /// Remove the connection from the live set. The session itself lives on in the store.
    pub fn disconnect(&self, conn: &LiveConnection) {
        if let Some(session_id) = conn.take_session() {
            self.detach(conn.id, &session_id);
        }
        self.metrics.connection_closed();
        debug!(conn_id = conn.id, "Visitor connection closed");
    }

    /// Decode one inbound text frame and dispatch it. Awaiting the handler
    /// here keeps frames from one connection in receipt order.
    pub async fn handle_text(&self, conn: &Arc<LiveConnection>, raw: &str) {
        self.metrics.frame_received();
        let Some(frame) = decode_client_frame(raw) else {
            self.metrics.frame_dropped();
            debug!(conn_id = conn.id, "Dropping malformed frame");
            return;
        };

        match frame {
            ClientFrame::Hello {
                session_id,
                payload,
            } => {
                let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                self.attach(conn, &session_id);
                if let Some(json) = encode(&ServerFrame::HelloAck {
                    session_id: session_id.clone(),
                }) {
                    conn.send(json, &self.metrics);
                }
                if let Some(handler) = self.handler() {
                    handler.on_hello(&session_id, payload).await;
                }
            }
            ClientFrame::VisitorMessage { text } => {
                let Some(session_id) = conn.session() else {
                    self.metrics.frame_dropped();
                    debug!(conn_id = conn.id, "visitor_message before hello, dropping");
                    return;
                };
                if let Some(handler) = self.handler() {
                    handler.on_visitor_message(&session_id, &text).await;
                }
            }
        }
    }

    /// Send `frame` to every live connection of `session_id`. Returns how
    /// many connections accepted it.
    pub fn broadcast_to_session(&self, session_id: &str, frame: &ServerFrame) -> usize {
        let Some(json) = encode(frame) else {
            return 0;
        };
        // Snapshot so no map guard is held while sending
        let targets: Vec<Arc<LiveConnection>> = match self.sessions.get(session_id) {
            Some(conns) => conns.values().cloned().collect(),
            None => return 0,
        };
        self.metrics.broadcast();

        targets
            .iter()
            .filter(|conn| conn.send(json.clone(), &self.metrics))
            .count()
    }

    #[cfg(test)]
    pub fn connection_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|c| c.len()).unwrap_or(0)
    }

    /// Connections attached to any session.
    pub fn total_connections(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
