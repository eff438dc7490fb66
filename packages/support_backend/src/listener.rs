use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::platform::InboundPlatformMessage;

/// Maps a conversation handle back to the session that owns it.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn session_for_handle(&self, handle_id: &str) -> anyhow::Result<Option<String>>;
}

/// An agent reply that belongs to a known session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundAgentMessage {
    pub session_id: String,
    pub author: String,
    pub body: String,
}

/// Filter raw platform messages down to agent replies in session handles.
///
/// Bot-authored messages (including our own relays) and messages outside a
/// guild are ignored, as are messages in channels no session owns. Returns
/// when either the event stream or the sink closes.
pub async fn run_inbound_listener(
    mut events: mpsc::Receiver<InboundPlatformMessage>,
    resolver: Arc<dyn HandleResolver>,
    sink: mpsc::Sender<InboundAgentMessage>,
) {
    while let Some(msg) = events.recv().await {
        if msg.author_is_bot || !msg.in_guild {
            continue;
        }

        let session_id = match resolver.session_for_handle(&msg.channel_id).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(channel_id = %msg.channel_id, "Ignoring message outside session handles");
                continue;
            }
            Err(e) => {
                warn!(channel_id = %msg.channel_id, error = %e, "Failed to resolve handle");
                continue;
            }
        };

        let forwarded = InboundAgentMessage {
            session_id,
            author: msg.author,
            body: msg.content,
        };
        if sink.send(forwarded).await.is_err() {
            break;
        }
    }
    info!("Inbound listener stopped");
}

pub fn spawn_inbound_listener(
    events: mpsc::Receiver<InboundPlatformMessage>,
    resolver: Arc<dyn HandleResolver>,
    sink: mpsc::Sender<InboundAgentMessage>,
) -> JoinHandle<()> {
    tokio::spawn(run_inbound_listener(events, resolver, sink))
}
