//! WebSocket Handler
//!
//! One task pair per visitor socket: a writer draining the hub's outbound
//! queue and a reader feeding frames to the hub in receipt order.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::hub::TransportHub;

/// Handle a visitor WebSocket connection until either side closes.
pub async fn handle_visitor_ws(socket: WebSocket, hub: Arc<TransportHub>) {
    let (conn, mut rx) = hub.register();
    let conn_id = conn.id();
    info!(conn_id, "New visitor WebSocket connection");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let sender_task = async move {
        while let Some(json) = rx.recv().await {
            if ws_sender
                .send(Message::Text(json.as_str().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    };

    let hub_input = hub.clone();
    let conn_input = conn.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    hub_input.handle_text(&conn_input, text.as_str()).await;
                }
                Ok(Message::Close(_)) => break,
                // Pings are answered by axum; binary frames are not part of the protocol
                Ok(_) => {}
                Err(e) => {
                    warn!(conn_id, "WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id, "Sender task ended"),
        _ = input_task => debug!(conn_id, "Input task ended"),
    }

    hub.disconnect(&conn);
    info!(conn_id, "Visitor WebSocket disconnected");
}
