//! Visitor WebSocket transport
//!
//! The hub tracks which live connections belong to which session and fans
//! server frames out to them. Frame semantics live in the relay.

mod handler;
mod hub;
mod protocol;

pub use handler::handle_visitor_ws;
pub use hub::{FrameHandler, LiveConnection, TransportHub};
pub use protocol::{HelloPayload, ServerFrame};
