//! Message relay hub.
//!
//! Accepts WebSocket clients, lets each log in under a unique nickname,
//! relays addressed envelopes between logged-in users and keeps every
//! client's view of the online roster current.
//!
//! All registry mutation happens on the single [`Hub::run`] control loop.
//! Each connection is a [`Peer`] with its own read and write tasks; the
//! [`RelayServer`] owns the listening socket.

mod broadcast;
mod handlers;
mod hub;
mod peer;
mod server;

pub use hub::{Hub, HubConfig, HubHandle, Inbound};
pub use peer::{ConnId, Identity, Peer, PeerConfig, SendError, spawn_peer};
pub use server::{RelayServer, ServerConfig};

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
