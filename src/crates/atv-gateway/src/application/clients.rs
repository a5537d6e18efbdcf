//! Client channel registry.
//!
//! Every WebSocket connection gets a [`ClientId`] and an outbox channel.  The
//! gateway task never writes to a socket directly: it pushes
//! [`ServerMessage`]s into the outbox and the connection's writer task
//! serialises them.
//!
//! Which client is *active* (receives unsolicited events) is session state,
//! not registry state; see [`Session::active_client`](super::Session::active_client).

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ServerMessage;

/// Identifies one WebSocket connection for its lifetime.
pub type ClientId = Uuid;

/// Sending half of a client's outbox.
pub type ClientOutbox = mpsc::UnboundedSender<ServerMessage>;

/// In-memory map of connected clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientOutbox>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the outbox for `id`.
    pub fn register(&mut self, id: ClientId, outbox: ClientOutbox) {
        self.clients.insert(id, outbox);
    }

    /// Removes `id`; returns `true` if it was registered.
    pub fn remove(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    /// Queues `message` for `id`.
    ///
    /// Returns `false` if the client is unknown or its connection has gone.
    pub fn send(&self, id: ClientId, message: ServerMessage) -> bool {
        let Some(outbox) = self.clients.get(&id) else {
            debug!("client {id} not registered; dropping {}", message.command());
            return false;
        };
        if outbox.send(message).is_err() {
            debug!("client {id} outbox closed");
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
