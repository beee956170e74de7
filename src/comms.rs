//! Shared state and the public operations common to both roles.
//!
//! [`CommsState`] bundles the connection registry with the input and output
//! queues. It is created once per client or server (or shared explicitly by
//! the caller) and handed to every loop it spawns.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::REQUEST_PAYLOAD;
use crate::queue::MessageQueue;
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::wire::WireMessage;

/// Registry and queues shared by all loops of one role instance.
#[derive(Debug, Clone, Default)]
pub struct CommsState {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Payloads received from peers, waiting for the application.
    pub input: Arc<MessageQueue<String>>,
    /// Messages waiting to be written to peers.
    pub output: Arc<MessageQueue<WireMessage>>,
}

impl CommsState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection whose loops are controlled by `cancel`.
    ///
    /// Fails if the id is already registered; the existing entry is left
    /// untouched.
    pub fn register(&self, connection_id: Uuid, cancel: CancellationToken) -> Result<()> {
        if !self.registry.add(connection_id, ConnectionState::new(cancel)) {
            bail!("Connection {connection_id} is already registered");
        }
        Ok(())
    }

    /// Queue a message for a registered connection.
    ///
    /// Returns `false` without queueing if the connection is not registered.
    pub fn enqueue(&self, connection_id: Uuid, message: WireMessage) -> bool {
        if !self.registry.has(connection_id) {
            log::debug!(
                "{} not connected, dropping {:?}",
                connection_id,
                message.message_type()
            );
            return false;
        }
        self.output.add(connection_id, message);
        true
    }

    /// Tear a connection down: cancel its loops, remove it and drop
    /// everything still queued for it.
    ///
    /// Returns `false` if the connection was not registered.
    pub fn teardown(&self, connection_id: Uuid) -> bool {
        let removed = self.registry.teardown(connection_id);
        let dropped_in = self.input.purge(connection_id);
        let dropped_out = self.output.purge(connection_id);
        if dropped_in + dropped_out > 0 {
            log::debug!(
                "{} dropped {} unread and {} unsent message(s)",
                connection_id,
                dropped_in,
                dropped_out
            );
        }
        removed
    }
}

/// Non-blocking, best-effort operations exposed by a client or server.
///
/// None of these block or fail loudly: a missing connection is reported as
/// `false` or `None`.
pub trait Comms {
    /// Shared state of this role instance.
    fn state(&self) -> &CommsState;

    /// Queue a data payload for a connection.
    fn write(&self, connection_id: Uuid, payload: &str) -> bool {
        self.state()
            .enqueue(connection_id, WireMessage::Data(payload.to_string()))
    }

    /// Queue a disconnect request for a connection.
    fn disconnect(&self, connection_id: Uuid) -> bool {
        self.state().enqueue(
            connection_id,
            WireMessage::Disconnect(REQUEST_PAYLOAD.to_string()),
        )
    }

    /// Take the next payload received on a connection.
    fn read_next(&self, connection_id: Uuid) -> Option<String> {
        self.state()
            .input
            .take_next_for(connection_id)
            .map(|item| item.payload)
    }

    /// Take the next payload received on any connection.
    fn read_next_any(&self) -> Option<(Uuid, String)> {
        self.state()
            .input
            .take_next_any()
            .map(|item| (item.connection_id, item.payload))
    }

    /// Returns true if the connection is registered.
    fn has_connection(&self, connection_id: Uuid) -> bool {
        self.state().registry.has(connection_id)
    }

    /// Ids of all registered connections.
    fn connections(&self) -> Vec<Uuid> {
        self.state().registry.ids()
    }
}
