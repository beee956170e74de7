//! Connection registry shared by every loop of a client or server.
//!
//! Maps a connection id to its liveness state. All operations are total:
//! a missing id is reported through the return value, never as an error.
//! Each operation holds the map lock for a single key, so read-modify-write
//! on one connection never races another on the same id.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Liveness state of one registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Last time a heartbeat was received from the peer.
    pub last_heartbeat: Instant,
    /// Set once teardown has been requested. Never unset.
    pub disconnect_requested: bool,
    /// Cancels every loop serving this connection.
    pub cancel: CancellationToken,
}

impl ConnectionState {
    /// Fresh state for a connection established now.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            last_heartbeat: Instant::now(),
            disconnect_requested: false,
            cancel,
        }
    }

    /// Why this connection must be torn down, if it must.
    fn teardown_reason(&self, now: Instant, timeout: Duration) -> Option<TeardownReason> {
        if self.disconnect_requested {
            Some(TeardownReason::Disconnect)
        } else if now.saturating_duration_since(self.last_heartbeat) > timeout {
            Some(TeardownReason::HeartbeatTimeout)
        } else {
            None
        }
    }
}

/// Condition that ends a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Disconnect was requested locally or by the peer.
    Disconnect,
    /// No heartbeat arrived within the configured timeout.
    HeartbeatTimeout,
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnect => write!(f, "disconnect"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
        }
    }
}

/// Lifecycle position of a connection as seen by the liveness monitor.
///
/// `Connecting` is not represented: a connection is only visible once it
/// has been registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Registered and healthy.
    Active,
    /// Will be removed on the next monitor tick.
    PendingTeardown(TeardownReason),
    /// Not registered (removed, or never existed).
    Closed,
}

/// Thread-safe map from connection id to [`ConnectionState`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionState>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `false` if the id is already present.
    pub fn add(&self, id: Uuid, state: ConnectionState) -> bool {
        let mut connections = self.write();
        if connections.contains_key(&id) {
            return false;
        }
        connections.insert(id, state);
        true
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn remove(&self, id: Uuid) -> bool {
        self.write().remove(&id).is_some()
    }

    /// Returns true if the connection is registered.
    pub fn has(&self, id: Uuid) -> bool {
        self.read().contains_key(&id)
    }

    /// Record a heartbeat from the peer.
    ///
    /// The timestamp never moves backwards.
    pub fn update_heartbeat(&self, id: Uuid) -> bool {
        match self.write().get_mut(&id) {
            Some(state) => {
                state.last_heartbeat = state.last_heartbeat.max(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Flag the connection for teardown on the next monitor tick.
    pub fn mark_disconnect(&self, id: Uuid) -> bool {
        match self.write().get_mut(&id) {
            Some(state) => {
                state.disconnect_requested = true;
                true
            }
            None => false,
        }
    }

    /// Current lifecycle status of a connection.
    pub fn status(&self, id: Uuid, timeout: Duration) -> ConnectionStatus {
        let now = Instant::now();
        match self.read().get(&id) {
            Some(state) => match state.teardown_reason(now, timeout) {
                Some(reason) => ConnectionStatus::PendingTeardown(reason),
                None => ConnectionStatus::Active,
            },
            None => ConnectionStatus::Closed,
        }
    }

    /// Every connection that is due for teardown, with its reason.
    pub fn sweep(&self, timeout: Duration) -> Vec<(Uuid, TeardownReason)> {
        let now = Instant::now();
        self.read()
            .iter()
            .filter_map(|(id, state)| state.teardown_reason(now, timeout).map(|r| (*id, r)))
            .collect()
    }

    /// Cancel a connection's loops and remove it.
    ///
    /// Returns `false` if the connection was not registered.
    pub fn teardown(&self, id: Uuid) -> bool {
        match self.write().remove(&id) {
            Some(state) => {
                state.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancellation handle of a registered connection.
    pub fn cancel_token(&self, id: Uuid) -> Option<CancellationToken> {
        self.read().get(&id).map(|state| state.cancel.clone())
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<Uuid> {
        self.read().keys().copied().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, ConnectionState>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, ConnectionState>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}
