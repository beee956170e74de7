//! Server role: accepts connections on a TCP listener.
//!
//! Every accepted socket is registered under a fresh id and served by an
//! incoming and an outgoing loop. A single liveness monitor sweeps all
//! connections for the lifetime of the listener. Each connection's
//! cancellation is a child of the listener's shutdown token, so shutting the
//! listener down stops every connection it accepted.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::comms::{Comms, CommsState};
use crate::config::{LoopTimings, ServerSettings};
use crate::tasks::{self, Role};

/// Back-off after a failed accept, so a persistent error does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listening side of the transport.
#[derive(Debug, Clone)]
pub struct TcpServer {
    settings: ServerSettings,
    state: CommsState,
}

impl TcpServer {
    /// Create a server with its own registry and queues.
    ///
    /// Fails if the settings do not pass [`ServerSettings::validate`].
    pub fn new(settings: ServerSettings) -> Result<Self> {
        Self::with_state(settings, CommsState::new())
    }

    /// Create a server on top of existing state.
    pub fn with_state(settings: ServerSettings, state: CommsState) -> Result<Self> {
        settings.validate().context("Invalid settings")?;
        Ok(Self { settings, state })
    }

    /// Settings this server was built with.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Bind the listener to the configured address and port.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(self.settings.bind_address, self.settings.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("[Listener] Failed to bind {}: {}", addr, e);
                return Err(e).with_context(|| format!("Failed to bind {addr}"));
            }
        };
        match listener.local_addr() {
            Ok(local) => log::info!("[Listener] Listening on {}", local),
            Err(_) => log::info!("[Listener] Listening on {}", addr),
        }
        Ok(listener)
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Every connection accepted here is torn down before this returns.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        let timings = self.settings.timings();
        let monitor = tasks::spawn_global_monitor(
            self.state.clone(),
            timings.monitor_interval,
            timings.heartbeat_timeout,
            shutdown.clone(),
        );

        let mut accepted: HashSet<Uuid> = HashSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        accepted.retain(|id| self.state.registry.has(*id));
                        if let Some(id) = self.start_connection(stream, peer, &timings, &shutdown) {
                            accepted.insert(id);
                        }
                    }
                    Err(e) => {
                        log::error!("[Listener] Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        for connection_id in accepted {
            if self.state.teardown(connection_id) {
                log::info!("[Listener] {} closed (shutdown)", connection_id);
            }
        }
        if let Err(e) = monitor.await {
            log::warn!("[Listener] Monitor task ended abnormally: {}", e);
        }
        log::info!("[Listener] Stopped");
    }

    /// Bind, then accept connections until `shutdown` fires.
    pub async fn start_listener(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    fn start_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        timings: &LoopTimings,
        shutdown: &CancellationToken,
    ) -> Option<Uuid> {
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("[Listener] Could not disable Nagle for {}: {}", peer, e);
        }

        let connection_id = Uuid::new_v4();
        let cancel = shutdown.child_token();
        if let Err(e) = self.state.register(connection_id, cancel.clone()) {
            log::error!("[Listener] {}, dropping {}", e, peer);
            return None;
        }
        log::info!("[Listener] Accepted {} as {}", peer, connection_id);

        let (reader, writer) = stream.into_split();
        tasks::spawn_incoming(
            self.state.clone(),
            connection_id,
            reader,
            timings.incoming_interval,
            timings.read_buffer_size,
            Role::Server,
            cancel.clone(),
        );
        tasks::spawn_outgoing(
            self.state.clone(),
            connection_id,
            writer,
            timings.outgoing_interval,
            Role::Server,
            cancel,
        );
        Some(connection_id)
    }
}

impl Comms for TcpServer {
    fn state(&self) -> &CommsState {
        &self.state
    }
}
