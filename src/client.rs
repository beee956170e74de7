//! Client role: connects out to a server.
//!
//! Each call to [`TcpClient::connect`] opens one connection, registers it
//! and spawns its four loops (heartbeat, incoming, outgoing, monitor). A
//! client may hold several connections at once; they share one registry and
//! one pair of queues.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::comms::{Comms, CommsState};
use crate::config::ClientSettings;
use crate::tasks::{self, Role};

/// Outbound side of the transport.
#[derive(Debug, Clone)]
pub struct TcpClient {
    settings: ClientSettings,
    state: CommsState,
}

impl TcpClient {
    /// Create a client with its own registry and queues.
    ///
    /// Fails if the settings do not pass [`ClientSettings::validate`].
    pub fn new(settings: ClientSettings) -> Result<Self> {
        Self::with_state(settings, CommsState::new())
    }

    /// Create a client on top of existing state.
    pub fn with_state(settings: ClientSettings, state: CommsState) -> Result<Self> {
        settings.validate().context("Invalid settings")?;
        Ok(Self { settings, state })
    }

    /// Settings this client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Open a connection and start serving it.
    ///
    /// Returns the new connection id. Fails if the server cannot be reached
    /// or the id cannot be registered; nothing is left registered in that
    /// case.
    pub async fn connect(&self, ip: IpAddr, port: u16) -> Result<Uuid> {
        let addr = SocketAddr::new(ip, port);
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("[Connector] Failed to connect to {}: {}", addr, e);
                return Err(e).with_context(|| format!("Failed to connect to {addr}"));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("[Connector] Could not disable Nagle on {}: {}", addr, e);
        }

        let connection_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        if let Err(e) = self.state.register(connection_id, cancel.clone()) {
            log::error!("[Connector] {}, dropping socket to {}", e, addr);
            return Err(e);
        }

        let timings = self.settings.timings();
        let (reader, writer) = stream.into_split();

        tasks::spawn_heartbeat(
            self.state.clone(),
            connection_id,
            self.settings.heartbeat_interval(),
            cancel.clone(),
        );
        tasks::spawn_incoming(
            self.state.clone(),
            connection_id,
            reader,
            timings.incoming_interval,
            timings.read_buffer_size,
            Role::Client,
            cancel.clone(),
        );
        tasks::spawn_outgoing(
            self.state.clone(),
            connection_id,
            writer,
            timings.outgoing_interval,
            Role::Client,
            cancel.clone(),
        );
        tasks::spawn_connection_monitor(
            self.state.clone(),
            connection_id,
            timings.monitor_interval,
            timings.heartbeat_timeout,
            cancel,
        );

        log::info!("[Connector] Connected to {} as {}", addr, connection_id);
        Ok(connection_id)
    }
}

impl Comms for TcpClient {
    fn state(&self) -> &CommsState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_settings() -> ClientSettings {
        ClientSettings {
            heartbeat_interval_ms: 20,
            heartbeat_timeout_ms: 500,
            connection_interval_ms: 10,
            process_incoming_interval_ms: 5,
            process_outgoing_interval_ms: 5,
            ..ClientSettings::default()
        }
    }

    #[test]
    fn test_new_rejects_zero_intervals() {
        for settings in [
            ClientSettings {
                connection_interval_ms: 0,
                heartbeat_timeout_ms: 100,
                ..fast_settings()
            },
            ClientSettings {
                process_incoming_interval_ms: 0,
                ..fast_settings()
            },
            ClientSettings {
                heartbeat_timeout_ms: 20,
                ..fast_settings()
            },
        ] {
            let err = TcpClient::new(settings).unwrap_err();
            assert!(format!("{err:#}").contains("Invalid settings"), "{err:#}");
        }
    }

    #[tokio::test]
    async fn test_connect_refused_registers_nothing() {
        // Grab a free port, then close it so the connect is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TcpClient::new(fast_settings()).unwrap();
        let result = client.connect(IpAddr::V4(Ipv4Addr::LOCALHOST), port).await;
        assert!(result.is_err());
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn test_connect_starts_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpClient::new(fast_settings()).unwrap();
        let id = client
            .connect(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap();
        assert!(client.has_connection(id));

        let (mut peer, _) = listener.accept().await.unwrap();
        let expected = br#"{"Type":0,"Data":"request"}"#;
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
            .await
            .expect("Timed out waiting for heartbeat")
            .unwrap();
        assert_eq!(&buf, expected);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpClient::new(ClientSettings {
            heartbeat_timeout_ms: 100,
            ..fast_settings()
        })
        .unwrap();
        let id = client
            .connect(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while client.has_connection(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was never torn down");
        assert!(!client.write(id, "late"));
    }
}
