//! End-to-end tests over a real loopback socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tcp_comms::{ClientSettings, Comms, ServerSettings, TcpClient, TcpServer};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn server_settings(heartbeat_timeout_ms: u64) -> ServerSettings {
    ServerSettings {
        bind_address: LOCALHOST,
        port: 0,
        connection_monitor_interval_ms: 20,
        process_incoming_interval_ms: 5,
        process_outgoing_interval_ms: 5,
        heartbeat_timeout_ms,
        ..ServerSettings::default()
    }
}

fn client_settings() -> ClientSettings {
    ClientSettings {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 1_000,
        connection_interval_ms: 20,
        process_incoming_interval_ms: 5,
        process_outgoing_interval_ms: 5,
        ..ClientSettings::default()
    }
}

struct RunningServer {
    server: TcpServer,
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningServer {
    async fn start(settings: ServerSettings) -> Self {
        let server = TcpServer::new(settings).unwrap();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = {
            let server = server.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await })
        };
        Self {
            server,
            addr,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("Timed out waiting for listener to stop")
            .unwrap();
    }
}

async fn eventually<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Some(value) = probe() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

#[tokio::test]
async fn test_hello_round_trip_then_disconnect() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let client = TcpClient::new(client_settings()).unwrap();
    let client_id = client.connect(LOCALHOST, running.addr.port()).await.unwrap();

    assert!(client.write(client_id, "hello"));
    let (server_id, payload) = eventually(|| running.server.read_next_any()).await;
    assert_eq!(payload, "hello");
    assert!(running.server.has_connection(server_id));

    assert!(running.server.write(server_id, "hi back"));
    let reply = eventually(|| client.read_next(client_id)).await;
    assert_eq!(reply, "hi back");

    assert!(client.disconnect(client_id));
    eventually(|| (!client.has_connection(client_id)).then_some(())).await;
    eventually(|| (!running.server.has_connection(server_id)).then_some(())).await;

    assert!(!client.write(client_id, "after"));
    assert!(!running.server.write(server_id, "after"));
    assert!(client.read_next(client_id).is_none());

    running.stop().await;
}

#[tokio::test]
async fn test_server_initiated_disconnect_reaches_client() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let client = TcpClient::new(client_settings()).unwrap();
    let client_id = client.connect(LOCALHOST, running.addr.port()).await.unwrap();

    let server_id = eventually(|| running.server.connections().first().copied()).await;
    assert!(running.server.disconnect(server_id));

    eventually(|| (!running.server.has_connection(server_id)).then_some(())).await;
    eventually(|| (!client.has_connection(client_id)).then_some(())).await;

    running.stop().await;
}

#[tokio::test]
async fn test_heartbeats_keep_connection_alive() {
    let running = RunningServer::start(server_settings(300)).await;
    let client = TcpClient::new(client_settings()).unwrap();
    let client_id = client.connect(LOCALHOST, running.addr.port()).await.unwrap();
    let server_id = eventually(|| running.server.connections().first().copied()).await;

    // Well past the server timeout; heartbeats every 50 ms keep it alive.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(running.server.has_connection(server_id));
    assert!(client.has_connection(client_id));

    running.stop().await;
}

#[tokio::test]
async fn test_silent_peer_is_removed_after_timeout() {
    let running = RunningServer::start(server_settings(200)).await;

    let _silent = TcpStream::connect(running.addr).await.unwrap();
    let server_id = eventually(|| running.server.connections().first().copied()).await;

    eventually(|| (!running.server.has_connection(server_id)).then_some(())).await;
    assert!(!running.server.write(server_id, "anyone?"));

    running.stop().await;
}

#[tokio::test]
async fn test_malformed_bytes_do_not_kill_connection() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let mut raw = TcpStream::connect(running.addr).await.unwrap();
    let server_id = eventually(|| running.server.connections().first().copied()).await;

    raw.write_all(br#"{"Type":2,"Data":"before"}}}not json"#)
        .await
        .unwrap();
    let (_, first) = eventually(|| running.server.read_next_any()).await;
    assert_eq!(first, "before");

    // Give the garbage read time to be processed on its own.
    tokio::time::sleep(Duration::from_millis(50)).await;
    raw.write_all(br#"{"Type":2,"Data":"after"}"#).await.unwrap();
    let second = eventually(|| running.server.read_next(server_id)).await;
    assert_eq!(second, "after");
    assert!(running.server.has_connection(server_id));

    running.stop().await;
}

#[tokio::test]
async fn test_truncated_tail_does_not_cost_the_next_message() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let mut raw = TcpStream::connect(running.addr).await.unwrap();
    let server_id = eventually(|| running.server.connections().first().copied()).await;

    raw.write_all(br#"{"Type":2,"Data":"one"}{"Type":2,"Data":"two"}{"Type":2,"Da"#)
        .await
        .unwrap();
    let first = eventually(|| running.server.read_next(server_id)).await;
    let second = eventually(|| running.server.read_next(server_id)).await;
    assert_eq!((first.as_str(), second.as_str()), ("one", "two"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    raw.write_all(br#"{"Type":2,"Data":"three"}"#).await.unwrap();
    let third = eventually(|| running.server.read_next(server_id)).await;
    assert_eq!(third, "three");
    assert!(running.server.has_connection(server_id));

    running.stop().await;
}

#[tokio::test]
async fn test_split_and_non_ascii_payload_arrives_intact() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let client = TcpClient::new(client_settings()).unwrap();
    let client_id = client.connect(LOCALHOST, running.addr.port()).await.unwrap();

    let payload = "caf\u{e9} \u{1f980} {\"nested\": [1, 2]}";
    assert!(client.write(client_id, payload));
    let (server_id, received) = eventually(|| running.server.read_next_any()).await;
    assert_eq!(received, payload);

    let mut raw = TcpStream::connect(running.addr).await.unwrap();
    eventually(|| (running.server.connections().len() == 2).then_some(())).await;
    raw.write_all(br#"{"Type":2,"Da"#).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    raw.write_all(br#"ta":"joined"}"#).await.unwrap();
    let (raw_id, joined) = eventually(|| running.server.read_next_any()).await;
    assert_ne!(raw_id, server_id);
    assert_eq!(joined, "joined");

    running.stop().await;
}

#[tokio::test]
async fn test_disconnect_is_acknowledged_on_the_wire() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let mut raw = TcpStream::connect(running.addr).await.unwrap();
    let server_id = eventually(|| running.server.connections().first().copied()).await;

    raw.write_all(br#"{"Type":1,"Data":"request"}"#)
        .await
        .unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), raw.read_to_end(&mut received))
        .await
        .expect("Timed out waiting for the server to close")
        .unwrap();
    assert_eq!(received, br#"{"Type":1,"Data":"received"}"#);
    assert!(!running.server.has_connection(server_id));

    running.stop().await;
}

#[tokio::test]
async fn test_one_client_many_connections() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let client = TcpClient::new(client_settings()).unwrap();
    let first = client.connect(LOCALHOST, running.addr.port()).await.unwrap();
    let second = client.connect(LOCALHOST, running.addr.port()).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(client.connections().len(), 2);

    eventually(|| (running.server.connections().len() == 2).then_some(())).await;
    for server_id in running.server.connections() {
        assert!(running.server.write(server_id, &server_id.to_string()));
    }

    let a = eventually(|| client.read_next(first)).await;
    let b = eventually(|| client.read_next(second)).await;
    assert_ne!(a, b);

    assert!(client.disconnect(first));
    eventually(|| (!client.has_connection(first)).then_some(())).await;
    assert!(client.has_connection(second));

    running.stop().await;
}

#[tokio::test]
async fn test_listener_shutdown_closes_client_connections() {
    let running = RunningServer::start(server_settings(5_000)).await;
    let client = TcpClient::new(client_settings()).unwrap();
    let client_id = client.connect(LOCALHOST, running.addr.port()).await.unwrap();
    eventually(|| (running.server.connections().len() == 1).then_some(())).await;

    let server = running.server.clone();
    running.stop().await;
    assert!(server.connections().is_empty());

    eventually(|| (!client.has_connection(client_id)).then_some(())).await;
}
