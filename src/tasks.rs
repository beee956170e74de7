//! Background loops serving connections.
//!
//! Every loop is a spawned task that ticks on a fixed interval and stops as
//! soon as its [`CancellationToken`] fires. A connection owns one token;
//! tearing the connection down cancels it and every loop serving that
//! connection exits on its next poll.
//!
//! - heartbeat emitter (client only): queues a heartbeat request per tick
//! - incoming processor: reads the socket, decodes and dispatches messages
//! - outgoing processor: drains the output queue onto the socket
//! - liveness monitor: tears down connections that timed out or asked to
//!   disconnect (one per connection on the client, one global on the server)

use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::comms::CommsState;
use crate::constants::{RECEIVED_PAYLOAD, REQUEST_PAYLOAD};
use crate::framing::{encode, FrameDecoder};
use crate::registry::ConnectionStatus;
use crate::wire::{MessageType, WireMessage};

/// Which side of the connection a loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates connections and emits heartbeats.
    Client,
    /// Accepts connections and answers heartbeats and disconnects.
    Server,
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Read errors after which the socket is unusable.
pub(crate) fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

/// Spawn the client heartbeat emitter.
pub fn spawn_heartbeat(
    state: CommsState,
    connection_id: Uuid,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let heartbeat = WireMessage::Heartbeat(REQUEST_PAYLOAD.to_string());
                    if !state.enqueue(connection_id, heartbeat) {
                        log::debug!("[Heartbeat] {} not registered, skipping tick", connection_id);
                    }
                }
            }
        }
        log::debug!("[Heartbeat] {} stopped", connection_id);
    })
}

/// Spawn the incoming processor for one connection.
///
/// Each tick reads at most `read_buffer_size` bytes without waiting. An
/// incomplete trailing message is kept for the next read.
pub fn spawn_incoming(
    state: CommsState,
    connection_id: Uuid,
    reader: OwnedReadHalf,
    interval: Duration,
    read_buffer_size: usize,
    role: Role,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; read_buffer_size];
        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !poll_socket(&state, connection_id, &reader, &mut buf, &mut decoder, role) {
                        break;
                    }
                }
            }
        }
        log::debug!("[Incoming] {} stopped", connection_id);
    })
}

/// One non-blocking read. Returns `false` once the stream is finished.
fn poll_socket(
    state: &CommsState,
    connection_id: Uuid,
    reader: &OwnedReadHalf,
    buf: &mut [u8],
    decoder: &mut FrameDecoder,
    role: Role,
) -> bool {
    match reader.try_read(buf) {
        Ok(0) => {
            log::info!("[Incoming] {} closed by peer", connection_id);
            state.registry.mark_disconnect(connection_id);
            false
        }
        Ok(n) => {
            let batch = decoder.feed(&buf[..n]);
            for message in batch.messages {
                dispatch(state, connection_id, role, message);
            }
            if let Some(e) = batch.error {
                log::warn!(
                    "[Incoming] {} discarded malformed input: {:#}",
                    connection_id,
                    e
                );
            }
            true
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
            true
        }
        Err(e) => {
            log::warn!("[Incoming] {} read failed: {}", connection_id, e);
            if is_fatal(&e) {
                state.registry.mark_disconnect(connection_id);
                return false;
            }
            true
        }
    }
}

/// Route one decoded message.
pub(crate) fn dispatch(state: &CommsState, connection_id: Uuid, role: Role, message: WireMessage) {
    match message {
        WireMessage::Heartbeat(_) => {
            if !state.registry.update_heartbeat(connection_id) {
                return;
            }
            if role == Role::Server {
                state.enqueue(
                    connection_id,
                    WireMessage::Heartbeat(RECEIVED_PAYLOAD.to_string()),
                );
            }
        }
        WireMessage::Data(payload) => {
            if state.registry.has(connection_id) {
                log::debug!("[Incoming] {} data ({} bytes)", connection_id, payload.len());
                state.input.add(connection_id, payload);
            }
        }
        WireMessage::Disconnect(_) => match role {
            // The ack is written before the connection is flagged, see
            // `flush_pending`.
            Role::Server => {
                log::info!("[Incoming] {} requested disconnect", connection_id);
                state.enqueue(
                    connection_id,
                    WireMessage::Disconnect(RECEIVED_PAYLOAD.to_string()),
                );
            }
            Role::Client => {
                log::info!("[Incoming] {} disconnect from server", connection_id);
                state.registry.mark_disconnect(connection_id);
            }
        },
        WireMessage::Invalid(payload) => {
            log::debug!(
                "[Incoming] {} ignoring invalid message ({} bytes)",
                connection_id,
                payload.len()
            );
        }
    }
}

/// Spawn the outgoing processor for one connection.
///
/// The write half is shut down when the loop exits.
pub fn spawn_outgoing(
    state: CommsState,
    connection_id: Uuid,
    mut writer: OwnedWriteHalf,
    interval: Duration,
    role: Role,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !flush_pending(&state, connection_id, &mut writer, role).await {
                        break;
                    }
                }
            }
        }
        if let Err(e) = writer.shutdown().await {
            log::debug!("[Outgoing] {} shutdown failed: {}", connection_id, e);
        }
        log::debug!("[Outgoing] {} stopped", connection_id);
    })
}

/// Write every queued message for the connection, oldest first.
///
/// A message leaves the queue only after it was written. Any write error
/// flags the connection for teardown and returns `false`.
async fn flush_pending(
    state: &CommsState,
    connection_id: Uuid,
    writer: &mut OwnedWriteHalf,
    role: Role,
) -> bool {
    while state.registry.has(connection_id) {
        let Some(item) = state.output.next_for(connection_id) else {
            break;
        };

        let bytes = match encode(&item.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("[Outgoing] {} failed to encode message: {}", connection_id, e);
                state.output.remove(item.message_id);
                continue;
            }
        };

        // A failed write may have sent part of the frame, so the stream is
        // no longer aligned on message boundaries.
        if let Err(e) = writer.write_all(&bytes).await {
            log::error!("[Outgoing] {} write failed: {}", connection_id, e);
            state.registry.mark_disconnect(connection_id);
            return false;
        }

        state.output.remove(item.message_id);
        log::trace!(
            "[Outgoing] {} sent {:?} ({} bytes)",
            connection_id,
            item.payload.message_type(),
            bytes.len()
        );

        if role == Role::Server && item.payload.message_type() == MessageType::Disconnect {
            state.registry.mark_disconnect(connection_id);
        }
    }
    true
}

/// Spawn the liveness monitor for a single client connection.
///
/// Exits after tearing the connection down.
pub fn spawn_connection_monitor(
    state: CommsState,
    connection_id: Uuid,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match state.registry.status(connection_id, timeout) {
                    ConnectionStatus::Active => {}
                    ConnectionStatus::PendingTeardown(reason) => {
                        if state.teardown(connection_id) {
                            log::info!("[Monitor] {} closed ({})", connection_id, reason);
                        }
                        break;
                    }
                    ConnectionStatus::Closed => break,
                },
            }
        }
        log::debug!("[Monitor] {} stopped", connection_id);
    })
}

/// Spawn the server-wide liveness monitor sweeping every connection.
pub fn spawn_global_monitor(
    state: CommsState,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for (connection_id, reason) in state.registry.sweep(timeout) {
                        if state.teardown(connection_id) {
                            log::info!("[Monitor] {} closed ({})", connection_id, reason);
                        }
                    }
                }
            }
        }
        log::debug!("[Monitor] global monitor stopped");
    })
}
