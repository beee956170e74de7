//! Default values and protocol constants for tcp-comms.
//!
//! Centralizes the magic numbers used by the settings defaults, the wire
//! protocol and the framing codec so they can be discovered in one place.
//!
//! # Categories
//!
//! - **Timing**: loop cadences and the liveness timeout
//! - **Buffers**: socket read sizes and decoder limits
//! - **Protocol**: literal payloads carried by control messages

use std::net::{IpAddr, Ipv4Addr};

// ============================================================================
// Timing
// ============================================================================

/// Default interval between client heartbeat requests (milliseconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default heartbeat timeout (milliseconds).
///
/// A connection that has not received a heartbeat for longer than this is
/// torn down by the liveness monitor.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

/// Default liveness monitor sweep interval (milliseconds).
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 500;

/// Default incoming poll interval (milliseconds).
pub const DEFAULT_INCOMING_INTERVAL_MS: u64 = 10;

/// Default outgoing drain interval (milliseconds).
pub const DEFAULT_OUTGOING_INTERVAL_MS: u64 = 10;

// ============================================================================
// Buffers
// ============================================================================

/// Default maximum number of bytes read from a socket per incoming tick.
pub const DEFAULT_READ_BUFFER_SIZE_BYTES: usize = 8 * 1024;

/// Upper bound on bytes the decoder keeps while waiting for an incomplete
/// message to finish arriving (1 MB).
pub const MAX_PENDING_DECODE_BYTES: usize = 1024 * 1024;

// ============================================================================
// Server
// ============================================================================

/// Default server bind address (all IPv4 interfaces).
pub const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default server port.
pub const DEFAULT_PORT: u16 = 9_500;

// ============================================================================
// Protocol payloads
// ============================================================================

/// Payload of a heartbeat or disconnect sent to initiate an exchange.
pub const REQUEST_PAYLOAD: &str = "request";

/// Payload of a heartbeat or disconnect sent in reply.
pub const RECEIVED_PAYLOAD: &str = "received";
