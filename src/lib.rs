//! tcp-comms - buffered message transport over raw TCP sockets.
//!
//! Peers exchange string payloads wrapped in a small JSON envelope. The
//! crate keeps each connection alive with heartbeats, tears it down on
//! request or timeout, and recovers messages from a byte stream that carries
//! no delimiters.
//!
//! # Architecture
//!
//! All loops of a role share one [`CommsState`]:
//!
//! - **Registry** - live connections with their liveness state
//! - **Queues** - received payloads (input) and messages to send (output)
//! - **Loops** - heartbeat, incoming, outgoing and liveness monitor tasks
//!
//! The application only touches the queues, through the [`Comms`] trait:
//! `write`, `disconnect`, `read_next` and `read_next_any` never block.
//!
//! # Modules
//!
//! - [`wire`] - message envelope
//! - [`framing`] - concatenated-JSON encoder and decoder
//! - [`registry`] - connection registry
//! - [`queue`] - input and output queues
//! - [`tasks`] - per-connection loops
//! - [`client`] / [`server`] - role entry points
//! - [`config`] - settings loading

pub mod client;
pub mod comms;
pub mod config;
pub mod constants;
pub mod framing;
pub mod queue;
pub mod registry;
pub mod server;
pub mod tasks;
pub mod wire;

// Re-export commonly used types
pub use client::TcpClient;
pub use comms::{Comms, CommsState};
pub use config::{ClientSettings, ServerSettings};
pub use server::TcpServer;
pub use wire::{MessageType, WireMessage};
