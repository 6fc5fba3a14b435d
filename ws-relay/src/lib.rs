//! WebSocket relay that forwards every JSON message to all other connected clients.
//!
//! There are no topics and no persistence: a message reaches whoever is connected when it
//! arrives. Each module owns one concern:
//!
//! - [`registry`] holds the live set of connections behind a single-owner actor and hands out
//!   point-in-time snapshots for fan-out.
//! - [`dispatcher`] runs one connection from registration to deregistration, decoding inbound
//!   frames and fanning them out to every other peer.
//! - [`server`] accepts TCP connections, performs the WebSocket handshake and drains
//!   connections on shutdown.
//! - [`message`] parses and re-encodes JSON payloads.
//! - [`cli`] parses the command line for `serve` and `connect`.
//! - [`client`] is a small terminal client for poking at a running relay.

pub mod cli;
pub mod client;
pub mod dispatcher;
pub mod message;
pub mod registry;
pub mod server;
