//! A connection-oriented message router: a long-lived TCP server that
//! accepts authenticated clients, assigns each an identity, and routes
//! length-delimited binary frames between them.
//!
//! ## Design goals
//!
//! * Clients address peers by numeric user id; a frame addressed to uid 0
//!   is dispatched to the router's own handler call table instead of being
//!   forwarded
//! * One session per user: a re-login evicts and closes the prior socket
//! * Group fan-out: named groups of live sockets for one-to-many delivery
//! * Role-based permission checks on both local calls and forwards, behind
//!   a pluggable oracle
//! * Token authentication embedded in the connection handshake, behind a
//!   pluggable verifier
//! * Per-socket ordering: a single read loop serializes arrival order, a
//!   single write loop serializes egress order; no ordering across sockets
//! * Synchronous request/response calls for clients over the otherwise
//!   asynchronous duplex channel, correlated by ask id
//!
//! Explicitly *not* goals: message persistence, delivery guarantees across
//! reconnects, transport encryption (terminate TLS in front if needed), and
//! cross-node replication.
//!
//! ## Wire format
//!
//! Every frame is typed and length-delimited (integers little-endian):
//!
//! ```ascii
//! 0: frame type (u8) - 0xE0..=0xE7 reserved for control frames
//! 1: head length (u16)
//! 3: body length (u24) - at most 8388607
//! 6: head bytes
//! *: body bytes
//! ```
//!
//! Control frames drive the handshake and keep-alive:
//!
//! ```ascii
//! 0xE1 HandShake       (empty)
//! 0xE2 ActionRequire   head = action name, ASCII
//! 0xE3 DoAction        head = action name, body = argument bytes
//! 0xE4 AckResult       head = "ok" | "fail", body = payload or reason
//! 0xE5 Heartbeat       (empty)
//! 0xE6 Echo            body = echo payload
//! ```
//!
//! Application traffic travels in route frames whose 17-byte head carries
//! target uid, source uid, ask id, msg id and a message kind; see
//! [`route_head::RouteHead`].

pub mod auth;
pub mod calltable;
pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod handshake;
pub mod msgs;
pub mod packet;
pub mod permit;
pub mod route_head;
pub mod router;
pub mod server;
pub mod socket;

#[cfg(test)]
pub mod test_util;
