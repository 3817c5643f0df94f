//! # fabric-core
//!
//! Shared kernel for the VPS gateway fabric. Both the control service and the
//! edge gateway build on the pieces in this crate:
//!
//! * [`wire`] -- the `GatewayMessage` tagged union and request/response payloads
//! * [`mux`] -- request/response correlation over a single bidirectional stream
//! * [`registry`] -- the in-memory map of live gateway registrations
//! * [`error`] -- the cross-process error taxonomy
//! * [`mac`] -- canonical MAC address handling
//! * [`ws`] -- WebSocket-as-byte-stream adapter used by SSH tunnels
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod env;
pub mod error;
pub mod mac;
pub mod metrics;
pub mod mux;
pub mod registry;
pub mod trace;
pub mod wire;
pub mod ws;

/// Header carrying the shared secret when a stream or tunnel is established.
pub static API_SECRET_HEADER: &str = "x-api-secret";

/// Heartbeat period for both sides of a gateway stream.
pub const HEARTBEAT_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

/// Period of the allocation reconciler; the first sync fires on connect.
pub const SYNC_PERIOD: std::time::Duration = std::time::Duration::from_secs(300);

/// How long the stream server waits for the opening `register` message.
pub const REGISTER_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

/// Flat delay between reconnect attempts on the control side.
pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);
