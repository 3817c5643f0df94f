//! # control
//!
//! The control-service side of the gateway fabric. The lease store is the
//! single authority for address bindings; one stream client per configured
//! gateway keeps a persistent connection to the edge, pushes desired state
//! through the reconciler, absorbs discovered reality back into the store,
//! and answers gateway-originated lease-resolution queries.
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

pub mod client;
pub mod config;
pub mod proxmox;
pub mod reconcile;
pub mod resolve;
pub mod service;
pub mod store;
