//! # gateway
//!
//! The edge process that sits next to a hypervisor. It owns the node's DHCP
//! pool (delegating the wire protocol to a local daemon it configures
//! declaratively), relays SSH connections to tenant VMs behind NAT, keeps one
//! SNAT rule per tenant subnet, and serves the persistent stream the control
//! service drives it through.
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

pub mod config;
pub mod dhcp;
pub mod proxy;
pub mod server;
pub mod snat;
