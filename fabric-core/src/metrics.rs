#![allow(missing_docs)]

//! # metrics
//!
//! process-wide counters and gauges, exported by the external API
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "process uptime (seconds)").unwrap();

    // DHCP manager metrics (edge)

    /// count of successful address allocations since start
    pub static ref DHCP_ALLOCATIONS_TOTAL: IntCounter =
        register_int_counter!("dhcp_allocations_total", "count of successful DHCP allocations").unwrap();
    /// count of currently reserved addresses
    pub static ref DHCP_ALLOCATIONS_ACTIVE: IntGauge =
        register_int_gauge!("dhcp_allocations_active", "count of active DHCP reservations").unwrap();
    /// total size of the configured pool
    pub static ref DHCP_POOL_SIZE: IntGauge =
        register_int_gauge!("dhcp_pool_size", "size of the configured DHCP pool").unwrap();
    /// free addresses remaining in the pool
    pub static ref DHCP_POOL_AVAILABLE: IntGauge =
        register_int_gauge!("dhcp_pool_available", "free addresses remaining in the DHCP pool").unwrap();
    /// 1 when the local DHCP daemon acknowledged the last reload signal, else 0
    pub static ref DHCP_SERVER_STATUS: IntGauge =
        register_int_gauge!("dhcp_server_status", "local DHCP daemon reachability (1 = ok)").unwrap();

    // SSH proxy metrics (edge)

    /// count of proxied SSH connections since start
    pub static ref SSH_PROXY_CONNECTIONS_TOTAL: IntCounter =
        register_int_counter!("ssh_proxy_connections_total", "count of proxied SSH connections").unwrap();
    /// count of currently open proxied SSH connections
    pub static ref SSH_PROXY_CONNECTIONS_ACTIVE: IntGauge =
        register_int_gauge!("ssh_proxy_connections_active", "count of open proxied SSH connections").unwrap();

    // stream metrics (both sides)

    /// count of currently registered gateway streams
    pub static ref GATEWAY_STREAMS_ACTIVE: IntGauge =
        register_int_gauge!("gateway_streams_active", "count of registered gateway streams").unwrap();
}
