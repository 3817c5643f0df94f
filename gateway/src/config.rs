//! gateway configuration
//!
//! Parses from CLI or environment; the binary loads `.env` from its working
//! directory as well. A bad pool or missing secret is a fatal startup error.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub use clap::Parser;

use fabric_core::error::FabricError;
use pool_manager::AddressPool;

use crate::snat::SnatSettings;

/// Default stream port
pub const DEFAULT_STREAM_PORT: u16 = 1537;
/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 9091;
/// Default lease time handed to the daemon, in seconds
pub const DEFAULT_LEASE_TIME: u64 = 86_400;
/// default log level. All valid RUST_LOG arguments are accepted
pub const DEFAULT_GATEWAY_LOG: &str = "info";

/// parses from cli or environment var; the binary loads `.env` as well
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "gatewayd", bin_name = "gatewayd", about, long_about = None)]
pub struct Config {
    /// shared secret the control service must present when opening a stream
    #[clap(long, env = "GATEWAY_API_SECRET")]
    pub api_secret: String,
    /// port the stream server listens on
    #[clap(long, env = "GATEWAY_GRPC_PORT", default_value_t = DEFAULT_STREAM_PORT)]
    pub grpc_port: u16,
    /// port the metrics/health endpoint listens on
    #[clap(long, env = "GATEWAY_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,
    /// first address of the tenant pool
    #[clap(long, env = "GATEWAY_DHCP_POOL_START")]
    pub dhcp_pool_start: Ipv4Addr,
    /// last address of the tenant pool
    #[clap(long, env = "GATEWAY_DHCP_POOL_END")]
    pub dhcp_pool_end: Ipv4Addr,
    /// subnet mask of the tenant network
    #[clap(long, env = "GATEWAY_DHCP_SUBNET")]
    pub dhcp_subnet: Ipv4Addr,
    /// gateway address handed to tenants; must be outside the pool
    #[clap(long, env = "GATEWAY_DHCP_GATEWAY")]
    pub dhcp_gateway: Ipv4Addr,
    /// DNS servers handed to tenants
    #[clap(long, env = "GATEWAY_DHCP_DNS", value_delimiter = ',')]
    pub dhcp_dns: Vec<Ipv4Addr>,
    /// interface the DHCP daemon serves on
    #[clap(long, env = "GATEWAY_DHCP_INTERFACE")]
    pub dhcp_interface: String,
    /// search domain for tenant names
    #[clap(long, env = "GATEWAY_DHCP_DOMAIN")]
    pub dhcp_domain: String,
    /// directory holding the reservation file and the daemon's lease db/pid
    #[clap(long, env = "GATEWAY_DHCP_LEASES_DIR")]
    pub dhcp_leases_dir: PathBuf,
    /// lease time written to the reservation file, in seconds
    #[clap(long, env = "GATEWAY_DHCP_LEASE_TIME", default_value_t = DEFAULT_LEASE_TIME)]
    pub dhcp_lease_time: u64,
    /// source address for tenant SNAT; SNAT is disabled when unset
    #[clap(long, env = "GATEWAY_OUTBOUND_IP")]
    pub outbound_ip: Option<Ipv4Addr>,
    /// egress interface for SNAT; detected from the default route when unset
    #[clap(long, env = "GATEWAY_OUTBOUND_INTERFACE")]
    pub outbound_interface: Option<String>,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env = "GATEWAY_LOG", default_value = DEFAULT_GATEWAY_LOG)]
    pub gateway_log: String,
}

impl Config {
    /// Validate the pool configuration.
    pub fn address_pool(&self) -> Result<AddressPool, FabricError> {
        AddressPool::new(
            self.dhcp_pool_start,
            self.dhcp_pool_end,
            self.dhcp_subnet,
            self.dhcp_gateway,
            self.dhcp_dns.clone(),
            self.dhcp_domain.clone(),
            self.dhcp_interface.clone(),
        )
        .map_err(|e| FabricError::invalid_argument(e.to_string()))
    }

    /// The SNAT inputs, disabled when no outbound IP is configured.
    pub fn snat_settings(&self) -> SnatSettings {
        SnatSettings {
            outbound_ip: self.outbound_ip,
            gateway_ip: self.dhcp_gateway,
            subnet_mask: self.dhcp_subnet,
            interface: self.outbound_interface.clone(),
        }
    }

    /// Configured lease time as a `Duration`.
    pub fn lease_time(&self) -> Duration {
        Duration::from_secs(self.dhcp_lease_time)
    }

    /// Listen address for the stream server.
    pub fn stream_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.grpc_port))
    }

    /// Listen address for the metrics/health endpoint.
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }
}
