//! Wire protocol for the gateway stream.
//!
//! Every frame on the stream is one JSON-encoded [`GatewayMessage`]. The
//! `type` discriminator selects the variant; receivers MUST ignore variants
//! they do not understand (they decode to [`GatewayMessage::Unknown`]), which
//! is what keeps old gateways compatible with a newer control service.
//!
//! Request and response payloads are opaque at the framing layer
//! (`serde_json::Value`); the typed structs in this module are the payload
//! contract for each method.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FabricError;
use crate::mac::MacAddr;

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

/// The single message type exchanged on a gateway stream, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// First message on a stream (control -> edge). Names the gateway the
    /// control side believes it is dialling.
    Register { gateway_id: String, version: String },
    /// Acknowledgment of a successful register (edge -> control).
    Registered { gateway_id: String, version: String },
    /// Periodic liveness signal, sent by both sides.
    Heartbeat { timestamp: DateTime<Utc> },
    /// A correlated request. `request_id` is unique per sender per stream.
    Request {
        request_id: String,
        method: String,
        #[serde(default)]
        payload: Value,
    },
    /// The reply to a `Request`, correlated by `request_id`.
    Response {
        request_id: String,
        success: bool,
        #[serde(default)]
        error: String,
        #[serde(default)]
        payload: Value,
    },
    /// Full desired lease set for this gateway (control -> edge).
    SyncAllocations { allocations: Vec<DesiredAllocation> },
    /// Outcome of applying a `SyncAllocations` (edge -> control).
    SyncResult {
        added: u64,
        removed: u64,
        #[serde(default)]
        discovered_allocations: Vec<DiscoveredAllocation>,
    },
    /// Any variant this build does not know about. Ignored on receive.
    #[serde(other)]
    Unknown,
}

/// One lease the control service wants materialised on a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredAllocation {
    /// Owning VPS.
    pub vps_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// NIC the lease binds.
    pub mac_address: MacAddr,
    /// Address to reserve.
    pub ip_address: Ipv4Addr,
    /// Public or private scope.
    #[serde(default)]
    pub is_public: bool,
}

/// A lease the gateway's DHCP daemon knows about but the control service
/// did not push. `vps_id`/`organization_id` are filled in when the edge could
/// resolve the owner; empty means unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredAllocation {
    /// Resolved owner; empty when unknown.
    #[serde(default)]
    pub vps_id: String,
    /// Resolved organization; empty when unknown.
    #[serde(default)]
    pub organization_id: String,
    /// MAC observed by the daemon.
    pub mac_address: MacAddr,
    /// Address observed by the daemon.
    pub ip_address: Ipv4Addr,
    /// Hostname from the daemon's lease database, if it reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

// ---------------------------------------------------------------------------
// Request methods
// ---------------------------------------------------------------------------

/// Method names carried in `Request.method`.
pub mod methods {
    /// control -> edge: allocate an address for a VPS.
    pub const ALLOCATE_IP: &str = "allocate_ip";
    /// control -> edge: release the reservation held by a VPS.
    pub const RELEASE_IP: &str = "release_ip";
    /// control -> edge: list local reservations.
    pub const LIST_IPS: &str = "list_ips";
    /// control -> edge: pool configuration diagnostic.
    pub const GET_CONFIG: &str = "get_config";
    /// edge -> control: resolve a lease to its owning VPS/organization.
    pub const FIND_VPS_BY_LEASE: &str = "find_vps_by_lease";
    /// edge -> control: latest gauge snapshot for this gateway.
    pub const REPORT_METRICS: &str = "report_metrics";
}

// ---------------------------------------------------------------------------
// Payload contracts
// ---------------------------------------------------------------------------

/// Payload of `allocate_ip` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateIpRequest {
    /// VPS the address is for.
    pub vps_id: String,
    /// Organization the VPS belongs to.
    pub organization_id: String,
    /// MAC of the VPS NIC.
    pub mac_address: MacAddr,
}

/// Payload of `allocate_ip` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateIpResponse {
    /// Assigned address.
    pub ip_address: Ipv4Addr,
    /// Subnet mask of the tenant network.
    pub subnet_mask: Ipv4Addr,
    /// Gateway address handed to the tenant.
    pub gateway: Ipv4Addr,
    /// DNS servers handed to the tenant.
    pub dns_servers: Vec<Ipv4Addr>,
    /// When the reservation's lease runs out.
    pub lease_expires: DateTime<Utc>,
}

/// Payload of `release_ip` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseIpRequest {
    /// VPS whose reservation is dropped.
    pub vps_id: String,
}

/// Payload of `release_ip` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseIpResponse {
    /// False when no reservation existed for the VPS (release is idempotent).
    pub released: bool,
}

/// Payload of `list_ips` requests. Both filters are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListIpsRequest {
    /// Keep only this organization's entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Keep only this VPS's entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vps_id: Option<String>,
}

/// Payload of `list_ips` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListIpsResponse {
    /// Matching reservations, in ascending address order.
    pub allocations: Vec<AllocationEntry>,
}

/// One reservation as reported by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry {
    /// Owning VPS.
    pub vps_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Reserved MAC.
    pub mac_address: MacAddr,
    /// Reserved address.
    pub ip_address: Ipv4Addr,
    /// Public or private scope.
    #[serde(default)]
    pub is_public: bool,
}

/// Payload of `get_config` responses: the pool diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfigResponse {
    /// First address of the pool.
    pub pool_start: Ipv4Addr,
    /// Last address of the pool.
    pub pool_end: Ipv4Addr,
    /// Subnet mask of the tenant network.
    pub subnet_mask: Ipv4Addr,
    /// Gateway address handed to tenants.
    pub gateway: Ipv4Addr,
    /// Search domain for tenant names.
    pub domain: String,
    /// DNS servers handed to tenants.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Total pool size.
    pub pool_size: u64,
    /// Addresses currently unreserved.
    pub available: u64,
}

/// Payload of `find_vps_by_lease` requests. MAC is tried before IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindVpsByLeaseRequest {
    /// MAC to resolve, any case or separator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Dotted IPv4 address to resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Empty fields mean "unknown"; resolution misses are not errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindVpsByLeaseResponse {
    /// Owning VPS, or empty.
    #[serde(default)]
    pub vps_id: String,
    /// Owning organization, or empty.
    #[serde(default)]
    pub organization_id: String,
}

/// Gauge snapshot a gateway pushes with `report_metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Active reservation count.
    pub dhcp_allocations_active: i64,
    /// Configured pool size.
    pub dhcp_pool_size: i64,
    /// Free addresses remaining.
    pub dhcp_pool_available: i64,
    /// Open proxied SSH connections.
    pub ssh_proxy_connections_active: i64,
    /// 1 when the local DHCP daemon acknowledged the last signal.
    pub dhcp_server_status: i64,
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Encode a typed payload into the opaque `payload` field.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, FabricError> {
    serde_json::to_value(value)
        .map_err(|e| FabricError::internal(format!("encoding payload: {e}")))
}

/// Decode the opaque `payload` field into a typed payload.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FabricError> {
    serde_json::from_value(value)
        .map_err(|e| FabricError::invalid_argument(format!("malformed payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let msg = GatewayMessage::Request {
            request_id: "7".into(),
            method: methods::ALLOCATE_IP.into(),
            payload: encode(&AllocateIpRequest {
                vps_id: "vps-A".into(),
                organization_id: "org-1".into(),
                mac_address: "aa:bb:cc:dd:ee:01".parse().unwrap(),
            })
            .unwrap(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: GatewayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn type_tag_is_snake_case() {
        let msg = GatewayMessage::Register {
            gateway_id: "node-a".into(),
            version: "0.1.0".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "register");

        let msg = GatewayMessage::SyncAllocations {
            allocations: vec![],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sync_allocations");
    }

    #[test]
    fn unknown_variant_is_tolerated() {
        let back: GatewayMessage =
            serde_json::from_str(r#"{"type":"quantum_entangle","payload":{"x":1}}"#).unwrap();
        assert_eq!(back, GatewayMessage::Unknown);
    }

    #[test]
    fn response_defaults_are_lenient() {
        // A success response may omit error and payload entirely.
        let back: GatewayMessage =
            serde_json::from_str(r#"{"type":"response","request_id":"3","success":true}"#).unwrap();
        match back {
            GatewayMessage::Response {
                request_id,
                success,
                error,
                payload,
            } => {
                assert_eq!(request_id, "3");
                assert!(success);
                assert!(error.is_empty());
                assert!(payload.is_null());
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn sync_result_round_trip() {
        let msg = GatewayMessage::SyncResult {
            added: 1,
            removed: 0,
            discovered_allocations: vec![DiscoveredAllocation {
                vps_id: String::new(),
                organization_id: String::new(),
                mac_address: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
                ip_address: "10.0.0.12".parse().unwrap(),
                hostname: Some("squatter".into()),
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: GatewayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn payload_codec_maps_errors() {
        let err = decode::<AllocateIpRequest>(serde_json::json!({"vps_id": 42})).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }
}
