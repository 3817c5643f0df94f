//! Allocation reconciler.
//!
//! On connect and every sync period, the desired lease set for a gateway is
//! read from the store and pushed whole; the gateway's `sync_result` comes
//! back on the same stream and is absorbed here. Absorption is the one-way
//! channel by which edge reality informs the authority: discovered leases
//! are first-or-created so repeats are idempotent, and the gateway never
//! writes the store itself.
//!
//! Convergence is eventual. Callers needing immediate effect allocate
//! through the stream, which updates the edge's reservation file directly.

use tracing::{debug, info, warn};

use fabric_core::error::FabricError;
use fabric_core::mac::MacAddr;
use fabric_core::registry::GatewayHandle;
use fabric_core::wire::{DesiredAllocation, DiscoveredAllocation, GatewayMessage};

use crate::resolve::LeaseResolver;
use crate::store::{LeaseStore, NewLease};

/// Push the full desired allocation set for `gateway_node` down its stream.
/// Returns how many allocations were sent.
pub async fn push_allocations(
    store: &LeaseStore,
    handle: &GatewayHandle,
    gateway_node: &str,
) -> Result<usize, FabricError> {
    let leases = store
        .leases_for_gateway(gateway_node)
        .await
        .map_err(FabricError::from)?;

    let mut allocations = Vec::with_capacity(leases.len());
    for lease in leases {
        let (Ok(mac), Ok(ip)) = (
            lease.mac_address.parse::<MacAddr>(),
            lease.ip_address.parse::<std::net::Ipv4Addr>(),
        ) else {
            warn!(
                lease_id = %lease.lease_id,
                mac = %lease.mac_address,
                ip = %lease.ip_address,
                "stored lease does not parse; skipping from sync"
            );
            continue;
        };
        allocations.push(DesiredAllocation {
            vps_id: lease.vps_id,
            organization_id: lease.organization_id,
            mac_address: mac,
            ip_address: ip,
            is_public: lease.is_public,
        });
    }

    let count = allocations.len();
    handle
        .send(GatewayMessage::SyncAllocations { allocations })
        .await?;
    debug!(gateway_node, count, "pushed desired allocations");
    Ok(count)
}

/// Absorb a gateway's sync result into the lease store.
pub async fn absorb_sync_result(
    store: &LeaseStore,
    resolver: &LeaseResolver,
    gateway_node: &str,
    added: u64,
    removed: u64,
    discovered: Vec<DiscoveredAllocation>,
) {
    info!(
        gateway_node,
        added,
        removed,
        discovered = discovered.len(),
        "gateway sync result"
    );

    for d in discovered {
        let (vps_id, organization_id) = identify(resolver, &d).await;
        let new_lease = NewLease {
            vps_id,
            organization_id,
            mac_address: d.mac_address.to_string(),
            ip_address: d.ip_address.to_string(),
            gateway_node: gateway_node.to_owned(),
            is_public: false,
            expires_at: None,
        };
        match store.first_or_create(&new_lease).await {
            Ok((lease, true)) => info!(
                gateway_node,
                vps_id = %lease.vps_id,
                mac = %lease.mac_address,
                ip = %lease.ip_address,
                "registered discovered lease"
            ),
            Ok((_, false)) => debug!(mac = %d.mac_address, "discovered lease already known"),
            Err(err) => warn!(
                gateway_node,
                mac = %d.mac_address,
                %err,
                "could not absorb discovered lease"
            ),
        }
    }
}

/// Work out who a discovered lease belongs to. The gateway may have already
/// resolved the owner; otherwise run the resolution chain here. A lease
/// nobody can attribute still gets a row, under a stable placeholder
/// identity derived from the MAC, so the authority knows the address is
/// taken and absorption stays idempotent.
async fn identify(resolver: &LeaseResolver, d: &DiscoveredAllocation) -> (String, String) {
    if !d.vps_id.is_empty() {
        return (d.vps_id.clone(), d.organization_id.clone());
    }
    let resolved = resolver
        .find_vps_by_lease(&fabric_core::wire::FindVpsByLeaseRequest {
            mac_address: Some(d.mac_address.to_string()),
            ip_address: Some(d.ip_address.to_string()),
        })
        .await;
    if !resolved.vps_id.is_empty() {
        return (resolved.vps_id, resolved.organization_id);
    }
    (format!("unassigned-{}", d.mac_address.hex()), String::new())
}
