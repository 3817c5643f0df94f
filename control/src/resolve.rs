//! Lease resolution.
//!
//! Answers gateway-originated "who owns this MAC/IP?" queries. Resolution
//! order is MAC against the lease store, MAC against live instances, MAC
//! against the hypervisor inventory, then IP against the lease store, then
//! IP against public-IP assignments. A miss is an empty response, never an
//! error; an unreachable inventory is logged and skipped.

use std::sync::Arc;

use tracing::{debug, warn};

use fabric_core::wire::{FindVpsByLeaseRequest, FindVpsByLeaseResponse};

use crate::proxmox::VmInventory;
use crate::store::{LeaseStore, NewLease};

/// The lease-resolution handler: store lookups plus the inventory oracle.
#[derive(Clone)]
pub struct LeaseResolver {
    store: LeaseStore,
    inventory: Arc<dyn VmInventory>,
}

impl std::fmt::Debug for LeaseResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseResolver").finish_non_exhaustive()
    }
}

impl LeaseResolver {
    /// A resolver over the given store and inventory oracle.
    pub fn new(store: LeaseStore, inventory: Arc<dyn VmInventory>) -> Self {
        Self { store, inventory }
    }

    /// The underlying lease store.
    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    /// Resolve a MAC and/or IP to its owning VPS and organization.
    pub async fn find_vps_by_lease(
        &self,
        req: &FindVpsByLeaseRequest,
    ) -> FindVpsByLeaseResponse {
        let mac = req
            .mac_address
            .as_deref()
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty());
        let ip = req
            .ip_address
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty());

        if let Some(mac) = &mac {
            match self.store.find_lease_by_mac(mac).await {
                Ok(Some(lease)) => {
                    return FindVpsByLeaseResponse {
                        vps_id: lease.vps_id,
                        organization_id: lease.organization_id,
                    };
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "lease-by-mac lookup failed"),
            }

            match self.store.find_instance_by_mac(mac).await {
                Ok(Some(instance)) => {
                    return FindVpsByLeaseResponse {
                        vps_id: instance.id,
                        organization_id: instance.organization_id,
                    };
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "instance-by-mac lookup failed"),
            }

            match self.inventory.find_vm_by_mac(mac).await {
                Ok(Some(vm)) => {
                    self.write_through(&vm, mac, ip).await;
                    return FindVpsByLeaseResponse {
                        vps_id: vm.vps_id,
                        organization_id: vm.organization_id,
                    };
                }
                Ok(None) => debug!(mac, "inventory has no VM for this mac"),
                Err(err) => warn!(%err, "inventory oracle unavailable; continuing"),
            }
        }

        if let Some(ip) = ip {
            match self.store.find_lease_by_ip(ip).await {
                Ok(Some(lease)) => {
                    return FindVpsByLeaseResponse {
                        vps_id: lease.vps_id,
                        organization_id: lease.organization_id,
                    };
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "lease-by-ip lookup failed"),
            }

            match self.store.find_public_ip(ip).await {
                Ok(Some(public)) => {
                    return FindVpsByLeaseResponse {
                        vps_id: public.vps_id,
                        organization_id: public.organization_id,
                    };
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "public-ip lookup failed"),
            }
        }

        FindVpsByLeaseResponse::default()
    }

    /// Record an inventory hit in the lease store so the next query is
    /// local. Only possible when the gateway told us the IP it observed.
    async fn write_through(
        &self,
        vm: &crate::proxmox::InventoryVm,
        mac: &str,
        ip: Option<&str>,
    ) {
        let Some(ip) = ip else { return };
        let new_lease = NewLease {
            vps_id: vm.vps_id.clone(),
            organization_id: vm.organization_id.clone(),
            mac_address: mac.to_owned(),
            ip_address: ip.to_owned(),
            gateway_node: vm.node.clone(),
            is_public: false,
            expires_at: None,
        };
        match self.store.first_or_create(&new_lease).await {
            Ok((_, true)) => debug!(vps_id = %vm.vps_id, mac, ip, "wrote inventory hit through to the store"),
            Ok((_, false)) => {}
            Err(err) => warn!(%err, "write-through of inventory hit failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tracing_test::traced_test;

    use crate::proxmox::{InventoryVm, NoInventory, VmInventory};

    use super::*;

    #[derive(Debug)]
    struct StubInventory {
        vm: Option<InventoryVm>,
        fail: bool,
    }

    #[async_trait]
    impl VmInventory for StubInventory {
        async fn find_vm_by_mac(&self, _mac: &str) -> anyhow::Result<Option<InventoryVm>> {
            if self.fail {
                anyhow::bail!("inventory unreachable");
            }
            Ok(self.vm.clone())
        }
    }

    async fn store() -> LeaseStore {
        LeaseStore::open("sqlite::memory:").await.unwrap()
    }

    fn req(mac: Option<&str>, ip: Option<&str>) -> FindVpsByLeaseRequest {
        FindVpsByLeaseRequest {
            mac_address: mac.map(str::to_owned),
            ip_address: ip.map(str::to_owned),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn lease_store_wins_and_mac_is_normalised() {
        let store = store().await;
        store
            .upsert_lease(&NewLease {
                vps_id: "vps-a".into(),
                organization_id: "org-1".into(),
                mac_address: "aa:bb:cc:dd:ee:01".into(),
                ip_address: "10.0.0.10".into(),
                gateway_node: "node-a".into(),
                is_public: false,
                expires_at: None,
            })
            .await
            .unwrap();
        let resolver = LeaseResolver::new(store, Arc::new(NoInventory));

        let resp = resolver
            .find_vps_by_lease(&req(Some("  AA:BB:CC:DD:EE:01 "), None))
            .await;
        assert_eq!(resp.vps_id, "vps-a");
        assert_eq!(resp.organization_id, "org-1");
    }

    #[tokio::test]
    #[traced_test]
    async fn instances_are_the_second_stop() {
        let store = store().await;
        store
            .insert_instance("vps-b", "org-2", Some("aa:bb:cc:dd:ee:02"), Some("node-a"), "running")
            .await
            .unwrap();
        let resolver = LeaseResolver::new(store, Arc::new(NoInventory));

        let resp = resolver
            .find_vps_by_lease(&req(Some("aa:bb:cc:dd:ee:02"), None))
            .await;
        assert_eq!(resp.vps_id, "vps-b");
        assert_eq!(resp.organization_id, "org-2");
    }

    #[tokio::test]
    #[traced_test]
    async fn inventory_hit_writes_through() {
        let store = store().await;
        let resolver = LeaseResolver::new(
            store.clone(),
            Arc::new(StubInventory {
                vm: Some(InventoryVm {
                    vps_id: "vps-c".into(),
                    organization_id: "org-3".into(),
                    node: "node-a".into(),
                }),
                fail: false,
            }),
        );

        let resp = resolver
            .find_vps_by_lease(&req(Some("aa:bb:cc:dd:ee:03"), Some("10.0.0.13")))
            .await;
        assert_eq!(resp.vps_id, "vps-c");

        // the hit is now in the store and resolves without the oracle
        let lease = store
            .find_lease_by_mac("aa:bb:cc:dd:ee:03")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.vps_id, "vps-c");
        assert_eq!(lease.gateway_node, "node-a");
    }

    #[tokio::test]
    #[traced_test]
    async fn unavailable_inventory_falls_through_to_ip() {
        let store = store().await;
        store
            .insert_public_ip("203.0.113.9", "vps-d", "org-4")
            .await
            .unwrap();
        let resolver =
            LeaseResolver::new(store, Arc::new(StubInventory { vm: None, fail: true }));

        let resp = resolver
            .find_vps_by_lease(&req(Some("aa:bb:cc:dd:ee:04"), Some("203.0.113.9")))
            .await;
        assert_eq!(resp.vps_id, "vps-d");
        assert_eq!(resp.organization_id, "org-4");
    }

    #[tokio::test]
    #[traced_test]
    async fn a_miss_is_an_empty_response() {
        let resolver = LeaseResolver::new(store().await, Arc::new(NoInventory));
        let resp = resolver
            .find_vps_by_lease(&req(Some("aa:bb:cc:dd:ee:05"), Some("10.0.0.99")))
            .await;
        assert!(resp.vps_id.is_empty());
        assert!(resp.organization_id.is_empty());

        let resp = resolver.find_vps_by_lease(&req(None, None)).await;
        assert!(resp.vps_id.is_empty());
    }
}
