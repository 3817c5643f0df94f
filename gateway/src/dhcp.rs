//! DHCP manager.
//!
//! Owns the node's address pool and the reservation file the local DHCP
//! daemon consumes. All mutation goes through one mutex covering both the
//! in-memory set and the file: build the new set, rewrite the file
//! atomically, and only then let the change stand. A failed rewrite rolls
//! the set back and surfaces `unavailable` so the control side can retry; a
//! failed daemon signal is logged and the file is picked up on the daemon's
//! next start.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fabric_core::error::FabricError;
use fabric_core::mac::MacAddr;
use fabric_core::metrics::{
    DHCP_ALLOCATIONS_ACTIVE, DHCP_ALLOCATIONS_TOTAL, DHCP_POOL_AVAILABLE, DHCP_POOL_SIZE,
    DHCP_SERVER_STATUS,
};
use fabric_core::wire::{
    AllocateIpResponse, AllocationEntry, DesiredAllocation, DiscoveredAllocation,
    PoolConfigResponse,
};
use pool_manager::file::{
    DAEMON_LEASE_DB, DAEMON_PID_FILE, RESERVATION_FILE, read_daemon_leases, render, signal_daemon,
    write_atomic,
};
use pool_manager::{AddressPool, Reservation, ReservationSet};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Reservations newly materialised locally.
    pub added: u64,
    /// Managed reservations dropped locally.
    pub removed: u64,
    /// Live daemon leases the control plane did not push.
    pub discovered: Vec<DiscoveredAllocation>,
}

/// Owner of the node's pool, reservation set, and reservation file.
#[derive(Debug)]
pub struct DhcpManager {
    pool: AddressPool,
    lease_time: Duration,
    reservation_path: PathBuf,
    daemon_db_path: PathBuf,
    daemon_pid_path: PathBuf,
    state: Mutex<ReservationSet>,
}

impl DhcpManager {
    /// Open the manager, restoring managed reservations from a previous run's
    /// reservation file if one exists.
    pub async fn open(
        pool: AddressPool,
        lease_time: Duration,
        leases_dir: &Path,
    ) -> Result<Self, FabricError> {
        tokio::fs::create_dir_all(leases_dir)
            .await
            .map_err(|e| FabricError::internal(format!("creating leases dir: {e}")))?;
        let reservation_path = leases_dir.join(RESERVATION_FILE);
        let set = match tokio::fs::read_to_string(&reservation_path).await {
            Ok(content) => {
                let set = pool_manager::file::parse(&content);
                info!(
                    restored = set.len(),
                    path = %reservation_path.display(),
                    "restored reservations from disk"
                );
                set
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ReservationSet::new(),
            Err(err) => {
                return Err(FabricError::internal(format!(
                    "reading reservation file: {err}"
                )));
            }
        };

        DHCP_POOL_SIZE.set(pool.size() as i64);
        let mgr = Self {
            daemon_db_path: leases_dir.join(DAEMON_LEASE_DB),
            daemon_pid_path: leases_dir.join(DAEMON_PID_FILE),
            reservation_path,
            pool,
            lease_time,
            state: Mutex::new(set),
        };
        mgr.update_gauges(&*mgr.state.lock().await);
        Ok(mgr)
    }

    /// The validated pool configuration.
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Allocate the lowest free address for a VPS. Calling again with the
    /// same (vps, mac) returns the existing reservation unchanged.
    pub async fn allocate(
        &self,
        vps_id: &str,
        organization_id: &str,
        mac: MacAddr,
    ) -> Result<AllocateIpResponse, FabricError> {
        if vps_id.is_empty() {
            return Err(FabricError::invalid_argument("vps_id must not be empty"));
        }
        let mut set = self.state.lock().await;

        if let Some(existing) = set.find(vps_id, mac) {
            debug!(vps_id, %mac, ip = %existing.ip, "allocation already exists");
            return Ok(self.reply(existing.ip));
        }
        if let Some(holder) = set.get_by_mac(mac) {
            return Err(FabricError::invalid_argument(format!(
                "mac {mac} is already reserved for vps {}",
                holder.vps_id
            )));
        }
        if let Some(holder) = set.find_by_vps(vps_id) {
            return Err(FabricError::invalid_argument(format!(
                "vps {vps_id} already holds {} with mac {}",
                holder.ip, holder.mac
            )));
        }

        let ip = set.first_free(&self.pool).ok_or_else(|| {
            FabricError::precondition_failed(format!(
                "address pool exhausted ({} addresses)",
                self.pool.size()
            ))
        })?;
        set.insert(Reservation {
            vps_id: vps_id.to_owned(),
            organization_id: organization_id.to_owned(),
            mac,
            ip,
            is_public: false,
            managed: true,
        });

        if let Err(err) = self.persist(&set).await {
            set.remove_ip(ip);
            return Err(err);
        }

        DHCP_ALLOCATIONS_TOTAL.inc();
        self.update_gauges(&set);
        info!(vps_id, organization_id, %mac, %ip, "allocated address");
        Ok(self.reply(ip))
    }

    /// Drop the reservation held by a VPS. Releasing a VPS with no
    /// reservation is a no-op, not an error.
    pub async fn release(&self, vps_id: &str) -> Result<bool, FabricError> {
        if vps_id.is_empty() {
            return Err(FabricError::invalid_argument("vps_id must not be empty"));
        }
        let mut set = self.state.lock().await;
        let removed = set.remove_vps(vps_id);
        if removed.is_empty() {
            debug!(vps_id, "release: no reservation held");
            return Ok(false);
        }

        if let Err(err) = self.persist(&set).await {
            for r in removed {
                set.insert(r);
            }
            return Err(err);
        }

        self.update_gauges(&set);
        info!(vps_id, "released address");
        Ok(true)
    }

    /// Local managed reservations, optionally filtered.
    pub async fn list(
        &self,
        organization_id: Option<&str>,
        vps_id: Option<&str>,
    ) -> Vec<AllocationEntry> {
        let set = self.state.lock().await;
        set.managed()
            .filter(|r| organization_id.is_none_or(|org| r.organization_id == org))
            .filter(|r| vps_id.is_none_or(|vps| r.vps_id == vps))
            .map(|r| AllocationEntry {
                vps_id: r.vps_id.clone(),
                organization_id: r.organization_id.clone(),
                mac_address: r.mac,
                ip_address: r.ip,
                is_public: r.is_public,
            })
            .collect()
    }

    /// Pool diagnostic for `get_config`.
    pub async fn pool_config(&self) -> PoolConfigResponse {
        let set = self.state.lock().await;
        PoolConfigResponse {
            pool_start: self.pool.start(),
            pool_end: self.pool.end(),
            subnet_mask: self.pool.subnet_mask(),
            gateway: self.pool.gateway(),
            domain: self.pool.domain().to_owned(),
            dns_servers: self.pool.dns_servers().to_vec(),
            pool_size: self.pool.size(),
            available: self.pool.size().saturating_sub(set.len() as u64),
        }
    }

    /// Reconcile against the control service's desired set.
    ///
    /// Desired entries are materialised as managed reservations; managed
    /// entries absent from the desired set are dropped. Live daemon leases
    /// the control plane does not know about are kept as untagged entries
    /// (so their addresses stay blocked) and reported back as discovered.
    pub async fn sync(
        &self,
        desired: Vec<DesiredAllocation>,
    ) -> Result<SyncOutcome, FabricError> {
        let mut set = self.state.lock().await;

        let mut next = ReservationSet::new();
        for d in desired {
            if !self.pool.contains(d.ip_address) {
                warn!(
                    vps_id = %d.vps_id,
                    ip = %d.ip_address,
                    "desired allocation outside pool range; skipping"
                );
                continue;
            }
            if next.contains_ip(d.ip_address) {
                warn!(ip = %d.ip_address, "duplicate desired allocation; keeping first");
                continue;
            }
            next.insert(Reservation {
                vps_id: d.vps_id,
                organization_id: d.organization_id,
                mac: d.mac_address,
                ip: d.ip_address,
                is_public: d.is_public,
                managed: true,
            });
        }

        let added = next
            .managed()
            .filter(|r| {
                set.get_ip(r.ip)
                    .is_none_or(|cur| !cur.managed || cur.mac != r.mac || cur.vps_id != r.vps_id)
            })
            .count() as u64;
        let removed = set
            .managed()
            .filter(|r| {
                next.get_ip(r.ip)
                    .is_none_or(|n| n.mac != r.mac || n.vps_id != r.vps_id)
            })
            .count() as u64;

        // carry forward untagged squatters that don't collide with desired state
        for r in set.untagged() {
            if !next.contains_ip(r.ip) && !next.contains_mac(r.mac) {
                next.insert(r.clone());
            }
        }

        // discovery: live daemon leases with a MAC nobody reserved
        let mut daemon_hostnames: HashMap<MacAddr, String> = HashMap::new();
        match read_daemon_leases(&self.daemon_db_path).await {
            Ok(daemon_leases) => {
                for lease in daemon_leases {
                    if !lease.hostname.is_empty() {
                        daemon_hostnames.insert(lease.mac, lease.hostname.clone());
                    }
                    if next.contains_mac(lease.mac) {
                        continue;
                    }
                    if next.contains_ip(lease.ip) {
                        warn!(
                            mac = %lease.mac,
                            ip = %lease.ip,
                            "daemon lease collides with a reservation; leaving to the daemon"
                        );
                        continue;
                    }
                    debug!(mac = %lease.mac, ip = %lease.ip, "discovered unmanaged daemon lease");
                    next.insert(Reservation {
                        vps_id: String::new(),
                        organization_id: String::new(),
                        mac: lease.mac,
                        ip: lease.ip,
                        is_public: false,
                        managed: false,
                    });
                }
            }
            Err(err) => warn!(%err, "could not read daemon lease database"),
        }

        let discovered: Vec<DiscoveredAllocation> = next
            .untagged()
            .map(|r| DiscoveredAllocation {
                vps_id: r.vps_id.clone(),
                organization_id: r.organization_id.clone(),
                mac_address: r.mac,
                ip_address: r.ip,
                hostname: daemon_hostnames.get(&r.mac).cloned(),
            })
            .collect();

        if added > 0 || removed > 0 {
            self.persist(&next).await?;
        }
        *set = next;
        self.update_gauges(&set);

        info!(added, removed, discovered = discovered.len(), "sync applied");
        Ok(SyncOutcome {
            added,
            removed,
            discovered,
        })
    }

    fn reply(&self, ip: Ipv4Addr) -> AllocateIpResponse {
        AllocateIpResponse {
            ip_address: ip,
            subnet_mask: self.pool.subnet_mask(),
            gateway: self.pool.gateway(),
            dns_servers: self.pool.dns_servers().to_vec(),
            lease_expires: Utc::now()
                + chrono::Duration::from_std(self.lease_time)
                    .unwrap_or_else(|_| chrono::Duration::seconds(86_400)),
        }
    }

    /// Rewrite the reservation file, then nudge the daemon. The signal is
    /// fire-and-forget: a dead daemon reads the file when it comes back.
    async fn persist(&self, set: &ReservationSet) -> Result<(), FabricError> {
        let content = render(set, self.lease_time);
        write_atomic(&self.reservation_path, &content)
            .await
            .map_err(|e| {
                FabricError::unavailable(format!("could not rewrite reservation file: {e}"))
            })?;

        let pid_path = self.daemon_pid_path.clone();
        tokio::spawn(async move {
            match signal_daemon(&pid_path).await {
                Ok(()) => DHCP_SERVER_STATUS.set(1),
                Err(err) => {
                    DHCP_SERVER_STATUS.set(0);
                    warn!(%err, "DHCP daemon not signalled; file applies on its next start");
                }
            }
        });
        Ok(())
    }

    fn update_gauges(&self, set: &ReservationSet) {
        DHCP_ALLOCATIONS_ACTIVE.set(set.managed_len() as i64);
        DHCP_POOL_AVAILABLE.set(self.pool.size().saturating_sub(set.len() as u64) as i64);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tracing_test::traced_test;

    use super::*;

    fn pool() -> AddressPool {
        AddressPool::new(
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 12),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![Ipv4Addr::new(10, 0, 0, 1)],
            "vm.internal",
            "eth1",
        )
        .unwrap()
    }

    async fn manager(dir: &TempDir) -> DhcpManager {
        DhcpManager::open(pool(), Duration::from_secs(86_400), dir.path())
            .await
            .unwrap()
    }

    fn mac(suffix: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, suffix])
    }

    fn desired(vps: &str, mac_suffix: u8, last_octet: u8) -> DesiredAllocation {
        DesiredAllocation {
            vps_id: vps.into(),
            organization_id: "org-1".into(),
            mac_address: mac(mac_suffix),
            ip_address: Ipv4Addr::new(10, 0, 0, last_octet),
            is_public: false,
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn allocates_lowest_free_in_order() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let a = mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        assert_eq!(a.ip_address, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(a.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(a.gateway, Ipv4Addr::new(10, 0, 0, 1));

        let list = mgr.list(None, None).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].vps_id, "vps-A");

        let b = mgr.allocate("vps-B", "org-1", mac(0x02)).await.unwrap();
        assert_eq!(b.ip_address, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[tokio::test]
    #[traced_test]
    async fn exhausted_pool_is_a_precondition_failure() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        mgr.allocate("vps-B", "org-1", mac(0x02)).await.unwrap();
        let c = mgr.allocate("vps-C", "org-1", mac(0x03)).await.unwrap();
        assert_eq!(c.ip_address, Ipv4Addr::new(10, 0, 0, 12));

        let err = mgr.allocate("vps-D", "org-1", mac(0x04)).await.unwrap_err();
        assert_eq!(err.kind, fabric_core::error::ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    #[traced_test]
    async fn repeated_allocate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let first = mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        let again = mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        assert_eq!(first.ip_address, again.ip_address);
        assert_eq!(mgr.list(None, None).await.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn release_frees_the_address_for_reuse() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        assert!(mgr.release("vps-A").await.unwrap());
        assert!(!mgr.release("vps-A").await.unwrap());

        let e = mgr.allocate("vps-E", "org-1", mac(0x05)).await.unwrap();
        assert_eq!(e.ip_address, Ipv4Addr::new(10, 0, 0, 10));
    }

    #[tokio::test]
    #[traced_test]
    async fn conflicting_mac_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        let err = mgr.allocate("vps-B", "org-1", mac(0x01)).await.unwrap_err();
        assert_eq!(err.kind, fabric_core::error::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    #[traced_test]
    async fn sync_reports_daemon_squatters_untouched() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        // the daemon knows a live client the control plane never pushed
        std::fs::write(
            dir.path().join(DAEMON_LEASE_DB),
            "1719855600 aa:bb:cc:dd:ee:ff 10.0.0.12 squatter *\n",
        )
        .unwrap();

        let outcome = mgr
            .sync(vec![desired("vps-A", 0x01, 10), desired("vps-B", 0x02, 11)])
            .await
            .unwrap();
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.discovered.len(), 1);
        assert_eq!(outcome.discovered[0].mac_address, mac(0xff));
        assert_eq!(
            outcome.discovered[0].ip_address,
            Ipv4Addr::new(10, 0, 0, 12)
        );
        assert_eq!(outcome.discovered[0].hostname.as_deref(), Some("squatter"));

        // pushing the same set again converges: nothing added or removed,
        // the squatter is still reported and still blocks its address
        let outcome = mgr
            .sync(vec![desired("vps-A", 0x01, 10), desired("vps-B", 0x02, 11)])
            .await
            .unwrap();
        assert_eq!((outcome.added, outcome.removed), (0, 0));
        assert_eq!(outcome.discovered.len(), 1);

        let err = mgr.allocate("vps-C", "org-1", mac(0x03)).await.unwrap_err();
        assert_eq!(err.kind, fabric_core::error::ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    #[traced_test]
    async fn sync_removes_unwanted_managed_entries() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        mgr.allocate("vps-B", "org-1", mac(0x02)).await.unwrap();

        let outcome = mgr.sync(vec![desired("vps-A", 0x01, 10)]).await.unwrap();
        assert_eq!((outcome.added, outcome.removed), (0, 1));
        let list = mgr.list(None, None).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].vps_id, "vps-A");
    }

    #[tokio::test]
    #[traced_test]
    async fn reservations_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = manager(&dir).await;
            mgr.allocate("vps-A", "org-1", mac(0x01)).await.unwrap();
        }

        let mgr = manager(&dir).await;
        let list = mgr.list(None, None).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ip_address, Ipv4Addr::new(10, 0, 0, 10));

        // the restored reservation still collides with new allocations
        let b = mgr.allocate("vps-B", "org-1", mac(0x02)).await.unwrap();
        assert_eq!(b.ip_address, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[tokio::test]
    #[traced_test]
    async fn desired_entries_outside_the_pool_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let mut bad = desired("vps-X", 0x0a, 10);
        bad.ip_address = Ipv4Addr::new(192, 168, 9, 9);
        let outcome = mgr.sync(vec![bad]).await.unwrap();
        assert_eq!(outcome.added, 0);
        assert!(mgr.list(None, None).await.is_empty());
    }
}
