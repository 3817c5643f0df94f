//! # pool-manager
//!
//! Address-pool accounting for a gateway. An [`AddressPool`] is the validated
//! per-gateway configuration; a [`ReservationSet`] is the in-memory picture of
//! every address that must not be handed out, both the control-plane-managed
//! reservations and the untagged squatters discovered in the local DHCP
//! daemon's lease database.
//!
//! The set itself is not thread safe; the DHCP manager owns it behind a single
//! mutex that also serialises reservation-file rewrites.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::{Ipv4AddrRange, Ipv4Net};
use thiserror::Error;

use fabric_core::mac::MacAddr;

pub mod file;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool start {start} is above pool end {end}")]
    InvertedRange { start: Ipv4Addr, end: Ipv4Addr },
    #[error("subnet mask {0} is not a contiguous netmask")]
    BadMask(Ipv4Addr),
    #[error("gateway {gateway} must lie outside the pool range {start}..={end}")]
    GatewayInPool {
        gateway: Ipv4Addr,
        start: Ipv4Addr,
        end: Ipv4Addr,
    },
    #[error("pool range {start}..={end} is not inside the gateway subnet {subnet}")]
    RangeOutsideSubnet {
        start: Ipv4Addr,
        end: Ipv4Addr,
        subnet: Ipv4Net,
    },
}

/// Validated address-pool configuration for one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    gateway: Ipv4Addr,
    dns_servers: Vec<Ipv4Addr>,
    domain: String,
    interface: String,
    network: Ipv4Net,
}

impl AddressPool {
    pub fn new(
        start: Ipv4Addr,
        end: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns_servers: Vec<Ipv4Addr>,
        domain: impl Into<String>,
        interface: impl Into<String>,
    ) -> Result<Self, PoolError> {
        if u32::from(start) > u32::from(end) {
            return Err(PoolError::InvertedRange { start, end });
        }
        let prefix =
            ipnet::ipv4_mask_to_prefix(subnet_mask).map_err(|_| PoolError::BadMask(subnet_mask))?;
        let network = Ipv4Net::new(gateway, prefix)
            .map_err(|_| PoolError::BadMask(subnet_mask))?
            .trunc();
        if !network.contains(&start) || !network.contains(&end) {
            return Err(PoolError::RangeOutsideSubnet {
                start,
                end,
                subnet: network,
            });
        }
        if u32::from(start) <= u32::from(gateway) && u32::from(gateway) <= u32::from(end) {
            return Err(PoolError::GatewayInPool {
                gateway,
                start,
                end,
            });
        }
        Ok(Self {
            start,
            end,
            subnet_mask,
            gateway,
            dns_servers,
            domain: domain.into(),
            interface: interface.into(),
            network,
        })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.subnet_mask
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.dns_servers
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The pool's subnet, derived from the gateway address and mask.
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(self.start) <= u32::from(ip) && u32::from(ip) <= u32::from(self.end)
    }

    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end) - u32::from(self.start)) + 1
    }

    /// Addresses in ascending order, start and end inclusive.
    pub fn iter(&self) -> Ipv4AddrRange {
        Ipv4AddrRange::new(self.start, self.end)
    }
}

/// One reserved address. `managed` marks entries owned by the control plane;
/// untagged entries mirror live daemon leases the control plane does not know
/// about and only exist so their address is never re-allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub vps_id: String,
    pub organization_id: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub is_public: bool,
    pub managed: bool,
}

impl Reservation {
    /// DNS-safe hostname derived from the VPS id.
    pub fn hostname(&self) -> String {
        sanitize_hostname(&self.vps_id)
    }
}

/// Lowercases and replaces anything not `[a-z0-9-]` so the value is safe for
/// the reservation file and the daemon's DNS view.
pub fn sanitize_hostname(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if out.is_empty() {
        out.push_str("host");
    }
    out
}

/// Reservations keyed and ordered by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationSet {
    by_ip: BTreeMap<Ipv4Addr, Reservation>,
}

impl ReservationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any previous holder of the address.
    pub fn insert(&mut self, reservation: Reservation) -> Option<Reservation> {
        self.by_ip.insert(reservation.ip, reservation)
    }

    pub fn remove_ip(&mut self, ip: Ipv4Addr) -> Option<Reservation> {
        self.by_ip.remove(&ip)
    }

    /// Remove every reservation held by a VPS, returning what was removed.
    pub fn remove_vps(&mut self, vps_id: &str) -> Vec<Reservation> {
        let ips: Vec<Ipv4Addr> = self
            .by_ip
            .values()
            .filter(|r| r.vps_id == vps_id)
            .map(|r| r.ip)
            .collect();
        ips.iter().filter_map(|ip| self.by_ip.remove(ip)).collect()
    }

    pub fn get_ip(&self, ip: Ipv4Addr) -> Option<&Reservation> {
        self.by_ip.get(&ip)
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<&Reservation> {
        self.by_ip.values().find(|r| r.mac == mac)
    }

    /// The existing reservation for this exact (vps, mac) pair, if any.
    pub fn find(&self, vps_id: &str, mac: MacAddr) -> Option<&Reservation> {
        self.by_ip
            .values()
            .find(|r| r.vps_id == vps_id && r.mac == mac)
    }

    pub fn find_by_vps(&self, vps_id: &str) -> Option<&Reservation> {
        self.by_ip.values().find(|r| r.vps_id == vps_id)
    }

    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.by_ip.contains_key(&ip)
    }

    pub fn contains_mac(&self, mac: MacAddr) -> bool {
        self.get_by_mac(mac).is_some()
    }

    /// Lowest-numbered pool address not reserved by anyone, managed or not.
    pub fn first_free(&self, pool: &AddressPool) -> Option<Ipv4Addr> {
        pool.iter().find(|ip| !self.by_ip.contains_key(ip))
    }

    /// All reservations in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.by_ip.values()
    }

    pub fn managed(&self) -> impl Iterator<Item = &Reservation> {
        self.by_ip.values().filter(|r| r.managed)
    }

    pub fn untagged(&self) -> impl Iterator<Item = &Reservation> {
        self.by_ip.values().filter(|r| !r.managed)
    }

    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    pub fn managed_len(&self) -> usize {
        self.managed().count()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }
}

#[cfg(test)]
mod tests {
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

    fn reservation(vps: &str, mac: &str, ip: [u8; 4], managed: bool) -> Reservation {
        Reservation {
            vps_id: vps.into(),
            organization_id: "org-1".into(),
            mac: mac.parse().unwrap(),
            ip: ip.into(),
            is_public: false,
            managed,
        }
    }

    #[test]
    fn pool_validation() {
        assert_eq!(pool().size(), 3);

        let err = AddressPool::new(
            Ipv4Addr::new(10, 0, 0, 20),
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![],
            "",
            "eth1",
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::InvertedRange { .. }));

        let err = AddressPool::new(
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 12),
            Ipv4Addr::new(255, 0, 255, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![],
            "",
            "eth1",
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::BadMask(_)));

        let err = AddressPool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 12),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 5),
            vec![],
            "",
            "eth1",
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::GatewayInPool { .. }));

        let err = AddressPool::new(
            Ipv4Addr::new(10, 0, 1, 10),
            Ipv4Addr::new(10, 0, 1, 12),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![],
            "",
            "eth1",
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::RangeOutsideSubnet { .. }));
    }

    #[test]
    fn network_derivation_is_idempotent() {
        let p = pool();
        let net = p.network();
        // applying the mask to the already-truncated network changes nothing
        let again = Ipv4Net::new(net.network(), net.prefix_len()).unwrap().trunc();
        assert_eq!(net, again);
        assert_eq!(net.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn first_free_scans_in_ascending_order() {
        let p = pool();
        let mut set = ReservationSet::new();
        assert_eq!(set.first_free(&p), Some(Ipv4Addr::new(10, 0, 0, 10)));

        set.insert(reservation("vps-a", "aa:bb:cc:dd:ee:01", [10, 0, 0, 10], true));
        assert_eq!(set.first_free(&p), Some(Ipv4Addr::new(10, 0, 0, 11)));

        // an untagged squatter blocks its address just like a managed entry
        set.insert(reservation("", "aa:bb:cc:dd:ee:ff", [10, 0, 0, 11], false));
        assert_eq!(set.first_free(&p), Some(Ipv4Addr::new(10, 0, 0, 12)));

        set.insert(reservation("vps-b", "aa:bb:cc:dd:ee:02", [10, 0, 0, 12], true));
        assert_eq!(set.first_free(&p), None);

        set.remove_vps("vps-a");
        assert_eq!(set.first_free(&p), Some(Ipv4Addr::new(10, 0, 0, 10)));
    }

    #[test]
    fn lookups() {
        let mut set = ReservationSet::new();
        set.insert(reservation("vps-a", "aa:bb:cc:dd:ee:01", [10, 0, 0, 10], true));
        set.insert(reservation("vps-b", "aa:bb:cc:dd:ee:02", [10, 0, 0, 11], true));

        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(set.get_by_mac(mac).unwrap().vps_id, "vps-a");
        assert!(set.find("vps-a", mac).is_some());
        assert!(set.find("vps-b", mac).is_none());
        assert_eq!(set.managed_len(), 2);
        assert_eq!(set.untagged().count(), 0);
    }

    #[test]
    fn hostname_is_sanitised() {
        let r = reservation("VPS_01.prod", "aa:bb:cc:dd:ee:01", [10, 0, 0, 10], true);
        assert_eq!(r.hostname(), "vps-01-prod");
        assert_eq!(sanitize_hostname(""), "host");
    }
}
