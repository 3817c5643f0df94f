//! Hypervisor inventory oracle.
//!
//! The real client lives in the surrounding system; lease resolution only
//! needs "which VM owns this MAC", so that is the whole contract here. The
//! oracle is best effort: an error means "unavailable, keep resolving
//! elsewhere", never a hard failure.

use async_trait::async_trait;

/// A VM as reported by the hypervisor inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryVm {
    /// Owning VPS.
    pub vps_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Gateway node the VM runs behind.
    pub node: String,
}

/// The opaque VM inventory oracle the surrounding system provides.
#[async_trait]
pub trait VmInventory: Send + Sync {
    /// Look a VM up by the canonical lowercase MAC of one of its NICs.
    async fn find_vm_by_mac(&self, mac: &str) -> anyhow::Result<Option<InventoryVm>>;
}

/// Stand-in when no hypervisor client is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInventory;

#[async_trait]
impl VmInventory for NoInventory {
    async fn find_vm_by_mac(&self, _mac: &str) -> anyhow::Result<Option<InventoryVm>> {
        Ok(None)
    }
}
