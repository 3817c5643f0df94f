//! Public service surface.
//!
//! Thin wrappers higher layers call with an already-authorised principal:
//! allocate/release/list leases by gateway node, and open an SSH tunnel to a
//! VPS by id. Everything here resolves the gateway's live stream through
//! the registry and fails with `unavailable` when none is connected.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use fabric_core::API_SECRET_HEADER;
use fabric_core::error::FabricError;
use fabric_core::mac::MacAddr;
use fabric_core::registry::{GatewayHandle, GatewayRegistry};
use fabric_core::wire::{
    AllocateIpRequest, AllocateIpResponse, AllocationEntry, ListIpsRequest, ListIpsResponse,
    ReleaseIpRequest, ReleaseIpResponse, methods,
};
use fabric_core::ws::WsByteStream;

use crate::config::ws_url;
use crate::store::{LeaseRecord, LeaseStore, NewLease};

/// The operational API: registry-backed calls into live gateways.
#[derive(Clone)]
pub struct FabricService {
    registry: Arc<GatewayRegistry>,
    store: LeaseStore,
    secret: String,
}

impl std::fmt::Debug for FabricService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricService").finish_non_exhaustive()
    }
}

impl FabricService {
    /// A service over the given registry and store; `secret` authenticates
    /// the per-tunnel connections this service opens itself.
    pub fn new(registry: Arc<GatewayRegistry>, store: LeaseStore, secret: String) -> Self {
        Self {
            registry,
            store,
            secret,
        }
    }

    fn gateway(&self, gateway_node: &str) -> Result<Arc<GatewayHandle>, FabricError> {
        self.registry.get(gateway_node).ok_or_else(|| {
            FabricError::unavailable(format!("no active stream to gateway {gateway_node}"))
        })
    }

    /// Allocate an address on a gateway and persist the lease. The edge is
    /// idempotent for repeated (vps, mac) pairs, so retries are safe.
    pub async fn allocate_lease(
        &self,
        vps_id: &str,
        organization_id: &str,
        mac_address: &str,
        gateway_node: &str,
    ) -> Result<LeaseRecord, FabricError> {
        let mac: MacAddr = mac_address.parse()?;
        let handle = self.gateway(gateway_node)?;

        let req = AllocateIpRequest {
            vps_id: vps_id.to_owned(),
            organization_id: organization_id.to_owned(),
            mac_address: mac,
        };
        let resp: AllocateIpResponse = handle
            .mux()
            .call(methods::ALLOCATE_IP, &req, &CancellationToken::new())
            .await?;

        let lease = self
            .store
            .upsert_lease(&NewLease {
                vps_id: vps_id.to_owned(),
                organization_id: organization_id.to_owned(),
                mac_address: mac.to_string(),
                ip_address: resp.ip_address.to_string(),
                gateway_node: gateway_node.to_owned(),
                is_public: false,
                expires_at: Some(resp.lease_expires.timestamp()),
            })
            .await
            .map_err(FabricError::from)?;
        info!(vps_id, gateway_node, ip = %lease.ip_address, "lease allocated");
        Ok(lease)
    }

    /// Release a VPS's address on its gateway and drop the stored lease.
    pub async fn release_lease(
        &self,
        vps_id: &str,
        gateway_node: &str,
    ) -> Result<(), FabricError> {
        let handle = self.gateway(gateway_node)?;
        let req = ReleaseIpRequest {
            vps_id: vps_id.to_owned(),
        };
        let resp: ReleaseIpResponse = handle
            .mux()
            .call(methods::RELEASE_IP, &req, &CancellationToken::new())
            .await?;
        if !resp.released {
            debug!(vps_id, gateway_node, "gateway had no reservation to release");
        }
        self.store
            .delete_lease(vps_id, gateway_node)
            .await
            .map_err(FabricError::from)?;
        info!(vps_id, gateway_node, "lease released");
        Ok(())
    }

    /// List allocations. With a gateway node this asks the edge for its
    /// live reservations; without one it reads the store.
    pub async fn list_leases(
        &self,
        gateway_node: Option<&str>,
        organization_id: Option<&str>,
        vps_id: Option<&str>,
    ) -> Result<Vec<AllocationEntry>, FabricError> {
        if let Some(node) = gateway_node {
            let handle = self.gateway(node)?;
            let req = ListIpsRequest {
                organization_id: organization_id.map(str::to_owned),
                vps_id: vps_id.map(str::to_owned),
            };
            let resp: ListIpsResponse = handle
                .mux()
                .call(methods::LIST_IPS, &req, &CancellationToken::new())
                .await?;
            return Ok(resp.allocations);
        }

        let leases = self
            .store
            .list_leases(organization_id, vps_id)
            .await
            .map_err(FabricError::from)?;
        leases
            .into_iter()
            .map(|l| {
                Ok(AllocationEntry {
                    mac_address: l.mac_address.parse()?,
                    ip_address: l
                        .ip_address
                        .parse()
                        .map_err(|_| FabricError::internal("stored ip does not parse"))?,
                    vps_id: l.vps_id,
                    organization_id: l.organization_id,
                    is_public: l.is_public,
                })
            })
            .collect()
    }

    /// Open an SSH tunnel to a VPS and relay `client` over it until either
    /// side closes. `port == 0` means the standard SSH port.
    pub async fn open_ssh_tunnel<S>(
        &self,
        vps_id: &str,
        port: u16,
        client: S,
    ) -> Result<(), FabricError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let lease = self
            .store
            .find_lease_by_vps(vps_id, false)
            .await
            .map_err(FabricError::from)?
            .ok_or_else(|| FabricError::not_found(format!("no lease for vps {vps_id}")))?;
        let handle = self.gateway(&lease.gateway_node)?;

        let connection_id = Uuid::new_v4();
        let url = ws_url(
            handle.endpoint(),
            &format!(
                "/tunnel?connection_id={connection_id}&target={}&port={port}",
                lease.ip_address
            ),
        )?;
        let mut request = url.clone().into_client_request().map_err(|e| {
            FabricError::invalid_argument(format!("bad tunnel url {url:?}: {e}"))
        })?;
        request.headers_mut().insert(
            API_SECRET_HEADER,
            HeaderValue::from_str(&self.secret)
                .map_err(|_| FabricError::invalid_argument("api secret is not header-safe"))?,
        );

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| FabricError::unavailable(format!("dialing tunnel {url}: {e}")))?;
        info!(vps_id, %connection_id, gateway_node = %lease.gateway_node, "ssh tunnel open");

        let mut remote =
            WsByteStream::<_, tokio_tungstenite::tungstenite::Message>::new(socket);
        let mut client = client;
        match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
            Ok((up, down)) => debug!(vps_id, %connection_id, up, down, "ssh tunnel closed"),
            Err(err) => debug!(vps_id, %connection_id, %err, "ssh tunnel ended with error"),
        }
        Ok(())
    }
}
