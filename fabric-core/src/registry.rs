//! In-memory registry of live gateway streams.
//!
//! The control service keys this by configured node name, one entry per
//! connected gateway. The edge uses the same type with at most one entry:
//! the identity adopted from the control side's `register`. Either way, a
//! registration exists exactly as long as its stream does.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::FabricError;
use crate::metrics::GATEWAY_STREAMS_ACTIVE;
use crate::mux::RequestMux;
use crate::wire::GatewayMessage;

/// One live stream: identity, liveness, and the way to talk to the peer.
pub struct GatewayHandle {
    gateway_id: String,
    version: String,
    endpoint: String,
    connected_at: DateTime<Utc>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    latest_metrics: Mutex<Option<Value>>,
    mux: Arc<RequestMux>,
}

impl fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayHandle")
            .field("gateway_id", &self.gateway_id)
            .field("version", &self.version)
            .field("endpoint", &self.endpoint)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl GatewayHandle {
    /// Build the handle for a freshly established stream.
    pub fn new(
        gateway_id: impl Into<String>,
        version: impl Into<String>,
        endpoint: impl Into<String>,
        mux: Arc<RequestMux>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            gateway_id: gateway_id.into(),
            version: version.into(),
            endpoint: endpoint.into(),
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            latest_metrics: Mutex::new(None),
            mux,
        })
    }

    /// The registered identity.
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Peer version reported during registration.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Configured endpoint URL on the control side; empty on the edge.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// When this stream registered.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Timestamp carried by the most recent peer heartbeat.
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock()
    }

    /// The last `report_metrics` payload, if the gateway sent one.
    pub fn latest_metrics(&self) -> Option<Value> {
        self.latest_metrics.lock().clone()
    }

    /// The request multiplexer for this stream.
    pub fn mux(&self) -> &Arc<RequestMux> {
        &self.mux
    }

    /// Queue an uncorrelated frame (heartbeat, sync push) for the writer task.
    pub async fn send(&self, msg: GatewayMessage) -> Result<(), FabricError> {
        self.mux
            .outbound()
            .send(msg)
            .await
            .map_err(|_| FabricError::unavailable("stream writer is gone"))
    }
}

/// Process-wide map of live gateway registrations.
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    inner: Mutex<HashMap<String, Arc<GatewayHandle>>>,
}

impl GatewayRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a registration; a second live stream for the same identity is
    /// rejected as a duplicate.
    pub fn register(&self, handle: Arc<GatewayHandle>) -> Result<(), FabricError> {
        let mut inner = self.inner.lock();
        if inner.contains_key(handle.gateway_id()) {
            return Err(FabricError::already_exists(format!(
                "duplicate registration for gateway {}",
                handle.gateway_id()
            )));
        }
        inner.insert(handle.gateway_id().to_owned(), handle);
        GATEWAY_STREAMS_ACTIVE.set(inner.len() as i64);
        Ok(())
    }

    /// Remove a registration, but only the exact handle that was registered:
    /// a slow teardown of a dead stream must not evict its replacement.
    pub fn unregister(&self, handle: &Arc<GatewayHandle>) -> bool {
        let mut inner = self.inner.lock();
        let matched = inner
            .get(handle.gateway_id())
            .is_some_and(|cur| Arc::ptr_eq(cur, handle));
        if matched {
            inner.remove(handle.gateway_id());
            GATEWAY_STREAMS_ACTIVE.set(inner.len() as i64);
        }
        matched
    }

    /// The live registration for a gateway, if any.
    pub fn get(&self, gateway_id: &str) -> Option<Arc<GatewayHandle>> {
        self.inner.lock().get(gateway_id).cloned()
    }

    /// Record a peer heartbeat. Returns false for unknown gateways.
    pub fn update_heartbeat(&self, gateway_id: &str, timestamp: DateTime<Utc>) -> bool {
        match self.get(gateway_id) {
            Some(handle) => {
                *handle.last_heartbeat.lock() = timestamp;
                true
            }
            None => false,
        }
    }

    /// Store the latest `report_metrics` payload for a gateway.
    pub fn process_metrics(&self, gateway_id: &str, payload: Value) -> bool {
        match self.get(gateway_id) {
            Some(handle) => {
                *handle.latest_metrics.lock() = Some(payload);
                true
            }
            None => false,
        }
    }

    /// Identities of every registered gateway.
    pub fn connected(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no gateway is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
