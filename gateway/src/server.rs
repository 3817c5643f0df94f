//! Gateway stream server.
//!
//! Serves two WebSocket endpoints on the stream port: `/stream`, the
//! persistent control-plane connection, and `/tunnel`, one per SSH relay.
//! Both require the shared secret in the `x-api-secret` upgrade header.
//!
//! Stream rules: the first inbound frame must be `register` within a short
//! grace period; every write goes through one writer task consuming a send
//! queue; the read loop never waits for a handler to finish, so a slow
//! allocation cannot stall heartbeats. DHCP-bound work (requests and
//! desired-state pushes) drains through one ordered worker per stream: the
//! reservation set must see a `sync_allocations` and the allocations that
//! follow it in receive order.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_core::error::FabricError;
use fabric_core::mux::{RequestMux, WireResponse};
use fabric_core::registry::{GatewayHandle, GatewayRegistry};
use fabric_core::wire::{
    self, AllocateIpRequest, FindVpsByLeaseRequest, FindVpsByLeaseResponse, GatewayMessage,
    ListIpsRequest, ListIpsResponse, MetricsReport, ReleaseIpRequest, ReleaseIpResponse, methods,
};
use fabric_core::{API_SECRET_HEADER, HEARTBEAT_PERIOD, REGISTER_GRACE};

use crate::dhcp::DhcpManager;
use crate::proxy::SshProxy;

const SEND_QUEUE: usize = 64;
const WORK_QUEUE: usize = 256;
/// Metrics are reported every Nth heartbeat tick.
const METRICS_EVERY: u32 = 2;

/// DHCP-bound work, executed strictly in receive order.
#[derive(Debug)]
enum DhcpJob {
    Request {
        request_id: String,
        method: String,
        payload: Value,
    },
    Sync {
        allocations: Vec<fabric_core::wire::DesiredAllocation>,
    },
}

/// Everything the handlers need.
pub struct GatewayState {
    /// Shared secret the control service must present.
    pub secret: String,
    /// This gateway's build version, echoed in `registered`.
    pub version: String,
    /// The node's DHCP manager.
    pub dhcp: Arc<DhcpManager>,
    /// The node's SSH relay.
    pub proxy: Arc<SshProxy>,
    /// Registrations of live control streams.
    pub registry: Arc<GatewayRegistry>,
    /// Process-wide shutdown; child tokens cover each connection.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// The stream-port router: `/stream` and `/tunnel`.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .route("/tunnel", get(tunnel_handler))
        .with_state(state)
}

/// Serve the stream endpoints until the token fires.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

fn authorized(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(API_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == secret)
}

async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers, &state.secret) {
        warn!("stream upgrade without valid api secret");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_stream(socket, state))
        .into_response()
}

#[derive(Debug, Deserialize)]
struct TunnelParams {
    connection_id: String,
    target: String,
    #[serde(default)]
    port: u16,
}

async fn tunnel_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<TunnelParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers, &state.secret) {
        warn!("tunnel upgrade without valid api secret");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let client = fabric_core::ws::WsByteStream::<_, Message>::new(socket);
        let cancel = state.shutdown.child_token();
        if let Err(err) = state
            .proxy
            .proxy_connection(
                &params.connection_id,
                &params.target,
                params.port,
                client,
                cancel,
            )
            .await
        {
            warn!(connection_id = %params.connection_id, %err, "ssh tunnel failed");
        }
    })
}

/// Read one control frame off a not-yet-split socket, skipping transport
/// control frames.
async fn recv_message(socket: &mut WebSocket) -> Option<GatewayMessage> {
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                Ok(msg) => return Some(msg),
                Err(err) => {
                    warn!(%err, "undecodable frame");
                    return None;
                }
            },
            Ok(Message::Binary(data)) => match serde_json::from_slice(&data) {
                Ok(msg) => return Some(msg),
                Err(err) => {
                    warn!(%err, "undecodable frame");
                    return None;
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

async fn handle_stream(mut socket: WebSocket, state: Arc<GatewayState>) {
    let (gateway_id, peer_version) =
        match tokio::time::timeout(REGISTER_GRACE, recv_message(&mut socket)).await {
            Ok(Some(GatewayMessage::Register {
                gateway_id,
                version,
            })) => (gateway_id, version),
            Ok(Some(other)) => {
                warn!(?other, "first frame was not register; dropping stream");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!("no register within grace period; dropping stream");
                return;
            }
        };
    info!(%gateway_id, %peer_version, "control stream registering");

    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<GatewayMessage>(SEND_QUEUE);
    let conn_token = state.shutdown.child_token();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, conn_token.clone()));

    let mux = Arc::new(RequestMux::new(outbound_tx.clone()));
    let handle = GatewayHandle::new(
        gateway_id.clone(),
        peer_version,
        String::new(),
        mux.clone(),
    );
    if let Err(err) = state.registry.register(handle.clone()) {
        warn!(%gateway_id, %err, "rejecting stream");
        conn_token.cancel();
        let _ = writer.await;
        return;
    }

    let registered = GatewayMessage::Registered {
        gateway_id: gateway_id.clone(),
        version: state.version.clone(),
    };
    if outbound_tx.send(registered).await.is_err() {
        state.registry.unregister(&handle);
        return;
    }

    let heartbeat = tokio::spawn(heartbeat_loop(
        outbound_tx.clone(),
        mux.clone(),
        state.clone(),
        conn_token.clone(),
    ));
    let (dhcp_tx, dhcp_rx) = mpsc::channel::<DhcpJob>(WORK_QUEUE);
    let worker = tokio::spawn(dhcp_worker(
        state.clone(),
        mux.clone(),
        outbound_tx.clone(),
        conn_token.clone(),
        dhcp_rx,
    ));

    recv_loop(stream, &state, &gateway_id, &mux, &dhcp_tx, &conn_token).await;

    conn_token.cancel();
    state.registry.unregister(&handle);
    mux.fail_all();
    heartbeat.abort();
    worker.abort();
    let _ = writer.await;
    info!(%gateway_id, "control stream closed");
}

/// Drains DHCP-bound work in arrival order. Every request here ends in the
/// reservation-set mutex anyway, so one worker loses no concurrency and
/// keeps `sync_allocations` ordered against the requests behind it.
async fn dhcp_worker(
    state: Arc<GatewayState>,
    mux: Arc<RequestMux>,
    outbound_tx: mpsc::Sender<GatewayMessage>,
    token: CancellationToken,
    mut jobs: mpsc::Receiver<DhcpJob>,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => job,
            _ = token.cancelled() => None,
        };
        let Some(job) = job else { return };
        match job {
            DhcpJob::Request {
                request_id,
                method,
                payload,
            } => {
                let response = match handle_request(&state, &method, payload).await {
                    Ok(payload) => GatewayMessage::Response {
                        request_id,
                        success: true,
                        error: String::new(),
                        payload,
                    },
                    Err(err) => GatewayMessage::Response {
                        request_id,
                        success: false,
                        error: err.to_wire(),
                        payload: Value::Null,
                    },
                };
                if outbound_tx.send(response).await.is_err() {
                    debug!("send queue closed before response was written");
                }
            }
            DhcpJob::Sync { allocations } => {
                handle_sync(&state, &mux, &outbound_tx, &token, allocations).await;
            }
        }
    }
}

/// The single writer: everything sent on this stream funnels through here.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<GatewayMessage>,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            msg = outbound_rx.recv() => msg,
            _ = token.cancelled() => None,
        };
        let Some(msg) = msg else { break };
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, "unencodable frame; skipping");
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            debug!(%err, "stream write failed");
            token.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}

async fn heartbeat_loop(
    outbound_tx: mpsc::Sender<GatewayMessage>,
    mux: Arc<RequestMux>,
    state: Arc<GatewayState>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
    let mut ticks = 0u32;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let beat = GatewayMessage::Heartbeat {
            timestamp: Utc::now(),
        };
        if outbound_tx.send(beat).await.is_err() {
            return;
        }
        ticks += 1;
        if ticks % METRICS_EVERY == 0 {
            let report = MetricsReport {
                dhcp_allocations_active: fabric_core::metrics::DHCP_ALLOCATIONS_ACTIVE.get(),
                dhcp_pool_size: fabric_core::metrics::DHCP_POOL_SIZE.get(),
                dhcp_pool_available: fabric_core::metrics::DHCP_POOL_AVAILABLE.get(),
                ssh_proxy_connections_active: state.proxy.active() as i64,
                dhcp_server_status: fabric_core::metrics::DHCP_SERVER_STATUS.get(),
            };
            match mux
                .call::<MetricsReport, Value>(methods::REPORT_METRICS, &report, &token)
                .await
            {
                Ok(_) => debug!("metrics reported"),
                Err(err) => debug!(%err, "metrics report not delivered"),
            }
        }
    }
}

async fn recv_loop(
    mut stream: SplitStream<WebSocket>,
    state: &Arc<GatewayState>,
    gateway_id: &str,
    mux: &Arc<RequestMux>,
    dhcp_tx: &mpsc::Sender<DhcpJob>,
    conn_token: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = conn_token.cancelled() => return,
        };
        let msg = match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(%err, "undecodable frame; ignoring");
                    continue;
                }
            },
            Some(Ok(Message::Binary(data))) => match serde_json::from_slice(&data) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(%err, "undecodable frame; ignoring");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(err)) => {
                debug!(%err, "stream read failed");
                return;
            }
        };

        match msg {
            GatewayMessage::Heartbeat { timestamp } => {
                state.registry.update_heartbeat(gateway_id, timestamp);
            }
            GatewayMessage::Request {
                request_id,
                method,
                payload,
            } => {
                let job = DhcpJob::Request {
                    request_id,
                    method,
                    payload,
                };
                if dhcp_tx.send(job).await.is_err() {
                    debug!("work queue closed; dropping request");
                }
            }
            GatewayMessage::Response {
                request_id,
                success,
                error,
                payload,
            } => mux.dispatch_response(
                &request_id,
                WireResponse {
                    success,
                    error,
                    payload,
                },
            ),
            GatewayMessage::SyncAllocations { allocations } => {
                if dhcp_tx.send(DhcpJob::Sync { allocations }).await.is_err() {
                    debug!("work queue closed; dropping sync");
                }
            }
            GatewayMessage::Register { .. } | GatewayMessage::Registered { .. } => {
                warn!("unexpected registration frame mid-stream; ignoring");
            }
            GatewayMessage::SyncResult { .. } => {
                warn!("unexpected sync_result on the edge; ignoring");
            }
            GatewayMessage::Unknown => debug!("ignoring unknown message variant"),
        }
    }
}

async fn handle_request(
    state: &Arc<GatewayState>,
    method: &str,
    payload: Value,
) -> Result<Value, FabricError> {
    match method {
        methods::ALLOCATE_IP => {
            let req: AllocateIpRequest = wire::decode(payload)?;
            let resp = state
                .dhcp
                .allocate(&req.vps_id, &req.organization_id, req.mac_address)
                .await?;
            wire::encode(&resp)
        }
        methods::RELEASE_IP => {
            let req: ReleaseIpRequest = wire::decode(payload)?;
            let released = state.dhcp.release(&req.vps_id).await?;
            wire::encode(&ReleaseIpResponse { released })
        }
        methods::LIST_IPS => {
            let req: ListIpsRequest = wire::decode(payload)?;
            let allocations = state
                .dhcp
                .list(req.organization_id.as_deref(), req.vps_id.as_deref())
                .await;
            wire::encode(&ListIpsResponse { allocations })
        }
        methods::GET_CONFIG => {
            let resp = state.dhcp.pool_config().await;
            wire::encode(&resp)
        }
        other => Err(FabricError::invalid_argument(format!(
            "unknown method {other:?}"
        ))),
    }
}

/// Apply a desired-state push, enrich discoveries with owner lookups against
/// the control service (best effort), and report back.
async fn handle_sync(
    state: &Arc<GatewayState>,
    mux: &Arc<RequestMux>,
    outbound_tx: &mpsc::Sender<GatewayMessage>,
    token: &CancellationToken,
    allocations: Vec<fabric_core::wire::DesiredAllocation>,
) {
    let outcome = match state.dhcp.sync(allocations).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(%err, "sync failed; not reporting a result");
            return;
        }
    };

    let mut discovered = outcome.discovered;
    for d in &mut discovered {
        if !d.vps_id.is_empty() {
            continue;
        }
        let req = FindVpsByLeaseRequest {
            mac_address: Some(d.mac_address.to_string()),
            ip_address: Some(d.ip_address.to_string()),
        };
        match mux
            .call::<FindVpsByLeaseRequest, FindVpsByLeaseResponse>(
                methods::FIND_VPS_BY_LEASE,
                &req,
                token,
            )
            .await
        {
            Ok(owner) if !owner.vps_id.is_empty() => {
                d.vps_id = owner.vps_id;
                d.organization_id = owner.organization_id;
            }
            Ok(_) => debug!(mac = %d.mac_address, "discovered lease has no known owner"),
            Err(err) => debug!(%err, "owner lookup for discovered lease failed"),
        }
    }

    let result = GatewayMessage::SyncResult {
        added: outcome.added,
        removed: outcome.removed,
        discovered_allocations: discovered,
    };
    if outbound_tx.send(result).await.is_err() {
        debug!("send queue closed before sync result was written");
    }
}
