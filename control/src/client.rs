//! Gateway stream client.
//!
//! One client per configured gateway. Each connection follows the same
//! shape: dial with the shared secret in the upgrade header, `register`,
//! await `registered`, then run three long-lived tasks -- the heartbeat
//! ticker, the allocation-sync ticker (which also fires immediately on
//! connect), and the receive loop. Any transport error tears all of them
//! down, fails every pending request, and the outer loop redials after a
//! flat delay. Ids and the pending table are per-connection, so a
//! reconnect starts clean.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_core::error::FabricError;
use fabric_core::mux::{RequestMux, WireResponse};
use fabric_core::registry::{GatewayHandle, GatewayRegistry};
use fabric_core::wire::{self, FindVpsByLeaseRequest, GatewayMessage, methods};
use fabric_core::{API_SECRET_HEADER, HEARTBEAT_PERIOD, RECONNECT_DELAY, REGISTER_GRACE, SYNC_PERIOD};

use crate::config::ws_url;
use crate::reconcile;
use crate::resolve::LeaseResolver;
use crate::store::LeaseStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SEND_QUEUE: usize = 64;

/// Everything one per-gateway client needs.
#[derive(Clone)]
pub struct StreamClient {
    /// Node name of the gateway this client drives.
    pub node: String,
    /// The gateway's configured base URL.
    pub url: String,
    /// Shared secret for the upgrade header.
    pub secret: String,
    /// Registry the live registration is published into.
    pub registry: Arc<GatewayRegistry>,
    /// The lease authority.
    pub store: LeaseStore,
    /// Answers gateway-originated resolution queries.
    pub resolver: LeaseResolver,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("node", &self.node)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Run the client as a background task.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Dial-serve-redial until cancelled.
    pub async fn run(self, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            match self.connect_and_serve(&token).await {
                Ok(()) => info!(node = %self.node, "gateway stream closed"),
                Err(err) => warn!(node = %self.node, %err, "gateway stream failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = token.cancelled() => return,
            }
        }
    }

    async fn connect_and_serve(&self, token: &CancellationToken) -> Result<(), FabricError> {
        let url = ws_url(&self.url, "/stream")?;
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| FabricError::invalid_argument(format!("bad stream url {url:?}: {e}")))?;
        request.headers_mut().insert(
            API_SECRET_HEADER,
            HeaderValue::from_str(&self.secret)
                .map_err(|_| FabricError::invalid_argument("api secret is not header-safe"))?,
        );

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| FabricError::unavailable(format!("dialing {url}: {e}")))?;
        debug!(node = %self.node, %url, "stream connected");
        let (sink, mut stream) = socket.split();

        let conn_token = token.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel::<GatewayMessage>(SEND_QUEUE);
        let writer = tokio::spawn(write_loop(sink, outbound_rx, conn_token.clone()));

        let result = self
            .register_and_serve(&mut stream, &outbound_tx, &conn_token)
            .await;

        conn_token.cancel();
        let _ = writer.await;
        result
    }

    async fn register_and_serve(
        &self,
        stream: &mut SplitStream<WsStream>,
        outbound_tx: &mpsc::Sender<GatewayMessage>,
        conn_token: &CancellationToken,
    ) -> Result<(), FabricError> {
        let hello = GatewayMessage::Register {
            gateway_id: self.node.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        outbound_tx
            .send(hello)
            .await
            .map_err(|_| FabricError::unavailable("stream writer is gone"))?;

        let gateway_version =
            match tokio::time::timeout(REGISTER_GRACE, next_message(stream)).await {
                Ok(Some(GatewayMessage::Registered {
                    gateway_id,
                    version,
                })) => {
                    if gateway_id != self.node {
                        return Err(FabricError::internal(format!(
                            "gateway acknowledged as {gateway_id:?}, expected {:?}",
                            self.node
                        )));
                    }
                    version
                }
                Ok(Some(other)) => {
                    return Err(FabricError::internal(format!(
                        "expected registered, got {other:?}"
                    )));
                }
                Ok(None) => return Err(FabricError::unavailable("stream closed during register")),
                Err(_) => {
                    return Err(FabricError::deadline_exceeded(
                        "no registered ack within grace period",
                    ));
                }
            };

        let mux = Arc::new(RequestMux::new(outbound_tx.clone()));
        let handle = GatewayHandle::new(
            self.node.clone(),
            gateway_version,
            self.url.clone(),
            mux.clone(),
        );

        // the connect-time sync is queued before the registration becomes
        // visible, so anything callers allocate through the fresh stream is
        // ordered after the full-state push on the wire
        reconcile::push_allocations(&self.store, &handle, &self.node).await?;
        self.registry.register(handle.clone())?;
        info!(node = %self.node, version = %handle.version(), "gateway registered");

        let heartbeat = tokio::spawn(heartbeat_loop(outbound_tx.clone(), conn_token.clone()));
        let sync = tokio::spawn(sync_loop(
            self.store.clone(),
            handle.clone(),
            self.node.clone(),
            conn_token.clone(),
        ));

        let result = self.recv_loop(stream, &handle, outbound_tx, conn_token).await;

        self.registry.unregister(&handle);
        mux.fail_all();
        heartbeat.abort();
        sync.abort();
        result
    }

    async fn recv_loop(
        &self,
        stream: &mut SplitStream<WsStream>,
        handle: &Arc<GatewayHandle>,
        outbound_tx: &mpsc::Sender<GatewayMessage>,
        conn_token: &CancellationToken,
    ) -> Result<(), FabricError> {
        loop {
            let msg = tokio::select! {
                msg = next_message(stream) => msg,
                _ = conn_token.cancelled() => return Ok(()),
            };
            let Some(msg) = msg else {
                return Err(FabricError::unavailable("stream reset by gateway"));
            };

            match msg {
                GatewayMessage::Heartbeat { timestamp } => {
                    self.registry.update_heartbeat(&self.node, timestamp);
                }
                GatewayMessage::Response {
                    request_id,
                    success,
                    error,
                    payload,
                } => handle.mux().dispatch_response(
                    &request_id,
                    WireResponse {
                        success,
                        error,
                        payload,
                    },
                ),
                GatewayMessage::Request {
                    request_id,
                    method,
                    payload,
                } => {
                    let client = self.clone();
                    let outbound_tx = outbound_tx.clone();
                    tokio::spawn(async move {
                        let response = match client.handle_request(&method, payload).await {
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
                    });
                }
                GatewayMessage::SyncResult {
                    added,
                    removed,
                    discovered_allocations,
                } => {
                    let client = self.clone();
                    tokio::spawn(async move {
                        reconcile::absorb_sync_result(
                            &client.store,
                            &client.resolver,
                            &client.node,
                            added,
                            removed,
                            discovered_allocations,
                        )
                        .await;
                    });
                }
                GatewayMessage::Register { .. } | GatewayMessage::Registered { .. } => {
                    warn!(node = %self.node, "unexpected registration frame mid-stream");
                }
                GatewayMessage::SyncAllocations { .. } => {
                    warn!(node = %self.node, "unexpected sync_allocations on the control side");
                }
                GatewayMessage::Unknown => debug!("ignoring unknown message variant"),
            }
        }
    }

    /// Requests originated by the gateway.
    async fn handle_request(&self, method: &str, payload: Value) -> Result<Value, FabricError> {
        match method {
            methods::FIND_VPS_BY_LEASE => {
                let req: FindVpsByLeaseRequest = wire::decode(payload)?;
                let resp = self.resolver.find_vps_by_lease(&req).await;
                wire::encode(&resp)
            }
            methods::REPORT_METRICS => {
                if !self.registry.process_metrics(&self.node, payload) {
                    debug!(node = %self.node, "metrics report for unregistered gateway");
                }
                Ok(Value::Null)
            }
            other => Err(FabricError::invalid_argument(format!(
                "unknown method {other:?}"
            ))),
        }
    }
}

async fn next_message(stream: &mut SplitStream<WsStream>) -> Option<GatewayMessage> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                Ok(msg) => return Some(msg),
                Err(err) => {
                    warn!(%err, "undecodable frame; ignoring");
                    continue;
                }
            },
            Ok(Message::Binary(data)) => match serde_json::from_slice(&data) {
                Ok(msg) => return Some(msg),
                Err(err) => {
                    warn!(%err, "undecodable frame; ignoring");
                    continue;
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(err) => {
                debug!(%err, "stream read failed");
                return None;
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
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

async fn heartbeat_loop(outbound_tx: mpsc::Sender<GatewayMessage>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
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
    }
}

/// The periodic allocation sync; the first tick fires immediately on connect.
async fn sync_loop(
    store: LeaseStore,
    handle: Arc<GatewayHandle>,
    node: String,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SYNC_PERIOD);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match reconcile::push_allocations(&store, &handle, &node).await {
            Ok(count) => debug!(node = %node, count, "allocation sync pushed"),
            Err(err) => {
                warn!(node = %node, %err, "allocation sync failed");
                return;
            }
        }
    }
}
