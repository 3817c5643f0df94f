//! Request/response correlation over a single bidirectional stream.
//!
//! One [`RequestMux`] exists per live stream, on each side. Sends are
//! funnelled through the stream's single writer task via the `outbound`
//! queue; the stream's single reader routes every `response` frame back here
//! by request id. Ids are monotonic per stream and reset on reconnect.
//!
//! Lifecycle of one request:
//! 1. allocate an id and park a one-shot reply channel in the pending table
//! 2. queue the `request` frame for the writer task
//! 3. wait for the reply, the timeout, or the caller's cancellation
//! 4. remove the pending entry no matter how the wait ended
//!
//! A `response` with no waiter (late arrival after a timeout) is logged and
//! dropped. Dropping the whole table on disconnect wakes every waiter with
//! `unavailable`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FabricError;
use crate::wire::GatewayMessage;

/// Default wait for a peer response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A raw response as routed by the reader loop.
#[derive(Debug, Clone)]
pub struct WireResponse {
    /// Mirror of `response.success`.
    pub success: bool,
    /// Error string, non-empty iff `success` is false.
    pub error: String,
    /// Opaque response payload.
    pub payload: Value,
}

/// Correlates requests with their responses over one stream's send queue.
pub struct RequestMux {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<WireResponse>>>,
    outbound: mpsc::Sender<GatewayMessage>,
    timeout: Duration,
}

impl fmt::Debug for RequestMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMux")
            .field("pending", &self.pending.lock().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RequestMux {
    /// A multiplexer with the default request timeout.
    pub fn new(outbound: mpsc::Sender<GatewayMessage>) -> Self {
        Self::with_timeout(outbound, DEFAULT_REQUEST_TIMEOUT)
    }

    /// A multiplexer with a custom request timeout.
    pub fn with_timeout(outbound: mpsc::Sender<GatewayMessage>, timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            timeout,
        }
    }

    /// The send queue feeding the stream's writer task. Used for
    /// uncorrelated frames (heartbeats, sync pushes).
    pub fn outbound(&self) -> &mpsc::Sender<GatewayMessage> {
        &self.outbound
    }

    /// Typed request/response helper over [`request`].
    ///
    /// [`request`]: RequestMux::request
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        req: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp, FabricError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(req)
            .map_err(|e| FabricError::internal(format!("encoding {method} request: {e}")))?;
        let value = self.request(method, payload, cancel).await?;
        serde_json::from_value(value)
            .map_err(|e| FabricError::internal(format!("malformed {method} response: {e}")))
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, FabricError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        let result = self.send_and_wait(&request_id, method, payload, rx, cancel).await;
        // deferred cleanup: runs on success, timeout, cancel, and error alike
        self.pending.lock().remove(&request_id);
        result
    }

    async fn send_and_wait(
        &self,
        request_id: &str,
        method: &str,
        payload: Value,
        rx: oneshot::Receiver<WireResponse>,
        cancel: &CancellationToken,
    ) -> Result<Value, FabricError> {
        let frame = GatewayMessage::Request {
            request_id: request_id.to_owned(),
            method: method.to_owned(),
            payload,
        };
        if self.outbound.send(frame).await.is_err() {
            return Err(FabricError::unavailable("stream writer is gone"));
        }
        tokio::select! {
            resp = rx => match resp {
                Ok(resp) if resp.success => Ok(resp.payload),
                Ok(resp) => Err(FabricError::from_wire(&resp.error)),
                Err(_) => Err(FabricError::unavailable("stream disconnected")),
            },
            _ = tokio::time::sleep(self.timeout) => Err(FabricError::deadline_exceeded(
                format!("no response to {method} within {:?}", self.timeout),
            )),
            _ = cancel.cancelled() => Err(FabricError::cancelled(format!("{method} cancelled"))),
        }
    }

    /// Route a response frame from the reader loop to its waiter.
    pub fn dispatch_response(&self, request_id: &str, response: WireResponse) {
        match self.pending.lock().remove(request_id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(%request_id, "dropping response with no waiter (late arrival)"),
        }
    }

    /// Fail every in-flight request. Called when the stream tears down; each
    /// waiter observes `unavailable`.
    pub fn fail_all(&self) {
        let drained = {
            let mut pending = self.pending.lock();
            pending.drain().count()
        };
        if drained > 0 {
            debug!(drained, "failed in-flight requests on stream teardown");
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
