//! # Healthcheck & metrics API
//!
//! Plain-HTTP diagnostics for a gateway. It exposes the following endpoints
//! on the metrics port:
//!
//! /health
//! /ping
//! /metrics
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{error, info, trace};

use std::net::SocketAddr;

pub use crate::models::{Health, State};

/// The task runner for the [`ExternalApi`]
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Listens on the health channel and reports process state plus the
/// prometheus registry over HTTP
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(addr: SocketAddr, state: State) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        Self::run_with_listener(tcp, state).await
    }

    async fn run_with_listener(tcp: TcpListener, state: State) -> Result<()> {
        // Provides:
        // /health
        // /ping
        // /metrics
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .layer(Extension(state));

        tracing::debug!("external API listening on {}", tcp.local_addr()?);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(ExternalApi::run(addr, state), self.listen_status())
            {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start on an already-bound listener; used by tests with ephemeral ports
    pub fn start_with_listener(mut self, tcp: TcpListener) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run_with_listener(tcp, state),
                self.listen_status()
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiGuard`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {
    use crate::models::{Health, State};
    use axum::{
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use fabric_core::metrics::{START_TIME, UPTIME};
    use prometheus::{Encoder, TextEncoder};
    use tracing::error;

    pub(crate) async fn ok(
        Extension(state): Extension<State>,
    ) -> Result<impl IntoResponse, std::convert::Infallible> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn metrics() -> Result<impl IntoResponse, std::convert::Infallible> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf)).unwrap()),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_health_transitions() -> anyhow::Result<()> {
        let tcp = TcpListener::bind("127.0.0.1:0").await?;
        let addr = tcp.local_addr()?;
        let api = ExternalApi::new(addr);
        let sender = api.sender();
        let _handle = api.start_with_listener(tcp);
        // wait for server to come up
        tokio::time::sleep(Duration::from_millis(200)).await;

        // initial health state is BAD i.e. 500
        let r = reqwest::get(format!("http://{addr}/health")).await?;
        assert_eq!(r.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

        sender.send(Health::Good).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let r = reqwest::get(format!("http://{addr}/health")).await?;
        assert_eq!(r.status(), reqwest::StatusCode::OK);
        Ok(())
    }

    // very simple test for existence of the metrics endpoint
    #[tokio::test]
    async fn test_metrics() -> anyhow::Result<()> {
        // touch a couple of gauges so the families exist
        fabric_core::metrics::DHCP_POOL_SIZE.set(3);
        fabric_core::metrics::DHCP_SERVER_STATUS.set(0);

        let tcp = TcpListener::bind("127.0.0.1:0").await?;
        let addr = tcp.local_addr()?;
        let api = ExternalApi::new(addr);
        let _handle = api.start_with_listener(tcp);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await?
            .error_for_status()?
            .text()
            .await?;
        assert!(body.contains("dhcp_pool_size"));
        assert!(body.contains("dhcp_server_status"));

        let r = reqwest::get(format!("http://{addr}/ping")).await?;
        assert_eq!(r.status(), reqwest::StatusCode::OK);
        Ok(())
    }
}
