#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use control::client::StreamClient;
use control::config::{Config, Parser};
use control::proxmox::NoInventory;
use control::resolve::LeaseResolver;
use control::store::LeaseStore;
use fabric_core::registry::GatewayRegistry;
use fabric_core::trace;
use tokio::runtime::Builder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

fn main() -> Result<()> {
    if let Err(err) = dotenv::dotenv() {
        eprintln!("note: .env not loaded: {err}");
    }
    // parses from cli or environment var
    let config = Config::parse();
    let trace_config = trace::Config::parse(&config.control_log)?;
    debug!(?trace_config);

    let rt = Builder::new_multi_thread()
        .thread_name("vps-control-worker")
        .enable_all()
        .build()?;

    rt.block_on(start(config))
}

async fn start(config: Config) -> Result<()> {
    let endpoints = config
        .endpoints()
        .map_err(|e| anyhow!(e))
        .context("invalid gateway endpoint configuration")?;
    info!(gateways = endpoints.len(), "configured gateway endpoints");

    let store = LeaseStore::open(&config.database_url)
        .await
        .context("opening lease store")?;
    let registry = Arc::new(GatewayRegistry::new());
    // the real hypervisor client is wired in by the surrounding service
    let resolver = LeaseResolver::new(store.clone(), Arc::new(NoInventory));

    let token = CancellationToken::new();
    let mut clients = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let client = StreamClient {
            node: endpoint.node.clone(),
            url: endpoint.url,
            secret: config.api_secret.clone(),
            registry: registry.clone(),
            store: store.clone(),
            resolver: resolver.clone(),
        };
        info!(node = %endpoint.node, "starting gateway stream client");
        clients.push(client.spawn(token.clone()));
    }

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    token.cancel();
    for client in clients {
        if let Err(err) = client.await {
            error!(?err, "error waiting for stream client");
        }
    }
    Ok(())
}
