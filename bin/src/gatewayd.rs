#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use dns_client::LoopbackResolver;
use external_api::{ExternalApi, Health};
use fabric_core::registry::GatewayRegistry;
use fabric_core::trace;
use gateway::config::{Config, Parser};
use gateway::dhcp::DhcpManager;
use gateway::proxy::SshProxy;
use gateway::server::GatewayState;
use gateway::snat;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

fn main() -> Result<()> {
    if let Err(err) = dotenv::dotenv() {
        // tracing is not up yet; stderr is fine for this one
        eprintln!("note: .env not loaded: {err}");
    }
    // parses from cli or environment var
    let config = Config::parse();
    let trace_config = trace::Config::parse(&config.gateway_log)?;
    debug!(?trace_config);

    let rt = Builder::new_multi_thread()
        .thread_name("vps-gateway-worker")
        .enable_all()
        .build()?;

    rt.block_on(start(config))
}

async fn start(config: Config) -> Result<()> {
    let pool = config
        .address_pool()
        .map_err(|e| anyhow!(e))
        .context("invalid DHCP pool configuration")?;
    info!(
        start = %pool.start(),
        end = %pool.end(),
        gateway = %pool.gateway(),
        domain = pool.domain(),
        "pool configured"
    );

    // broken tenant egress must not be silent: SNAT failure is fatal
    let snat = snat::configure(&config.snat_settings())
        .await
        .map_err(|e| anyhow!(e))
        .context("SNAT setup failed")?;

    let dhcp = Arc::new(
        DhcpManager::open(pool, config.lease_time(), &config.dhcp_leases_dir)
            .await
            .map_err(|e| anyhow!(e))
            .context("DHCP manager startup failed")?,
    );
    let resolver = LoopbackResolver::new(Some(config.dhcp_domain.clone()));
    let proxy = Arc::new(SshProxy::new(resolver));
    let registry = Arc::new(GatewayRegistry::new());

    let token = CancellationToken::new();
    let state = Arc::new(GatewayState {
        secret: config.api_secret.clone(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        dhcp,
        proxy: proxy.clone(),
        registry,
        shutdown: token.clone(),
    });

    let api = ExternalApi::new(config.metrics_addr());
    let api_sender = api.sender();
    let api_guard = api.serve();

    let listener = TcpListener::bind(config.stream_addr())
        .await
        .with_context(|| format!("binding stream port {}", config.grpc_port))?;
    info!(addr = %config.stream_addr(), "gateway stream server listening");

    let mut server = tokio::spawn(gateway::server::serve(listener, state, token.clone()));

    debug!("changing health to good after startup");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal received"),
        res = &mut server => {
            let _ = api_sender.send(Health::Bad).await;
            token.cancel();
            return match res {
                Ok(Ok(())) => Err(anyhow!("stream server returned early")),
                Ok(Err(err)) => Err(err).context("stream server failed"),
                Err(err) => Err(anyhow!(err)).context("stream server panicked"),
            };
        }
    }

    token.cancel();
    proxy.close();
    if let Some(snat) = snat {
        snat.remove().await;
    }
    if let Err(err) = server.await {
        error!(?err, "error waiting for stream server");
    }
    drop(api_guard);
    Ok(())
}
