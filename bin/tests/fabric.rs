//! End-to-end tests: a real gateway stream server and a real control client
//! talking over localhost WebSockets, with the full allocate / list /
//! release / discover / tunnel paths exercised through the public service.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use control::client::StreamClient;
use control::proxmox::NoInventory;
use control::resolve::LeaseResolver;
use control::service::FabricService;
use control::store::{LeaseStore, NewLease};
use dns_client::LoopbackResolver;
use fabric_core::registry::GatewayRegistry;
use gateway::dhcp::DhcpManager;
use gateway::proxy::SshProxy;
use gateway::server::GatewayState;
use pool_manager::AddressPool;

const SECRET: &str = "integration-secret";

struct EdgeFixture {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    token: CancellationToken,
    // must outlive the DHCP manager
    _dir: TempDir,
}

async fn start_edge() -> EdgeFixture {
    let dir = TempDir::new().unwrap();
    let pool = AddressPool::new(
        Ipv4Addr::new(10, 0, 0, 10),
        Ipv4Addr::new(10, 0, 0, 12),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(10, 0, 0, 1),
        vec![Ipv4Addr::new(10, 0, 0, 1)],
        "vm.internal",
        "eth1",
    )
    .unwrap();
    let dhcp = Arc::new(
        DhcpManager::open(pool, Duration::from_secs(86_400), dir.path())
            .await
            .unwrap(),
    );
    // targets in these tests are literal IPs; the resolver is never consulted
    let resolver = LoopbackResolver::with_server(
        "127.0.0.1:1".parse().unwrap(),
        None,
        Duration::from_millis(200),
    );
    let proxy = Arc::new(SshProxy::new(resolver));
    let token = CancellationToken::new();
    let state = Arc::new(GatewayState {
        secret: SECRET.to_owned(),
        version: "test".to_owned(),
        dhcp,
        proxy,
        registry: Arc::new(GatewayRegistry::new()),
        shutdown: token.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(gateway::server::serve(listener, state.clone(), token.clone()));

    EdgeFixture {
        addr,
        state,
        token,
        _dir: dir,
    }
}

struct ControlFixture {
    registry: Arc<GatewayRegistry>,
    store: LeaseStore,
    service: FabricService,
    token: CancellationToken,
}

async fn start_control(node: &str, edge_addr: SocketAddr) -> ControlFixture {
    let store = LeaseStore::open("sqlite::memory:").await.unwrap();
    let registry = Arc::new(GatewayRegistry::new());
    let resolver = LeaseResolver::new(store.clone(), Arc::new(NoInventory));
    let token = CancellationToken::new();

    let client = StreamClient {
        node: node.to_owned(),
        url: format!("http://{edge_addr}"),
        secret: SECRET.to_owned(),
        registry: registry.clone(),
        store: store.clone(),
        resolver,
    };
    client.spawn(token.clone());

    let service = FabricService::new(registry.clone(), store.clone(), SECRET.to_owned());
    ControlFixture {
        registry,
        store,
        service,
        token,
    }
}

async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn allocate_list_release_through_the_stream() {
    let edge = start_edge().await;
    let control = start_control("node-a", edge.addr).await;

    wait_for("gateway registration", || async {
        control.registry.get("node-a").is_some()
    })
    .await;

    // happy-path allocate lands on the lowest pool address and is persisted
    let lease = control
        .service
        .allocate_lease("vps-A", "org-1", "aa:bb:cc:dd:ee:01", "node-a")
        .await
        .unwrap();
    assert_eq!(lease.ip_address, "10.0.0.10");
    assert_eq!(lease.gateway_node, "node-a");
    assert!(
        control
            .store
            .find_lease_by_vps("vps-A", false)
            .await
            .unwrap()
            .is_some()
    );

    // idempotent repeat
    let again = control
        .service
        .allocate_lease("vps-A", "org-1", "aa:bb:cc:dd:ee:01", "node-a")
        .await
        .unwrap();
    assert_eq!(again.ip_address, "10.0.0.10");

    let second = control
        .service
        .allocate_lease("vps-B", "org-1", "aa:bb:cc:dd:ee:02", "node-a")
        .await
        .unwrap();
    assert_eq!(second.ip_address, "10.0.0.11");

    // live list from the edge agrees with the store
    let live = control
        .service
        .list_leases(Some("node-a"), None, None)
        .await
        .unwrap();
    assert_eq!(live.len(), 2);

    // pool exhaustion surfaces as precondition-failed
    control
        .service
        .allocate_lease("vps-C", "org-1", "aa:bb:cc:dd:ee:03", "node-a")
        .await
        .unwrap();
    let err = control
        .service
        .allocate_lease("vps-D", "org-1", "aa:bb:cc:dd:ee:04", "node-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind, fabric_core::error::ErrorKind::PreconditionFailed);

    // release and reuse
    control
        .service
        .release_lease("vps-A", "node-a")
        .await
        .unwrap();
    let reused = control
        .service
        .allocate_lease("vps-E", "org-1", "aa:bb:cc:dd:ee:05", "node-a")
        .await
        .unwrap();
    assert_eq!(reused.ip_address, "10.0.0.10");

    // an unknown gateway is unavailable, not an internal error
    let err = control
        .service
        .allocate_lease("vps-F", "org-1", "aa:bb:cc:dd:ee:06", "node-zz")
        .await
        .unwrap_err();
    assert_eq!(err.kind, fabric_core::error::ErrorKind::Unavailable);

    control.token.cancel();
    edge.token.cancel();
}

#[tokio::test]
async fn discovered_daemon_leases_reach_the_store() {
    let edge = start_edge().await;

    // a live daemon lease the control plane never pushed, present before the
    // stream connects so the on-connect sync discovers it
    std::fs::write(
        edge._dir.path().join("dnsmasq.leases"),
        "1999999999 aa:bb:cc:dd:ee:ff 10.0.0.12 squatter *\n",
    )
    .unwrap();

    let control = start_control("node-a", edge.addr).await;
    wait_for("discovery absorption", || async {
        control
            .store
            .find_lease_by_mac("aa:bb:cc:dd:ee:ff")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let lease = control
        .store
        .find_lease_by_mac("aa:bb:cc:dd:ee:ff")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.gateway_node, "node-a");
    assert_eq!(lease.ip_address, "10.0.0.12");
    // nobody could attribute it, so it carries the placeholder identity
    assert_eq!(lease.vps_id, "unassigned-aabbccddeeff");

    // the squatter's address is not allocatable
    wait_for("squatter blocks its address", || async {
        let resp = edge.state.dhcp.pool_config().await;
        resp.available == 2
    })
    .await;

    control.token.cancel();
    edge.token.cancel();
}

#[tokio::test]
async fn ssh_tunnel_relays_to_the_target() {
    let edge = start_edge().await;
    let control = start_control("node-a", edge.addr).await;
    wait_for("gateway registration", || async {
        control.registry.get("node-a").is_some()
    })
    .await;

    let echo = echo_server().await;
    // the "VM" is the echo server on loopback
    control
        .store
        .upsert_lease(&NewLease {
            vps_id: "vps-ssh".into(),
            organization_id: "org-1".into(),
            mac_address: "aa:bb:cc:dd:ee:77".into(),
            ip_address: echo.ip().to_string(),
            gateway_node: "node-a".into(),
            is_public: false,
            expires_at: None,
        })
        .await
        .unwrap();

    let (client, mut local) = tokio::io::duplex(4096);
    let service = control.service.clone();
    let tunnel = tokio::spawn(async move {
        service.open_ssh_tunnel("vps-ssh", echo.port(), client).await
    });

    local.write_all(b"SSH-2.0-probe\r\n").await.unwrap();
    let mut buf = [0u8; 15];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"SSH-2.0-probe\r\n");

    wait_for("proxy accounting", || async {
        edge.state.proxy.active() == 1
    })
    .await;

    drop(local);
    tunnel.await.unwrap().unwrap();
    wait_for("proxy cleanup", || async {
        edge.state.proxy.active() == 0
    })
    .await;

    // a vps with no lease is not tunnellable
    let (client, _local) = tokio::io::duplex(64);
    let err = control
        .service
        .open_ssh_tunnel("vps-none", 22, client)
        .await
        .unwrap_err();
    assert_eq!(err.kind, fabric_core::error::ErrorKind::NotFound);

    control.token.cancel();
    edge.token.cancel();
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let edge = start_edge().await;
    let store = LeaseStore::open("sqlite::memory:").await.unwrap();
    let registry = Arc::new(GatewayRegistry::new());
    let resolver = LeaseResolver::new(store.clone(), Arc::new(NoInventory));
    let token = CancellationToken::new();

    let client = StreamClient {
        node: "node-a".to_owned(),
        url: format!("http://{}", edge.addr),
        secret: "not-the-secret".to_owned(),
        registry: registry.clone(),
        store,
        resolver,
    };
    client.spawn(token.clone());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(registry.get("node-a").is_none());

    token.cancel();
    edge.token.cancel();
}
