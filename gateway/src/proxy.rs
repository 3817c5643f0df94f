//! SSH proxy.
//!
//! A pure bidirectional byte relay: the stream handed in is already
//! authenticated upstream, and SSH itself authenticates against the target
//! VM. The proxy's only jobs are resolving the target through the gateway's
//! own DNS daemon, connecting, and copying bytes until either side closes.
//! First EOF or error wins and tears down both directions; cancelling the
//! per-connection token or closing the proxy does the same.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dns_client::{LoopbackResolver, ResolveError};
use fabric_core::error::FabricError;
use fabric_core::metrics::{SSH_PROXY_CONNECTIONS_ACTIVE, SSH_PROXY_CONNECTIONS_TOTAL};

/// Default target port when the caller passes zero.
pub const SSH_PORT: u16 = 22;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RELAY_BUF: usize = 16 * 1024;

/// Live statistics for one proxied connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    /// Target as requested, before resolution.
    pub target: String,
    /// Target port after defaulting.
    pub port: u16,
    /// When the relay opened.
    pub created_at: DateTime<Utc>,
    last_activity: AtomicI64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl ConnectionInfo {
    fn new(target: &str, port: u16) -> Self {
        let now = Utc::now();
        Self {
            target: target.to_owned(),
            port,
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Epoch seconds of the last byte in either direction.
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Bytes relayed client-to-target.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes relayed target-to-client.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

/// The SSH relay and its per-connection accounting.
#[derive(Debug)]
pub struct SshProxy {
    resolver: LoopbackResolver,
    connections: RwLock<HashMap<String, Arc<ConnectionInfo>>>,
    shutdown: CancellationToken,
}

impl SshProxy {
    /// A proxy resolving targets through the given resolver.
    pub fn new(resolver: LoopbackResolver) -> Self {
        Self {
            resolver,
            connections: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of open relays.
    pub fn active(&self) -> usize {
        self.connections.read().len()
    }

    /// "idle" with no connections, "running" otherwise.
    pub fn status(&self) -> &'static str {
        if self.connections.read().is_empty() {
            "idle"
        } else {
            "running"
        }
    }

    /// Statistics for one open relay, if it exists.
    pub fn connection(&self, connection_id: &str) -> Option<Arc<ConnectionInfo>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Close every active connection and refuse the data path from here on.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Relay `client` to the resolved target until one side closes. The
    /// caller guarantees `connection_id` uniqueness.
    pub async fn proxy_connection<S>(
        &self,
        connection_id: &str,
        target: &str,
        port: u16,
        client: S,
        cancel: CancellationToken,
    ) -> Result<(), FabricError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let port = if port == 0 { SSH_PORT } else { port };
        let ip = self
            .resolver
            .resolve(target)
            .await
            .map_err(|e| resolve_error(target, e))?;
        let addr = SocketAddr::new(ip, port);

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                FabricError::deadline_exceeded(format!("connecting to {addr} timed out"))
            })?
            .map_err(|e| FabricError::unavailable(format!("connecting to {addr}: {e}")))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "could not set nodelay on target socket");
        }

        let info = Arc::new(ConnectionInfo::new(target, port));
        {
            let mut connections = self.connections.write();
            connections.insert(connection_id.to_owned(), info.clone());
            SSH_PROXY_CONNECTIONS_ACTIVE.set(connections.len() as i64);
        }
        SSH_PROXY_CONNECTIONS_TOTAL.inc();
        let _guard = ConnectionGuard {
            proxy: self,
            id: connection_id,
        };
        debug!(connection_id, target, %addr, "ssh relay open");

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut target_rd, mut target_wr) = stream.into_split();

        let up = relay(&mut client_rd, &mut target_wr, &info.bytes_up, &info);
        let down = relay(&mut target_rd, &mut client_wr, &info.bytes_down, &info);
        tokio::pin!(up);
        tokio::pin!(down);

        tokio::select! {
            res = &mut up => log_close(connection_id, "client-to-target", res),
            res = &mut down => log_close(connection_id, "target-to-client", res),
            _ = cancel.cancelled() => debug!(connection_id, "ssh relay cancelled"),
            _ = self.shutdown.cancelled() => debug!(connection_id, "ssh relay closed by proxy shutdown"),
        }
        debug!(
            connection_id,
            up = info.bytes_up(),
            down = info.bytes_down(),
            "ssh relay done"
        );
        Ok(())
    }
}

fn resolve_error(target: &str, err: ResolveError) -> FabricError {
    match err {
        ResolveError::Timeout { .. } => {
            FabricError::deadline_exceeded(format!("resolving {target}: {err}"))
        }
        ResolveError::Empty(_) | ResolveError::InvalidName(_) => {
            FabricError::not_found(format!("resolving {target}: {err}"))
        }
        _ => FabricError::unavailable(format!("resolving {target}: {err}")),
    }
}

fn log_close(connection_id: &str, direction: &str, res: std::io::Result<u64>) {
    match res {
        Ok(n) => debug!(connection_id, direction, bytes = n, "relay direction done"),
        Err(err) => debug!(connection_id, direction, %err, "relay direction errored"),
    }
}

async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    info: &ConnectionInfo,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        info.touch();
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

struct ConnectionGuard<'a> {
    proxy: &'a SshProxy,
    id: &'a str,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        let mut connections = self.proxy.connections.write();
        if connections.remove(self.id).is_none() {
            warn!(connection_id = self.id, "connection was not in the active map");
        }
        SSH_PROXY_CONNECTIONS_ACTIVE.set(connections.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    use super::*;

    fn proxy() -> Arc<SshProxy> {
        // targets in tests are literal IPs, so the resolver is never hit
        Arc::new(SshProxy::new(LoopbackResolver::with_server(
            "127.0.0.1:1".parse().unwrap(),
            None,
            Duration::from_millis(100),
        )))
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
    #[traced_test]
    async fn relays_bytes_both_ways() {
        let proxy = proxy();
        let echo = echo_server().await;
        let (client, mut local) = tokio::io::duplex(4096);

        let task = {
            let proxy = proxy.clone();
            let target = echo.ip().to_string();
            tokio::spawn(async move {
                proxy
                    .proxy_connection("conn-1", &target, echo.port(), client, CancellationToken::new())
                    .await
            })
        };

        local.write_all(b"ssh-handshake").await.unwrap();
        let mut buf = [0u8; 13];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ssh-handshake");
        assert_eq!(proxy.status(), "running");
        let info = proxy.connection("conn-1").unwrap();
        assert_eq!(info.port, echo.port());
        assert!(info.bytes_up() >= 13);

        drop(local);
        task.await.unwrap().unwrap();
        assert_eq!(proxy.status(), "idle");
        assert_eq!(proxy.active(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn cancellation_tears_the_relay_down() {
        let proxy = proxy();
        let echo = echo_server().await;
        let (client, mut local) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        let task = {
            let proxy = proxy.clone();
            let cancel = cancel.clone();
            let target = echo.ip().to_string();
            tokio::spawn(async move {
                proxy
                    .proxy_connection("conn-2", &target, echo.port(), client, cancel)
                    .await
            })
        };

        local.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        local.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(proxy.active(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn closing_the_proxy_closes_connections() {
        let proxy = proxy();
        let echo = echo_server().await;
        let (client, mut local) = tokio::io::duplex(4096);

        let task = {
            let proxy = proxy.clone();
            let target = echo.ip().to_string();
            tokio::spawn(async move {
                proxy
                    .proxy_connection("conn-3", &target, echo.port(), client, CancellationToken::new())
                    .await
            })
        };

        local.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        local.read_exact(&mut buf).await.unwrap();

        proxy.close();
        task.await.unwrap().unwrap();
        assert_eq!(proxy.status(), "idle");
    }

    #[tokio::test]
    async fn dead_target_is_unavailable() {
        let proxy = proxy();
        let (client, _local) = tokio::io::duplex(64);
        // hopefully nothing listens on this port
        let err = proxy
            .proxy_connection("conn-4", "127.0.0.1", 59_999, client, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, fabric_core::error::ErrorKind::Unavailable);
        assert_eq!(proxy.active(), 0);
    }
}
