//! # dns-client
//!
//! A deliberately small A/AAAA client pointed at the gateway's own DNS
//! daemon on `127.0.0.1:53`. The SSH proxy must resolve tenant VM names the
//! way the gateway's DHCP/DNS daemon sees them; going through the host
//! resolver would let `/etc/resolv.conf` shadow that view, so this client
//! speaks to the daemon directly over UDP and nothing else.
//!
//! Resolution behaviour: literal IPs short-circuit, a failed or empty first
//! lookup is retried once with the configured search domain appended, and
//! IPv4 answers win over IPv6.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Hard ceiling for one UDP exchange.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_RESPONSE: usize = 4096;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("dns query for {name:?} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("dns protocol error: {0}")]
    Proto(#[from] ProtoError),
    #[error("io error talking to dns daemon: {0}")]
    Io(#[from] std::io::Error),
    #[error("no A or AAAA records for {0:?}")]
    Empty(String),
    #[error("invalid host name {0:?}")]
    InvalidName(String),
}

/// Resolver bound to one DNS server address, normally loopback:53.
#[derive(Debug, Clone)]
pub struct LoopbackResolver {
    server: SocketAddr,
    domain: Option<String>,
    timeout: Duration,
}

impl LoopbackResolver {
    /// Resolver against `127.0.0.1:53` with the given search domain.
    pub fn new(domain: Option<String>) -> Self {
        Self::with_server(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
            domain,
            DNS_TIMEOUT,
        )
    }

    /// Fully parameterised constructor, used by tests to point at a fake
    /// daemon on an ephemeral port.
    pub fn with_server(server: SocketAddr, domain: Option<String>, timeout: Duration) -> Self {
        Self {
            server,
            domain: domain.filter(|d| !d.is_empty()),
            timeout,
        }
    }

    /// Resolve a target to a single address, preferring IPv4.
    pub async fn resolve(&self, target: &str) -> Result<IpAddr, ResolveError> {
        let target = target.trim();
        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(ip);
        }

        match self.lookup(target).await {
            Ok(ips) if !ips.is_empty() => return Ok(pick(ips)),
            Ok(_) => debug!(target, "no records from first lookup"),
            Err(err) => debug!(target, %err, "first lookup failed"),
        }

        if let Some(domain) = &self.domain {
            let qualified = format!("{target}.{domain}");
            debug!(%qualified, "retrying with search domain");
            let ips = self.lookup(&qualified).await?;
            if !ips.is_empty() {
                return Ok(pick(ips));
            }
        }

        Err(ResolveError::Empty(target.to_owned()))
    }

    /// A lookup first; AAAA only when no IPv4 answer exists.
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let name =
            Name::from_utf8(name).map_err(|_| ResolveError::InvalidName(name.to_owned()))?;
        let v4 = self.query(&name, RecordType::A).await?;
        if !v4.is_empty() {
            return Ok(v4);
        }
        self.query(&name, RecordType::AAAA).await
    }

    async fn query(&self, name: &Name, rtype: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
        let id: u16 = rand::random();
        let mut query = Query::new();
        query
            .set_name(name.clone())
            .set_query_class(DNSClass::IN)
            .set_query_type(rtype);
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(query);
        let wire = message.to_bytes()?;

        let bind: SocketAddr = if self.server.is_ipv4() {
            "127.0.0.1:0".parse().unwrap()
        } else {
            "[::1]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;
        socket.send(&wire).await?;

        let response = tokio::time::timeout(self.timeout, async {
            let mut buf = [0u8; MAX_RESPONSE];
            loop {
                let n = socket.recv(&mut buf).await?;
                match Message::from_bytes(&buf[..n]) {
                    Ok(msg) if msg.id() == id => return Ok::<Message, ResolveError>(msg),
                    Ok(msg) => trace!(got = msg.id(), want = id, "ignoring mismatched dns id"),
                    Err(err) => trace!(%err, "ignoring undecodable dns datagram"),
                }
            }
        })
        .await
        .map_err(|_| ResolveError::Timeout {
            name: name.to_utf8(),
            timeout: self.timeout,
        })??;

        if response.response_code() != ResponseCode::NoError {
            debug!(code = %response.response_code(), %name, "dns daemon returned error code");
            return Ok(Vec::new());
        }

        Ok(response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::A(a) => Some(IpAddr::V4(a.0)),
                RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect())
    }
}

fn pick(ips: Vec<IpAddr>) -> IpAddr {
    ips.iter()
        .find(|ip| ip.is_ipv4())
        .copied()
        .unwrap_or(ips[0])
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{DNSClass, Record};
    use tracing_test::traced_test;

    use super::*;

    /// One-shot fake daemon: answers each incoming query using `answer`.
    async fn spawn_fake_daemon<F>(answer: F) -> SocketAddr
    where
        F: Fn(&Query) -> Vec<RData> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_RESPONSE];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Message::from_bytes(&buf[..n]) else {
                    continue;
                };
                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_desired(true)
                    .set_recursion_available(true);
                for q in query.queries() {
                    response.add_query(q.clone());
                    for rdata in answer(q) {
                        let mut record = Record::from_rdata(q.name().clone(), 60, rdata);
                        record.set_dns_class(DNSClass::IN);
                        response.add_answer(record);
                    }
                }
                let wire = response.to_bytes().unwrap();
                let _ = socket.send_to(&wire, peer).await;
            }
        });
        addr
    }

    fn resolver(server: SocketAddr, domain: Option<&str>) -> LoopbackResolver {
        LoopbackResolver::with_server(
            server,
            domain.map(str::to_owned),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn literal_ips_bypass_the_daemon() {
        let r = resolver("127.0.0.1:1".parse().unwrap(), None);
        assert_eq!(
            r.resolve("10.0.0.10").await.unwrap(),
            "10.0.0.10".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            r.resolve("::1").await.unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn resolves_a_record() {
        let addr = spawn_fake_daemon(|q| {
            if q.query_type() == RecordType::A {
                vec![RData::A(A(Ipv4Addr::new(10, 0, 0, 42)))]
            } else {
                vec![]
            }
        })
        .await;

        let r = resolver(addr, None);
        let ip = r.resolve("vps-a").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 42)));
    }

    #[tokio::test]
    #[traced_test]
    async fn falls_back_to_aaaa() {
        let addr = spawn_fake_daemon(|q| {
            if q.query_type() == RecordType::AAAA {
                vec![RData::AAAA(AAAA(Ipv6Addr::LOCALHOST))]
            } else {
                vec![]
            }
        })
        .await;

        let r = resolver(addr, None);
        let ip = r.resolve("vps-v6").await.unwrap();
        assert_eq!(ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[tokio::test]
    #[traced_test]
    async fn retries_with_search_domain() {
        let addr = spawn_fake_daemon(|q| {
            if q.query_type() == RecordType::A && q.name().to_utf8() == "vps-a.vm.internal." {
                vec![RData::A(A(Ipv4Addr::new(10, 0, 0, 7)))]
            } else {
                vec![]
            }
        })
        .await;

        let r = resolver(addr, Some("vm.internal"));
        let ip = r.resolve("vps-a").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_name_is_empty() {
        let addr = spawn_fake_daemon(|_| vec![]).await;
        let r = resolver(addr, None);
        let err = r.resolve("nope").await.unwrap_err();
        assert!(matches!(err, ResolveError::Empty(_)));
    }

    #[tokio::test]
    async fn dead_daemon_times_out() {
        // nothing listens here
        let r = resolver("127.0.0.1:9".parse().unwrap(), None);
        let err = r.resolve("vps-a").await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Timeout { .. } | ResolveError::Io(_)
        ));
    }
}
