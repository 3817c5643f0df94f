//! SNAT manager.
//!
//! One masquerade-style rule per tenant subnet on the egress interface.
//! Rules are identified by a unique comment tag, never by position:
//! presence-before-insert on configure, absence-tolerated on remove. A
//! failed install at startup is fatal (broken tenant egress must not be
//! silent); a failed removal at shutdown is only logged.

use std::net::Ipv4Addr;
use std::process::Output;

use ipnet::Ipv4Net;
use tokio::process::Command;
use tracing::{debug, info, warn};

use fabric_core::error::FabricError;

/// Inputs from gateway configuration. `outbound_ip == None` disables SNAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatSettings {
    /// Source address for masqueraded tenant traffic.
    pub outbound_ip: Option<Ipv4Addr>,
    /// Tenant-side gateway address; anchors the subnet derivation.
    pub gateway_ip: Ipv4Addr,
    /// Tenant subnet mask.
    pub subnet_mask: Ipv4Addr,
    /// Explicit egress interface, detected from the default route when unset.
    pub interface: Option<String>,
}

/// A configured SNAT rule owner. Exists only when an outbound IP is set.
#[derive(Debug, Clone)]
pub struct SnatManager {
    subnet: Ipv4Net,
    outbound_ip: Ipv4Addr,
    interface: String,
    tag: String,
}

/// The comment tag that makes the rule recognisable and idempotent.
pub fn rule_tag(outbound_ip: Ipv4Addr) -> String {
    format!("vps-gateway-snat-{outbound_ip}")
}

/// Tenant subnet from the gateway address and mask.
pub(crate) fn derive_subnet(
    gateway_ip: Ipv4Addr,
    subnet_mask: Ipv4Addr,
) -> Result<Ipv4Net, FabricError> {
    let prefix = ipnet::ipv4_mask_to_prefix(subnet_mask)
        .map_err(|_| FabricError::invalid_argument(format!("bad subnet mask {subnet_mask}")))?;
    Ok(Ipv4Net::new(gateway_ip, prefix)
        .map_err(|_| FabricError::invalid_argument(format!("bad subnet mask {subnet_mask}")))?
        .trunc())
}

fn masquerade_args(subnet: Ipv4Net, interface: &str, outbound_ip: Ipv4Addr, tag: &str) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        "-A".into(),
        "POSTROUTING".into(),
        "-s".into(),
        subnet.to_string(),
        "-o".into(),
        interface.into(),
        "-j".into(),
        "SNAT".into(),
        "--to-source".into(),
        outbound_ip.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        tag.into(),
    ]
}

/// Turn a `iptables -S` line that appends our rule into the matching delete.
fn delete_args(line: &str) -> Option<Vec<String>> {
    let rest = line.trim().strip_prefix("-A ")?;
    let mut args = vec!["-t".to_owned(), "nat".to_owned(), "-D".to_owned()];
    args.extend(rest.split_whitespace().map(|tok| {
        // iptables-save quotes comments; our tags carry no spaces
        tok.trim_matches('"').to_owned()
    }));
    Some(args)
}

/// Pull the `dev <name>` token pair out of `ip -o route get` output.
pub(crate) fn parse_route_device(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "dev" {
            return tokens.next().map(str::to_owned);
        }
    }
    None
}

async fn run(program: &str, args: &[String]) -> Result<Output, FabricError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| FabricError::internal(format!("running {program}: {e}")))?;
    Ok(output)
}

async fn run_checked(program: &str, args: &[String]) -> Result<String, FabricError> {
    let output = run(program, args).await?;
    if !output.status.success() {
        return Err(FabricError::internal(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Detect the egress interface by asking the kernel how it would route a
/// canary destination.
async fn detect_egress_interface() -> Result<String, FabricError> {
    let out = run_checked(
        "ip",
        &[
            "-o".to_owned(),
            "route".to_owned(),
            "get".to_owned(),
            "1.1.1.1".to_owned(),
        ],
    )
    .await?;
    parse_route_device(&out)
        .ok_or_else(|| FabricError::internal(format!("no device in route output {out:?}")))
}

fn interface_exists(name: &str) -> bool {
    pnet::datalink::interfaces().iter().any(|i| i.name == name)
}

/// Install the tenant SNAT rule at startup. Returns `None` when SNAT is not
/// configured; any real failure here is fatal to the gateway.
pub async fn configure(settings: &SnatSettings) -> Result<Option<SnatManager>, FabricError> {
    let Some(outbound_ip) = settings.outbound_ip else {
        info!("no outbound IP configured; SNAT disabled");
        return Ok(None);
    };

    let subnet = derive_subnet(settings.gateway_ip, settings.subnet_mask)?;
    let interface = match &settings.interface {
        Some(name) => {
            if !interface_exists(name) {
                return Err(FabricError::invalid_argument(format!(
                    "configured egress interface {name:?} does not exist"
                )));
            }
            name.clone()
        }
        None => detect_egress_interface().await?,
    };

    let mgr = SnatManager {
        tag: rule_tag(outbound_ip),
        subnet,
        outbound_ip,
        interface,
    };
    mgr.ensure().await?;
    Ok(Some(mgr))
}

impl SnatManager {
    /// The comment tag identifying this manager's rules.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The derived tenant subnet.
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// The egress interface the rule is bound to.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn current_rules(&self) -> Result<Vec<String>, FabricError> {
        let out = run_checked(
            "iptables",
            &[
                "-t".to_owned(),
                "nat".to_owned(),
                "-S".to_owned(),
                "POSTROUTING".to_owned(),
            ],
        )
        .await?;
        Ok(out
            .lines()
            .filter(|line| line.contains(&self.tag))
            .map(str::to_owned)
            .collect())
    }

    /// Install the rule unless a rule with our tag is already present.
    pub async fn ensure(&self) -> Result<(), FabricError> {
        if !self.current_rules().await?.is_empty() {
            debug!(tag = %self.tag, "SNAT rule already present");
            return Ok(());
        }
        let args = masquerade_args(self.subnet, &self.interface, self.outbound_ip, &self.tag);
        run_checked("iptables", &args).await?;
        info!(
            subnet = %self.subnet,
            interface = %self.interface,
            outbound_ip = %self.outbound_ip,
            "installed SNAT rule"
        );
        Ok(())
    }

    /// Remove every rule carrying our tag. Absence is success; failures are
    /// logged because shutdown must proceed either way.
    pub async fn remove(&self) {
        let rules = match self.current_rules().await {
            Ok(rules) => rules,
            Err(err) => {
                warn!(%err, "could not list SNAT rules during shutdown");
                return;
            }
        };
        if rules.is_empty() {
            debug!(tag = %self.tag, "no SNAT rule to remove");
            return;
        }
        for line in rules {
            let Some(args) = delete_args(&line) else {
                warn!(line, "unrecognised rule line; skipping");
                continue;
            };
            match run_checked("iptables", &args).await {
                Ok(_) => info!(tag = %self.tag, "removed SNAT rule"),
                Err(err) => warn!(%err, "failed to remove SNAT rule"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_embeds_the_outbound_ip() {
        assert_eq!(
            rule_tag(Ipv4Addr::new(203, 0, 113, 9)),
            "vps-gateway-snat-203.0.113.9"
        );
    }

    #[test]
    fn subnet_derivation_truncates_host_bits() {
        let net = derive_subnet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0))
            .unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/24");
        // applying the derivation to its own network is a fixed point
        let again = derive_subnet(net.network(), Ipv4Addr::new(255, 255, 255, 0)).unwrap();
        assert_eq!(net, again);

        assert!(derive_subnet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(0, 255, 0, 0)).is_err());
    }

    #[test]
    fn masquerade_args_shape() {
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let args = masquerade_args(net, "eth0", Ipv4Addr::new(203, 0, 113, 9), "vps-gateway-snat-203.0.113.9");
        assert_eq!(
            args.join(" "),
            "-t nat -A POSTROUTING -s 10.0.0.0/24 -o eth0 -j SNAT \
             --to-source 203.0.113.9 -m comment --comment vps-gateway-snat-203.0.113.9"
        );
    }

    #[test]
    fn delete_args_mirror_the_append() {
        let line = "-A POSTROUTING -s 10.0.0.0/24 -o eth0 -j SNAT --to-source 203.0.113.9 \
                    -m comment --comment \"vps-gateway-snat-203.0.113.9\"";
        let args = delete_args(line).unwrap();
        assert_eq!(args[..3], ["-t", "nat", "-D"]);
        assert_eq!(args[3], "POSTROUTING");
        assert!(args.contains(&"vps-gateway-snat-203.0.113.9".to_owned()));
        assert!(delete_args("-N POSTROUTING").is_none());
    }

    #[test]
    fn route_device_parses() {
        let out = "1.1.1.1 via 192.0.2.1 dev eth0 src 192.0.2.10 uid 0\\    cache";
        assert_eq!(parse_route_device(out).as_deref(), Some("eth0"));
        assert_eq!(parse_route_device("1.1.1.1 unreachable"), None);
    }
}
