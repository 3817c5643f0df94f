//! control service configuration

use std::collections::HashSet;

pub use clap::Parser;

use fabric_core::error::FabricError;

/// default log level. All valid RUST_LOG arguments are accepted
pub const DEFAULT_CONTROL_LOG: &str = "info";
/// default lease store; a file path is expected in production
pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";

/// parses from cli or environment var; the binary loads `.env` as well
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "controld", bin_name = "controld", about, long_about = None)]
pub struct Config {
    /// comma-separated `<node>:<url>` pairs naming every gateway to drive
    #[clap(long, env = "VPS_NODE_GATEWAY_ENDPOINTS")]
    pub gateway_endpoints: String,
    /// shared secret presented to every gateway
    #[clap(long, env = "VPS_GATEWAY_API_SECRET")]
    pub api_secret: String,
    /// lease store location. Use "sqlite::memory:" for an in-memory store
    #[clap(long, env = "CONTROL_DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env = "CONTROL_LOG", default_value = DEFAULT_CONTROL_LOG)]
    pub control_log: String,
}

impl Config {
    /// The configured gateway endpoints, validated.
    pub fn endpoints(&self) -> Result<Vec<GatewayEndpoint>, FabricError> {
        parse_endpoints(&self.gateway_endpoints)
    }
}

/// One configured gateway: its node name and base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEndpoint {
    /// Node name, the gateway's identity across the fabric.
    pub node: String,
    /// Base URL with an `http://` or `https://` scheme.
    pub url: String,
}

/// Parse `node1:https://gw1:1537,node2:http://gw2:1537`.
pub fn parse_endpoints(raw: &str) -> Result<Vec<GatewayEndpoint>, FabricError> {
    let mut endpoints = Vec::new();
    let mut seen = HashSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (node, url) = part.split_once(':').ok_or_else(|| {
            FabricError::invalid_argument(format!("endpoint {part:?} is not <node>:<url>"))
        })?;
        let node = node.trim();
        let url = url.trim();
        if node.is_empty() {
            return Err(FabricError::invalid_argument(format!(
                "endpoint {part:?} has an empty node name"
            )));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(FabricError::invalid_argument(format!(
                "endpoint url {url:?} must use http:// or https://"
            )));
        }
        if !seen.insert(node.to_owned()) {
            return Err(FabricError::invalid_argument(format!(
                "gateway node {node:?} is configured twice"
            )));
        }
        endpoints.push(GatewayEndpoint {
            node: node.to_owned(),
            url: url.trim_end_matches('/').to_owned(),
        });
    }
    if endpoints.is_empty() {
        return Err(FabricError::invalid_argument(
            "VPS_NODE_GATEWAY_ENDPOINTS is empty",
        ));
    }
    Ok(endpoints)
}

/// Translate a configured `http(s)://` base URL into the `ws(s)://` URL for
/// a given path (`/stream`, `/tunnel?...`).
pub fn ws_url(base: &str, path_and_query: &str) -> Result<String, FabricError> {
    let rewritten = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        return Err(FabricError::invalid_argument(format!(
            "endpoint url {base:?} must use http:// or https://"
        )));
    };
    Ok(format!(
        "{}{}",
        rewritten.trim_end_matches('/'),
        path_and_query
    ))
}
