//! Startup-only peer and anchor discovery: an Iquidus-style block explorer,
//! DNS seed hosts, and literal `host:port` lists. Everything here is
//! best-effort; a failed source is logged and the daemon carries on with
//! whatever the other sources produced.

use std::time::SystemTime;

use serde::Deserialize;
use specterd_primitives::hash::{hash256_from_hex, Hash256};
use tokio::net::lookup_host;

use crate::log::log_warn;
use crate::peer_store::PeerEntry;

#[derive(Debug, Deserialize)]
struct PossiblePeer {
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    addrlocal: Option<String>,
}

pub struct ExplorerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ExplorerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get_text(&self, path: &str) -> Result<String, String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("GET {url}: {err}"))?;
        response
            .text()
            .await
            .map_err(|err| format!("GET {url}: {err}"))
    }

    pub async fn get_chain_height(&self) -> Result<i64, String> {
        let body = self.get_text("/api/getblockcount").await?;
        body.trim()
            .parse::<i64>()
            .map_err(|_| format!("unexpected block count response: {body}"))
    }

    pub async fn get_block_hash(&self, height: i64) -> Result<Hash256, String> {
        let body = self
            .get_text(&format!("/api/getblockhash?index={height}"))
            .await?;
        hash256_from_hex(body.trim().trim_matches('"'))
    }

    /// Peers the explorer's own node currently sees, filtered to the
    /// network's default port and deduplicated.
    pub async fn get_peers(&self, port_filter: u16) -> Result<Vec<PeerEntry>, String> {
        let body = self.get_text("/api/getpeerinfo").await?;
        let possible: Vec<PossiblePeer> =
            serde_json::from_str(&body).map_err(|err| format!("bad peer info json: {err}"))?;
        let mut peers: Vec<PeerEntry> = Vec::new();
        for peer in possible {
            for pair in [peer.addr.as_deref(), peer.addrlocal.as_deref()] {
                let Some(pair) = pair else { continue };
                let Some((address, port)) = split_host_port(pair) else {
                    continue;
                };
                if port != port_filter {
                    continue;
                }
                if peers
                    .iter()
                    .any(|known| known.address == address && known.port == port)
                {
                    continue;
                }
                peers.push(PeerEntry {
                    address,
                    port,
                    last_seen: SystemTime::now(),
                });
            }
        }
        Ok(peers)
    }
}

/// Resolves one DNS seed host to peer entries on the default port.
pub async fn load_dns_seed(host: &str, default_port: u16) -> Vec<PeerEntry> {
    match lookup_host((host, default_port)).await {
        Ok(addrs) => addrs
            .map(|addr| PeerEntry {
                address: addr.ip().to_string(),
                port: default_port,
                last_seen: SystemTime::now(),
            })
            .collect(),
        Err(err) => {
            log_warn!("could not resolve dns seed {host}: {err}");
            Vec::new()
        }
    }
}

/// Splits `"host:port,host:port"`, dropping entries that do not parse.
pub fn split_address_list(list: &str) -> Vec<PeerEntry> {
    list.split(',')
        .filter_map(|pair| {
            let (address, port) = split_host_port(pair.trim())?;
            Some(PeerEntry {
                address,
                port,
                last_seen: SystemTime::now(),
            })
        })
        .collect()
}

fn split_host_port(pair: &str) -> Option<(String, u16)> {
    let (host, port) = pair.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    // bracketed ipv6 literals carry their brackets in joined form
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port))
}
