//! specterd: keeps a swarm of outbound connections to a masternode network
//! and periodically proves a list of operator-controlled node identities
//! alive, relaying discovered peers and block hashes back into its own
//! bootstrap state.

mod analyzer;
mod block_queue;
mod bootstrap;
mod broadcast_store;
mod events;
mod generator;
mod log;
mod peer;
mod peer_store;
mod signing;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use specterd_primitives::hash::{hash256_from_hex, hash256_to_hex, Hash256};
use tokio::sync::{mpsc, watch};

use crate::analyzer::{FormatState, PingAnalyzer};
use crate::bootstrap::ExplorerClient;
use crate::log::{log_error, log_info, log_warn};
use crate::peer::PeerConfig;
use crate::peer_store::PeerStore;
use crate::supervisor::{Supervisor, SupervisorConfig, EVENT_QUEUE_CAPACITY};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_USER_AGENT: &str = "/specterd:0.1.0/";
const ANALYZER_THRESHOLD: u32 = 10;
const BOOTSTRAP_DEPTH: i64 = 12;

struct Config {
    coin_conf: Option<PathBuf>,
    masternode_conf: PathBuf,
    max_connections: usize,
    magic_hex: String,
    port: u16,
    protocol_number: u32,
    magic_message: String,
    magic_message_newline: bool,
    bootstrap_ips: String,
    dns_seeds: String,
    bootstrap_hash: String,
    bootstrap_url: String,
    sentinel_version: String,
    daemon_version: String,
    user_agent: String,
    broadcast_listen: bool,
    autosense: bool,
    peers_file: PathBuf,
    debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coin_conf: None,
            masternode_conf: PathBuf::from("masternode.txt"),
            max_connections: 10,
            magic_hex: String::new(),
            port: 0,
            protocol_number: 0,
            magic_message: String::new(),
            magic_message_newline: true,
            bootstrap_ips: String::new(),
            dns_seeds: String::new(),
            bootstrap_hash: String::new(),
            bootstrap_url: String::new(),
            sentinel_version: String::new(),
            daemon_version: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            broadcast_listen: false,
            autosense: true,
            peers_file: PathBuf::from("peers.json"),
            debug: false,
        }
    }
}

/// JSON coin description; any value left unset on the command line falls
/// back to the file.
#[derive(Debug, Default, Deserialize)]
struct CoinConf {
    #[serde(default)]
    name: String,
    #[serde(default)]
    max_connections: Option<u32>,
    #[serde(default)]
    magicbytes: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    protocol_number: u32,
    #[serde(default)]
    magic_message: String,
    #[serde(default)]
    magic_message_newline: Option<bool>,
    #[serde(default)]
    bootstrap_url: String,
    #[serde(default)]
    sentinel_version: String,
    #[serde(default)]
    daemon_version: String,
    #[serde(default)]
    bootstrap_ips: String,
    #[serde(default)]
    bootstrap_hash: String,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    dns_seeds: String,
    #[serde(default)]
    broadcast_listen: Option<bool>,
    #[serde(default)]
    masternode_conf: String,
    #[serde(default)]
    autosense: Option<bool>,
}

fn load_coin_conf(path: &PathBuf) -> Result<CoinConf, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read coin conf {}: {err}", path.display()))?;
    serde_json::from_str(&contents)
        .map_err(|err| format!("failed to parse coin conf {}: {err}", path.display()))
}

/// Folds a dotted version string ("1.20.0") into a packed integer, one byte
/// per component.
fn convert_version_string(version: &str) -> u32 {
    let mut packed: u32 = 0;
    for part in version.split('.') {
        packed <<= 8;
        packed |= part.parse::<u32>().unwrap_or(0) & 0xff;
    }
    packed
}

fn usage() -> &'static str {
    "usage: specterd [options]\n\
     --coin-conf <file>            JSON file with the coin description\n\
     --masternode-conf <file>      schedule of node identities (default masternode.txt)\n\
     --max-connections <n>         peer connections to maintain (default 10)\n\
     --magic-bytes <hex>           network magic as a hex string\n\
     --port <n>                    default p2p port\n\
     --protocol-number <n>         protocol version to speak\n\
     --magic-message <text>        network signing message\n\
     --no-magic-message-newline    do not append a newline to the signing message\n\
     --bootstrap-ips <list>        host:port[,host:port] seed peers\n\
     --dns-seeds <list>            comma-separated DNS seed hosts\n\
     --bootstrap-hash <hex>        block hash to anchor the first pings\n\
     --bootstrap-url <url>         iquidus explorer to bootstrap from\n\
     --sentinel-version <ver>      sentinel version string (i.e. 1.20.0)\n\
     --daemon-version <ver>        daemon version string (i.e. 1.1.0)\n\
     --user-agent <text>           user agent for the version handshake\n\
     --broadcast-listen            cache broadcasts seen on the network\n\
     --no-autosense                trust the configured wire format as-is\n\
     --peers-file <file>           peer persistence path (default peers.json)\n\
     --debug                       enable debug output"
}

fn parse_args() -> Result<Config, String> {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--coin-conf" => {
                let value = next_value(&mut args, "--coin-conf")?;
                config.coin_conf = Some(PathBuf::from(value));
            }
            "--masternode-conf" => {
                config.masternode_conf = PathBuf::from(next_value(&mut args, "--masternode-conf")?);
            }
            "--max-connections" => {
                config.max_connections = parse_value(&mut args, "--max-connections")?;
            }
            "--magic-bytes" => {
                config.magic_hex = next_value(&mut args, "--magic-bytes")?;
            }
            "--port" => {
                config.port = parse_value(&mut args, "--port")?;
            }
            "--protocol-number" => {
                config.protocol_number = parse_value(&mut args, "--protocol-number")?;
            }
            "--magic-message" => {
                config.magic_message = next_value(&mut args, "--magic-message")?;
            }
            "--no-magic-message-newline" => {
                config.magic_message_newline = false;
            }
            "--bootstrap-ips" => {
                config.bootstrap_ips = next_value(&mut args, "--bootstrap-ips")?;
            }
            "--dns-seeds" => {
                config.dns_seeds = next_value(&mut args, "--dns-seeds")?;
            }
            "--bootstrap-hash" => {
                config.bootstrap_hash = next_value(&mut args, "--bootstrap-hash")?;
            }
            "--bootstrap-url" => {
                config.bootstrap_url = next_value(&mut args, "--bootstrap-url")?;
            }
            "--sentinel-version" => {
                config.sentinel_version = next_value(&mut args, "--sentinel-version")?;
            }
            "--daemon-version" => {
                config.daemon_version = next_value(&mut args, "--daemon-version")?;
            }
            "--user-agent" => {
                config.user_agent = next_value(&mut args, "--user-agent")?;
            }
            "--broadcast-listen" => {
                config.broadcast_listen = true;
            }
            "--no-autosense" => {
                config.autosense = false;
            }
            "--peers-file" => {
                config.peers_file = PathBuf::from(next_value(&mut args, "--peers-file")?);
            }
            "--debug" => {
                config.debug = true;
            }
            "--help" | "-h" => return Err(usage().to_string()),
            other => return Err(format!("unknown flag '{other}'\n{}", usage())),
        }
    }
    Ok(config)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_value<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<T, String> {
    let value = next_value(args, flag)?;
    value
        .parse::<T>()
        .map_err(|_| format!("invalid value '{value}' for {flag}\n{}", usage()))
}

/// Fills any unset command-line value from the coin conf file.
fn merge_coin_conf(config: &mut Config, coin: CoinConf) {
    if !coin.name.is_empty() {
        log_info!("loaded coin conf for {}", coin.name);
    }
    if config.masternode_conf == PathBuf::from("masternode.txt") && !coin.masternode_conf.is_empty()
    {
        config.masternode_conf = PathBuf::from(coin.masternode_conf);
    }
    if let Some(max_connections) = coin.max_connections {
        if config.max_connections == 10 {
            config.max_connections = max_connections as usize;
        }
    }
    if config.magic_hex.is_empty() {
        config.magic_hex = coin.magicbytes;
    }
    if config.port == 0 {
        config.port = coin.port;
    }
    if config.protocol_number == 0 {
        config.protocol_number = coin.protocol_number;
    }
    if config.magic_message.is_empty() {
        config.magic_message = coin.magic_message;
    }
    if config.magic_message_newline {
        if let Some(newline) = coin.magic_message_newline {
            config.magic_message_newline = newline;
        }
    }
    if config.bootstrap_ips.is_empty() {
        config.bootstrap_ips = coin.bootstrap_ips;
    }
    if config.dns_seeds.is_empty() {
        config.dns_seeds = coin.dns_seeds;
    }
    if config.bootstrap_hash.is_empty() {
        config.bootstrap_hash = coin.bootstrap_hash;
    }
    if config.bootstrap_url.is_empty() {
        config.bootstrap_url = coin.bootstrap_url;
    }
    if config.sentinel_version.is_empty() {
        config.sentinel_version = coin.sentinel_version;
    }
    if config.daemon_version.is_empty() {
        config.daemon_version = coin.daemon_version;
    }
    if config.user_agent == DEFAULT_USER_AGENT && !coin.user_agent.is_empty() {
        config.user_agent = coin.user_agent;
    }
    if !config.broadcast_listen {
        if let Some(broadcast_listen) = coin.broadcast_listen {
            config.broadcast_listen = broadcast_listen;
        }
    }
    if config.autosense {
        if let Some(autosense) = coin.autosense {
            config.autosense = autosense;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let mut config = parse_args()?;
    if let Some(path) = config.coin_conf.clone() {
        let coin = load_coin_conf(&path)?;
        merge_coin_conf(&mut config, coin);
    }
    log::set_debug(config.debug);

    let magic_value = u32::from_str_radix(&config.magic_hex, 16)
        .map_err(|_| format!("invalid magic bytes '{}'\n{}", config.magic_hex, usage()))?;
    let magic = magic_value.to_le_bytes();
    if config.port == 0 {
        return Err(format!("a default port is required\n{}", usage()));
    }
    if config.protocol_number == 0 {
        return Err(format!("a protocol number is required\n{}", usage()));
    }

    let mut magic_message = config.magic_message.clone();
    if config.magic_message_newline {
        magic_message.push('\n');
    }
    let sentinel_version = if config.sentinel_version.is_empty() {
        0
    } else {
        convert_version_string(&config.sentinel_version)
    };
    let daemon_version = if config.daemon_version.is_empty() {
        0
    } else {
        convert_version_string(&config.daemon_version)
    };

    log_info!("specterd v{VERSION} starting");
    log_info!(
        "magic {:08x}, protocol {}, port {}, max connections {}, autosense {}, broadcast listen {}",
        magic_value,
        config.protocol_number,
        config.port,
        config.max_connections,
        config.autosense,
        config.broadcast_listen,
    );
    log_info!(
        "masternode conf {}, sentinel {sentinel_version:#x}, daemon {daemon_version:#x}",
        config.masternode_conf.display(),
    );

    let peer_store = Arc::new(PeerStore::new());
    match peer_store.load_file(&config.peers_file) {
        Ok(0) => {}
        Ok(loaded) => log_info!("loaded {loaded} peers from {}", config.peers_file.display()),
        Err(err) => log_warn!("failed to load peers file: {err}"),
    }

    if !config.bootstrap_ips.is_empty() {
        peer_store.store_peers(bootstrap::split_address_list(&config.bootstrap_ips));
    }

    let mut anchor: Option<Hash256> = match config.bootstrap_hash.as_str() {
        "" => None,
        hex => Some(hash256_from_hex(hex).map_err(|err| format!("bad bootstrap hash: {err}"))?),
    };

    if !config.bootstrap_url.is_empty() {
        let explorer = ExplorerClient::new(&config.bootstrap_url);
        match explorer.get_peers(config.port).await {
            Ok(peers) => {
                log_info!("bootstrapped {} peers from the explorer", peers.len());
                peer_store.store_peers(peers);
            }
            Err(err) => log_error!("failed to load bootstrap peers: {err}"),
        }
        match explorer.get_chain_height().await {
            Ok(height) => match explorer.get_block_hash(height - BOOTSTRAP_DEPTH).await {
                Ok(hash) => {
                    log_info!("bootstrap hash {}", hash256_to_hex(&hash));
                    anchor = Some(hash);
                }
                Err(err) => log_error!("failed to load bootstrap hash: {err}"),
            },
            Err(err) => log_error!("failed to load bootstrap height: {err}"),
        }
    }

    if !config.dns_seeds.is_empty() {
        for seed in config.dns_seeds.split(',') {
            let peers = bootstrap::load_dns_seed(seed.trim(), config.port).await;
            log_info!("dns seed {} resolved {} peers", seed.trim(), peers.len());
            peer_store.store_peers(peers);
        }
    }

    if peer_store.len() == 0 {
        return Err("no peers available after bootstrap; supply --bootstrap-ips, \
                    --dns-seeds, or --bootstrap-url"
            .to_string());
    }

    let analyzer = Arc::new(PingAnalyzer::new(ANALYZER_THRESHOLD));
    let format = Arc::new(FormatState::new(
        config.autosense,
        false,
        sentinel_version,
        daemon_version,
    ));

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Arc::new(Supervisor::new(
        SupervisorConfig {
            target_connections: config.max_connections,
            peer_config: PeerConfig {
                magic,
                protocol_version: config.protocol_number,
                user_agent: config.user_agent.clone(),
                broadcast_listen: config.broadcast_listen,
            },
            magic_message,
            masternode_conf: config.masternode_conf.clone(),
            peers_file: config.peers_file.clone(),
        },
        analyzer,
        format,
        Arc::clone(&peer_store),
        events_tx,
        shutdown_rx,
    ));

    if let Some(anchor) = anchor {
        supervisor.block_queue.force_hash(anchor);
    }

    supervisor.spawn_sweepers();
    let event_loop = tokio::spawn(Arc::clone(&supervisor).run_event_loop(events_rx));
    supervisor.spawn_initial_peers(anchor);
    let ping_loop = tokio::spawn(Arc::clone(&supervisor).run_ping_loop());

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("failed to wait for shutdown signal: {err}"))?;
    log_info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = event_loop.await;
    let _ = ping_loop.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{convert_version_string, merge_coin_conf, CoinConf, Config};

    #[test]
    fn version_strings_pack_byte_per_component() {
        assert_eq!(convert_version_string("1.20.0"), (1 << 16) | (20 << 8));
        assert_eq!(convert_version_string("1.1.0.0"), (1 << 24) | (1 << 16));
        assert_eq!(convert_version_string(""), 0);
    }

    #[test]
    fn coin_conf_fills_unset_values_only() {
        let mut config = Config {
            magic_hex: "deadbeef".to_string(),
            ..Config::default()
        };
        let coin = CoinConf {
            magicbytes: "cafebabe".to_string(),
            port: 10001,
            protocol_number: 70208,
            magic_message: "Coin Signed Message:".to_string(),
            autosense: Some(false),
            ..CoinConf::default()
        };
        merge_coin_conf(&mut config, coin);
        // the explicit flag wins, everything else fills in
        assert_eq!(config.magic_hex, "deadbeef");
        assert_eq!(config.port, 10001);
        assert_eq!(config.protocol_number, 70208);
        assert_eq!(config.magic_message, "Coin Signed Message:");
        assert!(!config.autosense);
    }

    #[test]
    fn coin_conf_json_shape() {
        let json = r#"{
            "name": "testcoin",
            "magicbytes": "bd6b0cbf",
            "port": 10001,
            "protocol_number": 70208,
            "magic_message": "TestCoin Signed Message:",
            "magic_message_newline": true,
            "bootstrap_url": "https://explorer.example",
            "sentinel_version": "1.20.0",
            "autosense": false
        }"#;
        let coin: CoinConf = serde_json::from_str(json).unwrap();
        assert_eq!(coin.name, "testcoin");
        assert_eq!(coin.magicbytes, "bd6b0cbf");
        assert_eq!(coin.sentinel_version, "1.20.0");
        assert_eq!(coin.autosense, Some(false));
        assert_eq!(coin.broadcast_listen, None);
    }
}
