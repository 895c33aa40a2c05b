//! Known-peer table with last-seen tracking, random sampling for connection
//! picks, and a versioned JSON file for persistence across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::events::PeerKey;
use crate::log::{log_info, log_warn};

const PEER_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);
const PEERS_FILE_VERSION: u32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerEntry {
    pub address: String,
    pub port: u16,
    pub last_seen: SystemTime,
}

#[derive(Debug, Deserialize, Serialize)]
struct PeersFile {
    version: u32,
    peers: Vec<PeersFileEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct PeersFileEntry {
    address: String,
    port: u16,
    last_seen: u64,
}

#[derive(Default)]
pub struct PeerStore {
    peers: Mutex<HashMap<PeerKey, SystemTime>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_peer(&self, entry: PeerEntry) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert((entry.address, entry.port), entry.last_seen);
        }
    }

    pub fn store_peers(&self, entries: Vec<PeerEntry>) {
        for entry in entries {
            self.store_peer(entry);
        }
    }

    pub fn get_random_peer(&self) -> Option<PeerEntry> {
        self.get_random_peers(1).into_iter().next()
    }

    /// Up to `count` distinct peers, uniformly sampled.
    pub fn get_random_peers(&self, count: usize) -> Vec<PeerEntry> {
        let Ok(peers) = self.peers.lock() else {
            return Vec::new();
        };
        let mut entries: Vec<PeerEntry> = peers
            .iter()
            .map(|((address, port), last_seen)| PeerEntry {
                address: address.clone(),
                port: *port,
                last_seen: *last_seen,
            })
            .collect();
        entries.shuffle(&mut rand::thread_rng());
        entries.truncate(count);
        entries
    }

    pub fn len(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    /// Evicts peers unseen for half a day; runs on a timer.
    pub fn remove_stale_peers(&self) {
        let Ok(mut peers) = self.peers.lock() else {
            return;
        };
        let now = SystemTime::now();
        let before = peers.len();
        peers.retain(|_, last_seen| {
            now.duration_since(*last_seen)
                .map(|age| age <= PEER_MAX_AGE)
                .unwrap_or(true)
        });
        if peers.len() != before {
            log_info!("removed {} stale peers", before - peers.len());
        }
    }

    pub fn load_file(&self, path: &Path) -> Result<usize, String> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: PeersFile = serde_json::from_str(&contents).map_err(|err| err.to_string())?;
        if file.version != PEERS_FILE_VERSION {
            return Err(format!("unsupported peers file version {}", file.version));
        }
        let mut loaded = 0;
        for entry in file.peers {
            self.store_peer(PeerEntry {
                address: entry.address,
                port: entry.port,
                last_seen: UNIX_EPOCH + Duration::from_secs(entry.last_seen),
            });
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn save_file(&self, path: &Path) {
        let Ok(peers) = self.peers.lock() else {
            return;
        };
        let file = PeersFile {
            version: PEERS_FILE_VERSION,
            peers: peers
                .iter()
                .map(|((address, port), last_seen)| PeersFileEntry {
                    address: address.clone(),
                    port: *port,
                    last_seen: last_seen
                        .duration_since(UNIX_EPOCH)
                        .map(|since| since.as_secs())
                        .unwrap_or(0),
                })
                .collect(),
        };
        drop(peers);
        match serde_json::to_string(&file) {
            Ok(json) => {
                if let Err(err) = std::fs::write(path, json) {
                    log_warn!("failed to persist peers file: {err}");
                }
            }
            Err(err) => log_warn!("failed to encode peers file: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PeerEntry, PeerStore};
    use std::collections::HashSet;
    use std::time::{Duration, SystemTime};

    fn entry(tag: u8) -> PeerEntry {
        PeerEntry {
            address: format!("10.0.0.{tag}"),
            port: 10001,
            last_seen: SystemTime::now(),
        }
    }

    #[test]
    fn random_peers_are_distinct() {
        let store = PeerStore::new();
        for tag in 0..20u8 {
            store.store_peer(entry(tag));
        }
        let picked = store.get_random_peers(5);
        assert_eq!(picked.len(), 5);
        let unique: HashSet<_> = picked.iter().map(|peer| peer.address.clone()).collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn sampling_more_than_available_returns_all() {
        let store = PeerStore::new();
        store.store_peer(entry(1));
        assert_eq!(store.get_random_peers(10).len(), 1);
        assert!(store.get_random_peer().is_some());
    }

    #[test]
    fn storing_same_peer_twice_keeps_one() {
        let store = PeerStore::new();
        store.store_peer(entry(1));
        store.store_peer(entry(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stale_peers_are_removed() {
        let store = PeerStore::new();
        store.store_peer(entry(1));
        store.store_peer(PeerEntry {
            last_seen: SystemTime::now() - Duration::from_secs(13 * 3600),
            ..entry(2)
        });
        store.remove_stale_peers();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn file_round_trip() {
        let store = PeerStore::new();
        for tag in 0..4u8 {
            store.store_peer(entry(tag));
        }
        let path = std::env::temp_dir().join(format!("specterd-peers-{}.json", std::process::id()));
        store.save_file(&path);
        let restored = PeerStore::new();
        assert_eq!(restored.load_file(&path).unwrap(), 4);
        assert_eq!(restored.len(), 4);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_loads_empty() {
        let store = PeerStore::new();
        let path = std::path::Path::new("/nonexistent/specterd-peers.json");
        assert_eq!(store.load_file(path).unwrap(), 0);
    }
}
