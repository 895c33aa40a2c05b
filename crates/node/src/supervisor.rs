//! Owns the shared components and the peer pool. Every structured event from
//! every connection funnels through one consumer here, which is the only
//! place the block queue, broadcast store, analyzer, and peer store are
//! mutated from network input. Component sweepers run as separate timers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use specterd_primitives::hash::Hash256;
use tokio::sync::{mpsc, watch};

use crate::analyzer::{FormatState, PingAnalyzer};
use crate::block_queue::BlockQueue;
use crate::broadcast_store::BroadcastStore;
use crate::events::{NodeEvent, PeerKey};
use crate::generator::{self, ScheduledPing};
use crate::log::{log_debug, log_error, log_info};
use crate::peer::{
    PeerConfig, PeerConnection, PeerHandle, MAX_QUEUE_BACKLOG, PING_QUEUE_CAPACITY, STATUS_CONNECTED,
    STATUS_FAILED,
};
use crate::peer_store::{PeerEntry, PeerStore};

pub const EVENT_QUEUE_CAPACITY: usize = 1024;

const AUTOSENSE_POLL: Duration = Duration::from_secs(10);
const GENERATION_WARMUP: Duration = Duration::from_secs(30);
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const PEERS_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

pub struct SupervisorConfig {
    pub target_connections: usize,
    pub peer_config: PeerConfig,
    pub magic_message: String,
    pub masternode_conf: PathBuf,
    pub peers_file: PathBuf,
}

struct PeerSlot {
    handle: Arc<PeerHandle>,
    sender: mpsc::Sender<ScheduledPing>,
}

impl PeerSlot {
    fn backlog(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    pub block_queue: Arc<BlockQueue>,
    pub broadcast_store: Arc<BroadcastStore>,
    pub analyzer: Arc<PingAnalyzer>,
    pub format: Arc<FormatState>,
    pub peer_store: Arc<PeerStore>,
    events_tx: mpsc::Sender<NodeEvent>,
    shutdown: watch::Receiver<bool>,
    peers: Mutex<HashMap<PeerKey, PeerSlot>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        analyzer: Arc<PingAnalyzer>,
        format: Arc<FormatState>,
        peer_store: Arc<PeerStore>,
        events_tx: mpsc::Sender<NodeEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            block_queue: Arc::new(BlockQueue::new()),
            broadcast_store: Arc::new(BroadcastStore::new()),
            analyzer,
            format,
            peer_store,
            events_tx,
            shutdown,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Dials the initial pool against random peer-store entries, handing each
    /// the bootstrap anchor.
    pub fn spawn_initial_peers(&self, bootstrap_hash: Option<Hash256>) {
        let entries = self
            .peer_store
            .get_random_peers(self.config.target_connections);
        for entry in entries {
            self.spawn_peer(entry, bootstrap_hash);
        }
    }

    fn spawn_peer(&self, entry: PeerEntry, bootstrap_hash: Option<Hash256>) {
        let handle = Arc::new(PeerHandle::new(entry.address, entry.port));
        let (ping_tx, ping_rx) = mpsc::channel(PING_QUEUE_CAPACITY);
        let connection = PeerConnection::new(
            self.config.peer_config.clone(),
            Arc::clone(&handle),
            bootstrap_hash,
            Arc::clone(&self.format),
            Arc::clone(&self.block_queue),
            self.events_tx.clone(),
            ping_rx,
            self.shutdown.clone(),
        );
        log_debug!("starting new peer {}:{}", handle.address, handle.port);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(
                handle.key(),
                PeerSlot {
                    handle: Arc::clone(&handle),
                    sender: ping_tx,
                },
            );
        }
        tokio::spawn(connection.run());
    }

    /// Tears down failed or backlogged connections and tops the pool back up
    /// to the target. Replacements never get a bootstrap anchor; the initial
    /// peers already pulled any history worth having.
    pub fn maintain_pool(&self) {
        let mut to_spawn = 0usize;
        {
            let Ok(mut peers) = self.peers.lock() else {
                return;
            };
            peers.retain(|key, slot| {
                let keep = slot.handle.status() != STATUS_FAILED
                    && slot.backlog() <= MAX_QUEUE_BACKLOG;
                if !keep {
                    // dropping the slot closes the private queue
                    log_debug!("dropping peer {}:{}", key.0, key.1);
                }
                keep
            });
            if peers.len() < self.config.target_connections {
                to_spawn = self.config.target_connections - peers.len();
            }
        }
        for _ in 0..to_spawn {
            let Some(entry) = self.pick_fresh_peer() else {
                log_error!("peer store exhausted, cannot replace connection");
                return;
            };
            self.spawn_peer(entry, None);
        }
    }

    /// A random store entry not already reserved by a live connection.
    fn pick_fresh_peer(&self) -> Option<PeerEntry> {
        let Ok(peers) = self.peers.lock() else {
            return None;
        };
        let candidates = self.peer_store.get_random_peers(self.peer_store.len());
        candidates
            .into_iter()
            .find(|entry| !peers.contains_key(&(entry.address.clone(), entry.port)))
    }

    /// Single consumer of the shared event queue.
    pub async fn run_event_loop(self: Arc<Self>, mut events: mpsc::Receiver<NodeEvent>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => return,
            };
            let Some(event) = event else { return };
            match event {
                NodeEvent::NewBlock(hash) => self.block_queue.add_hash(hash),
                NodeEvent::NewAddr(addr) => self.peer_store.store_peer(PeerEntry {
                    address: addr.ip.to_string(),
                    port: addr.port,
                    last_seen: SystemTime::now(),
                }),
                NodeEvent::NewBroadcast(broadcast) => self.broadcast_store.store(*broadcast),
                NodeEvent::NewPingSample(ping) => self.process_ping_sample(&ping),
                NodeEvent::PeerDisconnect(key) => {
                    log_debug!("handled peer disconnection for {}", key.0);
                    self.maintain_pool();
                }
            }
        }
    }

    fn process_ping_sample(&self, ping: &specterd_wire::MasternodePing) {
        if !self.format.autosense() {
            // consensus is final; late samples change nothing
            return;
        }
        log_debug!("analyzing ping sample");
        if self.analyzer.observe(ping) {
            let (outpoint_form, sentinel_version, daemon_version) = self.analyzer.resolve();
            self.format.adopt(outpoint_form, sentinel_version, daemon_version);
            log_info!("-------------------------");
            log_info!("--- consensus reached ---");
            log_info!("-------------------------");
            log_info!(
                "outpoint form {outpoint_form}, sentinel version {sentinel_version}, daemon version {daemon_version}"
            );
        }
    }

    /// Withholds ping generation until autosense resolves, then runs the
    /// ten-minute cycle: inspect the pool, read the schedule, pace each ping
    /// out to the surviving connections.
    pub async fn run_ping_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        while self.format.autosense() {
            log_info!("waiting on autosense to complete");
            tokio::select! {
                _ = tokio::time::sleep(AUTOSENSE_POLL) => {}
                _ = shutdown.changed() => return,
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(GENERATION_WARMUP) => {}
            _ = shutdown.changed() => return,
        }

        loop {
            let cycle_start = Instant::now();
            self.maintain_pool();

            match generator::load_schedule(
                &self.config.masternode_conf,
                &self.config.magic_message,
                &self.broadcast_store,
            ) {
                Ok(pings) => {
                    if !self.fan_out(pings, &mut shutdown).await {
                        return;
                    }
                }
                Err(err) => log_error!("{err}"),
            }

            let cycle = Duration::from_secs(generator::CYCLE_SECS);
            let elapsed = cycle_start.elapsed();
            if elapsed < cycle {
                tokio::select! {
                    _ = tokio::time::sleep(cycle - elapsed) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }

    /// Paces each scheduled ping to its due time, then copies it into every
    /// connected peer's private queue. Returns false on shutdown.
    async fn fan_out(
        &self,
        pings: Vec<ScheduledPing>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        for ping in pings {
            log_info!("generating a ping for {}", ping.name);
            let wait = ping.wait_from(generator::unix_now().max(0) as u64);
            if !wait.is_zero() {
                log_info!("sleeping {}s before {}", wait.as_secs(), ping.name);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => return false,
                }
            }
            let senders: Vec<mpsc::Sender<ScheduledPing>> = {
                let Ok(peers) = self.peers.lock() else {
                    return true;
                };
                peers
                    .values()
                    .filter(|slot| slot.handle.status() == STATUS_CONNECTED)
                    .map(|slot| slot.sender.clone())
                    .collect()
            };
            for sender in senders {
                // full or closed queues drop the copy; the peer pays for it
                // at the next pool inspection
                if sender.try_send(ping.clone()).is_ok() {
                    log_debug!("relayed ping {}", ping.name);
                }
            }
        }
        true
    }

    /// Periodic maintenance timers for the owned components.
    pub fn spawn_sweepers(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = supervisor.shutdown.clone();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(ORPHAN_SWEEP_INTERVAL) => {
                        supervisor.block_queue.sweep_orphans()
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = supervisor.shutdown.clone();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(STORE_SWEEP_INTERVAL) => {
                        supervisor.broadcast_store.sweep();
                        supervisor.peer_store.remove_stale_peers();
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = supervisor.shutdown.clone();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PEERS_PERSIST_INTERVAL) => {
                        supervisor.peer_store.save_file(&supervisor.config.peers_file)
                    }
                    _ = shutdown.changed() => {
                        supervisor.peer_store.save_file(&supervisor.config.peers_file);
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor(target: usize) -> (Arc<Supervisor>, mpsc::Receiver<NodeEvent>, watch::Sender<bool>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::new(
            SupervisorConfig {
                target_connections: target,
                peer_config: PeerConfig {
                    magic: [1, 2, 3, 4],
                    protocol_version: 70208,
                    user_agent: "/specterd:0.1.0/".to_string(),
                    broadcast_listen: false,
                },
                magic_message: "Test Signed Message:\n".to_string(),
                masternode_conf: PathBuf::from("masternode.txt"),
                peers_file: std::env::temp_dir().join(format!(
                    "specterd-sup-peers-{}.json",
                    std::process::id()
                )),
            },
            Arc::new(PingAnalyzer::new(10)),
            Arc::new(FormatState::new(true, false, 0, 0)),
            Arc::new(PeerStore::new()),
            events_tx,
            shutdown_rx,
        );
        (Arc::new(supervisor), events_rx, shutdown_tx)
    }

    fn slot_with_backlog(backlog: usize) -> (PeerSlot, Arc<PeerHandle>) {
        let handle = Arc::new(PeerHandle::new("198.51.100.9".to_string(), 10001));
        handle.set_status(STATUS_CONNECTED);
        let (sender, receiver) = mpsc::channel(PING_QUEUE_CAPACITY);
        for index in 0..backlog {
            sender
                .try_send(ScheduledPing {
                    name: format!("mn{index}"),
                    outpoint: Default::default(),
                    private_key: String::new(),
                    due_time: 0,
                    magic_message: String::new(),
                    broadcast_template: None,
                })
                .unwrap();
        }
        std::mem::forget(receiver);
        (PeerSlot { handle: Arc::clone(&handle), sender }, handle)
    }

    #[tokio::test]
    async fn backlogged_connected_peer_is_torn_down() {
        let (supervisor, _events, _shutdown) = test_supervisor(0);
        let (slot, handle) = slot_with_backlog(MAX_QUEUE_BACKLOG + 1);
        supervisor
            .peers
            .lock()
            .unwrap()
            .insert(handle.key(), slot);
        assert_eq!(handle.status(), STATUS_CONNECTED);
        supervisor.maintain_pool();
        assert!(supervisor.peers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn healthy_connected_peer_survives_inspection() {
        let (supervisor, _events, _shutdown) = test_supervisor(0);
        let (slot, handle) = slot_with_backlog(MAX_QUEUE_BACKLOG);
        supervisor
            .peers
            .lock()
            .unwrap()
            .insert(handle.key(), slot);
        supervisor.maintain_pool();
        assert_eq!(supervisor.peers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_peer_is_dropped() {
        let (supervisor, _events, _shutdown) = test_supervisor(0);
        let (slot, handle) = slot_with_backlog(0);
        handle.set_status(STATUS_FAILED);
        supervisor
            .peers
            .lock()
            .unwrap()
            .insert(handle.key(), slot);
        supervisor.maintain_pool();
        assert!(supervisor.peers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn consensus_freezes_format_once() {
        let (supervisor, _events, _shutdown) = test_supervisor(0);
        use specterd_primitives::outpoint::OutPoint;
        use specterd_wire::{MasternodePing, TxIn};
        for tag in 0..=10u8 {
            let ping = MasternodePing {
                collateral: TxIn::new(OutPoint::new([tag; 32], 0)),
                outpoint_form: true,
                sig_time: 1_558_000_000 + tag as u64,
                sentinel_version: 5,
                ..MasternodePing::default()
            };
            supervisor.process_ping_sample(&ping);
        }
        assert!(!supervisor.format.autosense());
        assert!(supervisor.format.outpoint_form());
        assert_eq!(supervisor.format.sentinel_version(), 5);
        // a late adversarial sample cannot force a re-vote
        let late = MasternodePing {
            collateral: TxIn::new(OutPoint::new([0xff; 32], 0)),
            outpoint_form: false,
            sig_time: 1_558_999_999,
            sentinel_version: 9,
            ..MasternodePing::default()
        };
        let count_before = supervisor.analyzer.sample_count();
        supervisor.process_ping_sample(&late);
        assert_eq!(supervisor.analyzer.sample_count(), count_before);
        assert!(supervisor.format.outpoint_form());
    }
}
