//! One outbound peer session: dial, version handshake, read loop with hard
//! deadlines, and relay of scheduled liveness pings onto the wire. Each
//! connection runs as its own task and reports back to the supervisor
//! through the shared event queue.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use specterd_primitives::hash::{hash256_to_hex, sha256d, Hash256};
use specterd_wire::{
    self as wire, InventoryVector, MasternodeBroadcast, MasternodePing, PeerAddress, TxIn,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::analyzer::FormatState;
use crate::block_queue::BlockQueue;
use crate::events::{NodeEvent, PeerKey};
use crate::generator::ScheduledPing;
use crate::log::{log_debug, log_error, log_info, log_warn};
use crate::signing;

pub const STATUS_IDLE: i8 = 0;
pub const STATUS_CONNECTED: i8 = 1;
pub const STATUS_FAILED: i8 = -1;

/// Private ping queue depth; the generator's try_send drops on overflow
/// before this is ever hit, but a stalled peer is torn down at >10 buffered.
pub const PING_QUEUE_CAPACITY: usize = 16;
pub const MAX_QUEUE_BACKLOG: usize = 10;

const MAX_CONNECTION_ATTEMPTS: u32 = 10;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(60);
const CACHE_MAX_AGE_SECS: u64 = 5 * 60;
const VERSION_NONCE: u64 = 0xDEAD_BEEF;

/// Static per-network connection parameters, cloned into every spawned peer.
#[derive(Clone)]
pub struct PeerConfig {
    pub magic: [u8; 4],
    pub protocol_version: u32,
    pub user_agent: String,
    pub broadcast_listen: bool,
}

/// Supervisor-visible side of a connection: identity plus live status.
pub struct PeerHandle {
    pub address: String,
    pub port: u16,
    status: AtomicI8,
}

impl PeerHandle {
    pub fn new(address: String, port: u16) -> Self {
        Self {
            address,
            port,
            status: AtomicI8::new(STATUS_IDLE),
        }
    }

    pub fn key(&self) -> PeerKey {
        (self.address.clone(), self.port)
    }

    pub fn status(&self) -> i8 {
        self.status.load(Ordering::Relaxed)
    }

    /// Status is monotonic: once failed, a handle never reports otherwise.
    pub fn set_status(&self, status: i8) {
        let _ = self
            .status
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                if current == STATUS_FAILED {
                    None
                } else {
                    Some(status)
                }
            });
    }
}

enum Fault {
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Transient(msg) | Fault::Fatal(msg) => f.write_str(msg),
        }
    }
}

struct CachedMessage {
    command: &'static str,
    payload: Vec<u8>,
    sig_time: u64,
}

pub struct PeerConnection {
    config: PeerConfig,
    handle: Arc<PeerHandle>,
    bootstrap_hash: Option<Hash256>,
    format: Arc<FormatState>,
    block_queue: Arc<BlockQueue>,
    events: mpsc::Sender<NodeEvent>,
    inbound: mpsc::Receiver<ScheduledPing>,
    shutdown: watch::Receiver<bool>,
    cache: HashMap<Hash256, CachedMessage>,
}

impl PeerConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PeerConfig,
        handle: Arc<PeerHandle>,
        bootstrap_hash: Option<Hash256>,
        format: Arc<FormatState>,
        block_queue: Arc<BlockQueue>,
        events: mpsc::Sender<NodeEvent>,
        inbound: mpsc::Receiver<ScheduledPing>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            handle,
            bootstrap_hash,
            format,
            block_queue,
            events,
            inbound,
            shutdown,
            cache: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        let mut attempts: u32 = 0;
        loop {
            if self.over_limits(attempts) {
                return self.fail("unable to connect, closing connection").await;
            }
            if *shutdown.borrow() {
                return self.disconnect().await;
            }

            let remote = (self.handle.address.clone(), self.handle.port);
            let magic = self.config.magic;
            let dial = tokio::select! {
                result = timeout(DIAL_TIMEOUT, TcpStream::connect(remote)) => result,
                _ = shutdown.changed() => return self.disconnect().await,
            };
            let mut stream = match dial {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    log_debug!("{}: dial failed: {err}", self.handle.address);
                    attempts += 1;
                    if !backoff(&mut shutdown).await {
                        return self.disconnect().await;
                    }
                    continue;
                }
                Err(_) => {
                    log_debug!("{}: dial timed out", self.handle.address);
                    attempts += 1;
                    if !backoff(&mut shutdown).await {
                        return self.disconnect().await;
                    }
                    continue;
                }
            };

            let version = wire::build_version_payload(
                self.config.protocol_version,
                &self.config.user_agent,
                &PeerAddress {
                    ip: self
                        .handle
                        .address
                        .parse()
                        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                    port: self.handle.port,
                },
                VERSION_NONCE,
            );
            match self.send_message(&mut stream, wire::CMD_VERSION, &version).await {
                Ok(()) => {}
                Err(Fault::Fatal(reason)) => return self.fail(&reason).await,
                Err(Fault::Transient(err)) => {
                    log_debug!("{}: version send failed: {err}", self.handle.address);
                    attempts += 1;
                    if !backoff(&mut shutdown).await {
                        return self.disconnect().await;
                    }
                    continue;
                }
            }

            'session: loop {
                if self.handle.status() == STATUS_FAILED {
                    return self.disconnect().await;
                }
                if self.over_limits(attempts) {
                    return self.fail("unable to keep up, closing connection").await;
                }

                let message = tokio::select! {
                    result = timeout(READ_TIMEOUT, read_message(&mut stream, magic)) => result,
                    _ = shutdown.changed() => return self.disconnect().await,
                };
                let (command, payload) = match message {
                    // a silent peer is not worth retrying
                    Err(_) => return self.fail("read timeout, bailing").await,
                    Ok(Err(err)) => {
                        log_debug!("{}: {err}", self.handle.address);
                        attempts += 1;
                        break 'session;
                    }
                    Ok(Ok(message)) => message,
                };
                attempts = 0;
                log_debug!("{}: command {command}", self.handle.address);

                match self.handle_message(&mut stream, &command, &payload).await {
                    Ok(()) => {}
                    Err(Fault::Fatal(reason)) => return self.fail(&reason).await,
                    Err(Fault::Transient(err)) => {
                        log_debug!("{}: {err}", self.handle.address);
                        attempts += 1;
                        break 'session;
                    }
                }

                match self.drain_one_ping(&mut stream).await {
                    Ok(true) => {}
                    // queue closed: the supervisor tore this connection down
                    Ok(false) => return self.disconnect().await,
                    Err(Fault::Fatal(reason)) => return self.fail(&reason).await,
                    Err(Fault::Transient(err)) => {
                        log_debug!("{}: {err}", self.handle.address);
                        attempts += 1;
                        break 'session;
                    }
                }
            }

            attempts += 1;
            log_info!("{}: connection lost, attempting to reconnect", self.handle.address);
            if !backoff(&mut shutdown).await {
                return self.disconnect().await;
            }
        }
    }

    fn over_limits(&self, attempts: u32) -> bool {
        attempts >= MAX_CONNECTION_ATTEMPTS || self.inbound.len() > MAX_QUEUE_BACKLOG
    }

    async fn handle_message(
        &mut self,
        stream: &mut TcpStream,
        command: &str,
        payload: &[u8],
    ) -> Result<(), Fault> {
        match command {
            wire::CMD_VERSION => {
                self.send_message(stream, wire::CMD_VERACK, &[]).await?;
                self.handle.set_status(STATUS_CONNECTED);
                log_debug!("{}: sending getaddr", self.handle.address);
                self.send_message(stream, wire::CMD_GETADDR, &[]).await?;
                if let Some(anchor) = self.bootstrap_hash {
                    log_debug!("{}: sending getblocks to bootstrap", self.handle.address);
                    let payload =
                        wire::build_getblocks_payload(self.config.protocol_version, &anchor);
                    self.send_message(stream, wire::CMD_GETBLOCKS, &payload).await?;
                }
            }
            wire::CMD_PING => {
                let pong = wire::build_pong_payload(payload);
                self.send_message(stream, wire::CMD_PONG, &pong).await?;
                log_info!("{}: pong", self.handle.address);
                self.sweep_cache();
            }
            wire::CMD_INV => {
                let entries = wire::parse_inv(payload).map_err(Fault::Transient)?;
                let mut wanted = Vec::new();
                for entry in entries {
                    match entry.kind {
                        wire::MSG_BLOCK => {
                            log_debug!("new block received: {}", hash256_to_hex(&entry.hash));
                            self.emit(NodeEvent::NewBlock(entry.hash)).await?;
                        }
                        wire::MSG_MASTERNODE_BROADCAST if self.config.broadcast_listen => {
                            wanted.push(entry);
                        }
                        wire::MSG_MASTERNODE_PING if self.format.autosense() => {
                            wanted.push(entry);
                        }
                        _ => {}
                    }
                }
                if !wanted.is_empty() {
                    let payload = wire::build_getdata_payload(&wanted);
                    self.send_message(stream, wire::CMD_GETDATA, &payload).await?;
                }
            }
            wire::CMD_ADDR => {
                let addrs = wire::parse_addr(payload).map_err(Fault::Transient)?;
                for addr in addrs {
                    self.emit(NodeEvent::NewAddr(addr)).await?;
                }
            }
            wire::CMD_MNBROADCAST => match MasternodeBroadcast::decode(payload) {
                Ok(broadcast) => {
                    log_debug!(
                        "masternode broadcast detected for {}",
                        broadcast.collateral.previous_outpoint
                    );
                    self.emit(NodeEvent::NewBroadcast(Box::new(broadcast))).await?;
                }
                Err(err) => log_debug!("{}: undecodable mnb: {err}", self.handle.address),
            },
            wire::CMD_MNPING => {
                if self.format.autosense() {
                    match MasternodePing::decode(payload, false) {
                        Ok(ping) => {
                            log_debug!("masternode ping detected, sending back for analysis");
                            self.emit(NodeEvent::NewPingSample(Box::new(ping))).await?;
                        }
                        Err(err) => {
                            log_debug!("{}: undecodable mnp: {err}", self.handle.address)
                        }
                    }
                }
            }
            wire::CMD_GETDATA => {
                let requests = wire::parse_getdata(payload).map_err(Fault::Transient)?;
                self.serve_cached(stream, &requests).await?;
            }
            other => {
                log_debug!("{}: unhandled command {other}", self.handle.address);
            }
        }
        Ok(())
    }

    async fn serve_cached(
        &mut self,
        stream: &mut TcpStream,
        requests: &[InventoryVector],
    ) -> Result<(), Fault> {
        for request in requests {
            let Some(cached) = self.cache.get(&request.hash) else {
                log_debug!("hash not found - all is well");
                continue;
            };
            let command = cached.command;
            let payload = cached.payload.clone();
            self.send_message(stream, command, &payload).await?;
            log_debug!("{}: cached {command} re-sent", self.handle.address);
        }
        Ok(())
    }

    /// One non-blocking check of the private queue; never stalls the read
    /// loop. Returns false once the supervisor has closed the queue.
    async fn drain_one_ping(&mut self, stream: &mut TcpStream) -> Result<bool, Fault> {
        let ping = match self.inbound.try_recv() {
            Ok(ping) => ping,
            Err(mpsc::error::TryRecvError::Empty) => return Ok(true),
            Err(mpsc::error::TryRecvError::Disconnected) => return Ok(false),
        };
        log_debug!("relaying ping to the network for {}", ping.name);

        let Some(liveness) = self.build_liveness(&ping) else {
            return Ok(true);
        };

        if let Some(template) = &ping.broadcast_template {
            let mut broadcast = template.clone();
            broadcast.last_ping = liveness.clone();
            let hash = broadcast.get_hash();
            let inv = wire::build_inv_payload(&[InventoryVector {
                kind: wire::MSG_MASTERNODE_BROADCAST,
                hash,
            }]);
            self.send_message(stream, wire::CMD_INV, &inv).await?;
            self.cache.insert(
                hash,
                CachedMessage {
                    command: wire::CMD_MNBROADCAST,
                    payload: broadcast.serialize(),
                    sig_time: liveness.sig_time,
                },
            );
        }

        // the ping itself is always sent
        let bytes = liveness.serialize();
        let inv_hash = sha256d(&bytes);
        let inv = wire::build_inv_payload(&[InventoryVector {
            kind: wire::MSG_MASTERNODE_PING,
            hash: inv_hash,
        }]);
        self.send_message(stream, wire::CMD_INV, &inv).await?;
        self.cache.insert(
            inv_hash,
            CachedMessage {
                command: wire::CMD_MNPING,
                payload: bytes,
                sig_time: liveness.sig_time,
            },
        );
        Ok(true)
    }

    fn build_liveness(&self, ping: &ScheduledPing) -> Option<MasternodePing> {
        let Some(block_hash) = self.block_queue.get_top() else {
            log_warn!("no anchor hash available, skipping ping for {}", ping.name);
            return None;
        };
        let sig_time = ping.due_time + signing::SIG_TIME_SKEW_SECS;
        let mut liveness = MasternodePing {
            collateral: TxIn::new(ping.outpoint.clone()),
            outpoint_form: self.format.outpoint_form(),
            block_hash,
            sig_time,
            signature: Vec::new(),
            sentinel_current: false,
            sentinel_version: self.format.sentinel_version(),
            daemon_version: self.format.daemon_version(),
        };
        liveness.signature = signing::sign_ping(
            &ping.magic_message,
            &ping.outpoint,
            &liveness.collateral.signature_script,
            &block_hash,
            sig_time,
            &ping.private_key,
        );
        if liveness.signature.is_empty() {
            log_error!("empty signature for {}, not broadcasting", ping.name);
            return None;
        }
        Some(liveness)
    }

    fn sweep_cache(&mut self) {
        let now = unix_now_secs();
        self.cache
            .retain(|_, message| now.saturating_sub(message.sig_time) <= CACHE_MAX_AGE_SECS);
    }

    async fn send_message(
        &self,
        stream: &mut TcpStream,
        command: &str,
        payload: &[u8],
    ) -> Result<(), Fault> {
        let frame =
            wire::frame_message(self.config.magic, command, payload).map_err(Fault::Transient)?;
        match timeout(WRITE_TIMEOUT, stream.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Fault::Transient(err.to_string())),
            Err(_) => Err(Fault::Fatal("write timeout, bailing".to_string())),
        }
    }

    async fn fail(self, reason: &str) {
        log_debug!("{}: {reason}", self.handle.address);
        self.handle.set_status(STATUS_FAILED);
        let _ = self
            .events
            .send(NodeEvent::PeerDisconnect(self.handle.key()))
            .await;
    }

    async fn disconnect(self) {
        let _ = self
            .events
            .send(NodeEvent::PeerDisconnect(self.handle.key()))
            .await;
    }

    async fn emit(&self, event: NodeEvent) -> Result<(), Fault> {
        self.events
            .send(event)
            .await
            .map_err(|_| Fault::Fatal("event queue closed".to_string()))
    }
}

/// Fixed one-minute pause before redial; false means shutdown fired.
async fn backoff(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => true,
        _ = shutdown.changed() => false,
    }
}

async fn read_message(
    stream: &mut TcpStream,
    magic: [u8; 4],
) -> Result<(String, Vec<u8>), Fault> {
    let mut header = [0u8; wire::HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|err| Fault::Transient(err.to_string()))?;
    let frame = wire::parse_frame_header(&header, magic).map_err(Fault::Transient)?;
    let mut payload = vec![0u8; frame.payload_len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| Fault::Transient(err.to_string()))?;
    wire::verify_checksum(&frame, &payload).map_err(Fault::Transient)?;
    Ok((frame.command, payload))
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::FormatState;
    use crate::block_queue::BlockQueue;
    use specterd_primitives::outpoint::OutPoint;

    fn test_config() -> PeerConfig {
        PeerConfig {
            magic: [0xbd, 0x6b, 0x0c, 0xbf],
            protocol_version: 70208,
            user_agent: "/specterd:0.1.0/".to_string(),
            broadcast_listen: false,
        }
    }

    fn test_connection(
        address: String,
        port: u16,
        queued: usize,
    ) -> (
        PeerConnection,
        Arc<PeerHandle>,
        mpsc::Receiver<NodeEvent>,
        watch::Sender<bool>,
    ) {
        let handle = Arc::new(PeerHandle::new(address, port));
        let (events_tx, events_rx) = mpsc::channel(64);
        let (ping_tx, ping_rx) = mpsc::channel(PING_QUEUE_CAPACITY);
        for index in 0..queued {
            ping_tx
                .try_send(ScheduledPing {
                    name: format!("mn{index}"),
                    outpoint: OutPoint::default(),
                    private_key: String::new(),
                    due_time: 0,
                    magic_message: String::new(),
                    broadcast_template: None,
                })
                .unwrap();
        }
        // keep the sender alive alongside the test
        std::mem::forget(ping_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connection = PeerConnection::new(
            test_config(),
            Arc::clone(&handle),
            None,
            Arc::new(FormatState::new(false, true, 0, 0)),
            Arc::new(BlockQueue::new()),
            events_tx,
            ping_rx,
            shutdown_rx,
        );
        (connection, handle, events_rx, shutdown_tx)
    }

    #[test]
    fn status_never_leaves_failed() {
        let handle = PeerHandle::new("10.0.0.1".to_string(), 10001);
        assert_eq!(handle.status(), STATUS_IDLE);
        handle.set_status(STATUS_CONNECTED);
        assert_eq!(handle.status(), STATUS_CONNECTED);
        handle.set_status(STATUS_FAILED);
        handle.set_status(STATUS_CONNECTED);
        assert_eq!(handle.status(), STATUS_FAILED);
    }

    #[tokio::test]
    async fn overfull_queue_fails_immediately() {
        let (connection, handle, mut events, _shutdown) =
            test_connection("203.0.113.1".to_string(), 10001, MAX_QUEUE_BACKLOG + 1);
        connection.run().await;
        assert_eq!(handle.status(), STATUS_FAILED);
        match events.recv().await {
            Some(NodeEvent::PeerDisconnect(key)) => assert_eq!(key.0, "203.0.113.1"),
            _ => panic!("expected disconnect event"),
        }
    }

    #[tokio::test]
    async fn shutdown_tears_down_live_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and hold the socket open without speaking
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let (connection, handle, mut events, shutdown) =
            test_connection(addr.ip().to_string(), addr.port(), 0);
        let peer_task = tokio::spawn(connection.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.send(true).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("peer did not shut down in time");
        assert!(matches!(event, Some(NodeEvent::PeerDisconnect(_))));
        peer_task.await.unwrap();
        // clean shutdown is not a failure
        assert_ne!(handle.status(), STATUS_FAILED);
        server.abort();
    }
}
