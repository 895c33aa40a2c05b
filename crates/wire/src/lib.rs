//! Wire codec for a Bitcoin-derived p2p network: 24-byte message framing and
//! the payload builders/parsers the pinger speaks, including the two custom
//! masternode commands.

pub mod masternode;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use specterd_primitives::encoding::{DecodeError, Decoder, Encoder};
use specterd_primitives::hash::{sha256d, Hash256};

pub use masternode::{MasternodeBroadcast, MasternodePing, NetService, TxIn};

pub const HEADER_LEN: usize = 24;
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_ADDR_RESULTS: usize = 1000;
pub const MAX_INV_RESULTS: usize = 50_000;

/// Final txin sequence value; a legacy-form liveness collateral always
/// carries it, which is what the fallback decoder keys on.
pub const FINAL_SEQUENCE: u32 = 0xffff_ffff;

pub const CMD_VERSION: &str = "version";
pub const CMD_VERACK: &str = "verack";
pub const CMD_PING: &str = "ping";
pub const CMD_PONG: &str = "pong";
pub const CMD_GETADDR: &str = "getaddr";
pub const CMD_ADDR: &str = "addr";
pub const CMD_INV: &str = "inv";
pub const CMD_GETDATA: &str = "getdata";
pub const CMD_GETBLOCKS: &str = "getblocks";
pub const CMD_MNPING: &str = "mnp";
pub const CMD_MNBROADCAST: &str = "mnb";

/// Inventory type tags used on this family of networks.
pub const MSG_BLOCK: u32 = 2;
pub const MSG_MASTERNODE_BROADCAST: u32 = 14;
pub const MSG_MASTERNODE_PING: u32 = 15;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub kind: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct VersionInfo {
    pub protocol_version: i32,
    pub user_agent: String,
    pub start_height: i32,
}

/// Frames a payload: magic, NUL-padded command, LE length, sha256d checksum.
pub fn frame_message(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, String> {
    let cmd = command.as_bytes();
    if cmd.len() > 12 {
        return Err("command too long".to_string());
    }
    let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
    message.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    message.extend_from_slice(&command_bytes);
    message.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    message.extend_from_slice(&checksum[..4]);
    message.extend_from_slice(payload);
    Ok(message)
}

/// Parsed frame header: command plus expected payload length and checksum.
pub struct FrameHeader {
    pub command: String,
    pub payload_len: usize,
    pub checksum: [u8; 4],
}

pub fn parse_frame_header(header: &[u8; HEADER_LEN], magic: [u8; 4]) -> Result<FrameHeader, String> {
    if header[..4] != magic {
        return Err("invalid magic".to_string());
    }
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let payload_len =
        u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err("payload too large".to_string());
    }
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&header[20..24]);
    Ok(FrameHeader {
        command,
        payload_len,
        checksum,
    })
}

pub fn verify_checksum(header: &FrameHeader, payload: &[u8]) -> Result<(), String> {
    let calc = sha256d(payload);
    if header.checksum != calc[..4] {
        return Err("invalid payload checksum".to_string());
    }
    Ok(())
}

pub fn build_version_payload(
    protocol_version: u32,
    user_agent: &str,
    remote: &PeerAddress,
    nonce: u64,
) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(protocol_version as i32);
    encoder.write_u64_le(0); // services
    encoder.write_i64_le(unix_time_now());
    write_net_addr(&mut encoder, 0, remote);
    write_net_addr(
        &mut encoder,
        0,
        &PeerAddress {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        },
    );
    encoder.write_u64_le(nonce);
    encoder.write_var_str(user_agent);
    encoder.write_i32_le(0); // last block
    encoder.write_u8(0); // relay disabled
    encoder.into_inner()
}

pub fn parse_version(payload: &[u8]) -> Result<VersionInfo, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let protocol_version = decoder.read_i32_le()?;
    let _services = decoder.read_u64_le()?;
    let _timestamp = decoder.read_i64_le()?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let _nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    Ok(VersionInfo {
        protocol_version,
        user_agent,
        start_height,
    })
}

pub fn build_ping_payload(nonce: u64) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u64_le(nonce);
    encoder.into_inner()
}

/// Pong echoes the ping payload byte for byte (nonce-less peers send none).
pub fn build_pong_payload(ping_payload: &[u8]) -> Vec<u8> {
    ping_payload.to_vec()
}

pub fn build_inv_payload(entries: &[InventoryVector]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(entries.len() as u64);
    for entry in entries {
        encoder.write_u32_le(entry.kind);
        encoder.write_hash_le(&entry.hash);
    }
    encoder.into_inner()
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InventoryVector>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "inv count too large".to_string())?;
    if count > MAX_INV_RESULTS {
        return Err("inv count too large".to_string());
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let hash = decoder.read_fixed::<32>().map_err(|err| err.to_string())?;
        entries.push(InventoryVector { kind, hash });
    }
    Ok(entries)
}

/// getdata shares the inventory layout.
pub fn build_getdata_payload(entries: &[InventoryVector]) -> Vec<u8> {
    build_inv_payload(entries)
}

pub fn parse_getdata(payload: &[u8]) -> Result<Vec<InventoryVector>, String> {
    parse_inv(payload)
}

pub fn build_getblocks_payload(protocol_version: u32, locator: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(protocol_version);
    encoder.write_varint(1);
    encoder.write_hash_le(locator);
    encoder.write_hash_le(&[0u8; 32]); // stop hash: as many as the peer allows
    encoder.into_inner()
}

pub fn parse_addr(payload: &[u8]) -> Result<Vec<PeerAddress>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "addr count too large".to_string())?;
    if count > MAX_ADDR_RESULTS {
        return Err("addr count too large".to_string());
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let _time = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
        let ip_bytes = decoder.read_fixed::<16>().map_err(|err| err.to_string())?;
        let port = decoder.read_u16_be().map_err(|err| err.to_string())?;
        if port == 0 {
            continue;
        }
        let ip6 = Ipv6Addr::from(ip_bytes);
        let ip = if let Some(ip4) = ip6.to_ipv4_mapped() {
            IpAddr::V4(ip4)
        } else {
            IpAddr::V6(ip6)
        };
        if ip.is_unspecified() || ip.is_loopback() {
            continue;
        }
        addrs.push(PeerAddress { ip, port });
    }
    Ok(addrs)
}

fn write_net_addr(encoder: &mut Encoder, services: u64, addr: &PeerAddress) {
    encoder.write_u64_le(services);
    let ip6 = match addr.ip {
        IpAddr::V4(ip4) => ip4.to_ipv6_mapped(),
        IpAddr::V6(ip6) => ip6,
    };
    encoder.write_bytes(&ip6.octets());
    encoder.write_u16_be(addr.port);
}

fn read_net_addr(decoder: &mut Decoder<'_>) -> Result<(), DecodeError> {
    let _services = decoder.read_u64_le()?;
    let _ip = decoder.read_fixed::<16>()?;
    let _port = decoder.read_u16_be()?;
    Ok(())
}

fn unix_time_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
