//! The two custom masternode messages: `mnp` (liveness) and `mnb`
//! (broadcast). Liveness collaterals exist in two historical encodings, a
//! full inline txin and a bare outpoint; the decoder detects which one a peer
//! sent and records it. Fields past the mandatory signature are read
//! best-effort: older peer software simply stops emitting them, so a parse
//! failure there ends field population instead of failing the message.

use specterd_primitives::encoding::{DecodeError, Decoder, Encodable, Encoder};
use specterd_primitives::hash::{sha256d, Hash256};
use specterd_primitives::outpoint::OutPoint;

use crate::FINAL_SEQUENCE;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub previous_outpoint: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(previous_outpoint: OutPoint) -> Self {
        Self {
            previous_outpoint,
            signature_script: Vec::new(),
            sequence: FINAL_SEQUENCE,
        }
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let previous_outpoint = OutPoint::consensus_decode(decoder)?;
        let signature_script = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            previous_outpoint,
            signature_script,
            sequence,
        })
    }
}

impl Default for TxIn {
    fn default() -> Self {
        Self::new(OutPoint::default())
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.previous_outpoint.consensus_encode(encoder);
        encoder.write_var_bytes(&self.signature_script);
        encoder.write_u32_le(self.sequence);
    }
}

/// Network service endpoint embedded in a broadcast: 16-byte IP plus a
/// big-endian port.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetService {
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetService {
    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let ip = decoder.read_fixed::<16>()?;
        let port = decoder.read_u16_be()?;
        Ok(Self { ip, port })
    }
}

impl Encodable for NetService {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.ip);
        encoder.write_u16_be(self.port);
    }
}

/// Wire `mnp`: a signed, timestamped proof that a node identity is online,
/// anchored to a recent block hash.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MasternodePing {
    pub collateral: TxIn,
    pub outpoint_form: bool,
    pub block_hash: Hash256,
    pub sig_time: u64,
    pub signature: Vec<u8>,
    pub sentinel_current: bool,
    pub sentinel_version: u32,
    pub daemon_version: u32,
}

impl MasternodePing {
    /// Decodes starting from the collateral. `outpoint_form_hint` seeds the
    /// form detection; whichever encoding actually parses wins and is
    /// reflected in the returned message.
    pub fn consensus_decode(
        decoder: &mut Decoder<'_>,
        outpoint_form_hint: bool,
    ) -> Result<Self, DecodeError> {
        Self::decode_inner(decoder, outpoint_form_hint, true)
    }

    fn decode_inner(
        decoder: &mut Decoder<'_>,
        outpoint_form_hint: bool,
        allow_retry: bool,
    ) -> Result<Self, DecodeError> {
        let start = decoder.position();
        let mut outpoint_form = outpoint_form_hint;
        let mut collateral = TxIn::default();

        if !outpoint_form {
            match TxIn::consensus_decode(decoder) {
                Ok(txin) if txin.sequence == FINAL_SEQUENCE => collateral = txin,
                _ => {
                    // not a legacy inline input, re-read as a bare outpoint
                    outpoint_form = true;
                    decoder.rewind(start);
                }
            }
        }
        if outpoint_form {
            collateral = TxIn::new(OutPoint::consensus_decode(decoder)?);
        }

        let block_hash = decoder.read_fixed::<32>()?;
        let sig_time = decoder.read_u64_le()?;
        let signature = match decoder.read_var_bytes() {
            Ok(signature) => signature,
            Err(err) => {
                // a legacy parse can succeed on outpoint-form bytes and leave
                // the reader misaligned; one retry in the other form settles it
                if !outpoint_form && allow_retry {
                    decoder.rewind(start);
                    return Self::decode_inner(decoder, true, false);
                }
                return Err(err);
            }
        };

        let mut msg = Self {
            collateral,
            outpoint_form,
            block_hash,
            sig_time,
            signature,
            ..Self::default()
        };

        // trailing tolerance: stop populating at the first short read
        if let Ok(flag) = decoder.read_u8() {
            msg.sentinel_current = flag != 0;
            if let Ok(sentinel_version) = decoder.read_u32_le() {
                msg.sentinel_version = sentinel_version;
                if let Ok(daemon_version) = decoder.read_u32_le() {
                    msg.daemon_version = daemon_version;
                }
            }
        }

        Ok(msg)
    }

    pub fn decode(payload: &[u8], outpoint_form_hint: bool) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        Self::consensus_decode(&mut decoder, outpoint_form_hint)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    /// Relay identity: hashes the signature time and the collateral
    /// reference, so the same ping re-relayed by many peers dedupes.
    pub fn get_hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.sig_time);
        encoder.write_var_str(&self.collateral.previous_outpoint.to_string());
        sha256d(&encoder.into_inner())
    }
}

impl Encodable for MasternodePing {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        if self.outpoint_form {
            self.collateral.previous_outpoint.consensus_encode(encoder);
        } else {
            self.collateral.consensus_encode(encoder);
        }
        encoder.write_hash_le(&self.block_hash);
        encoder.write_u64_le(self.sig_time);
        encoder.write_var_bytes(&self.signature);
        if self.sentinel_version > 0 {
            encoder.write_u8(1);
            encoder.write_u32_le(self.sentinel_version);
            encoder.write_u32_le(self.daemon_version);
        }
    }
}

/// Wire `mnb`: a node identity's full announcement record with its latest
/// liveness ping embedded.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MasternodeBroadcast {
    pub collateral: TxIn,
    pub addr: NetService,
    pub collateral_pubkey: Vec<u8>,
    pub operator_pubkey: Vec<u8>,
    pub signature: Vec<u8>,
    pub sig_time: u64,
    pub protocol_version: u32,
    pub last_ping: MasternodePing,
    pub last_dsq: u64,
}

impl MasternodeBroadcast {
    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let collateral = TxIn::consensus_decode(decoder)?;
        let addr = NetService::consensus_decode(decoder)?;
        let collateral_pubkey = decoder.read_var_bytes()?;
        let operator_pubkey = decoder.read_var_bytes()?;
        let signature = decoder.read_var_bytes()?;
        let sig_time = decoder.read_u64_le()?;
        let protocol_version = decoder.read_u32_le()?;
        // embedded ping and the legacy trailing counter are both tolerated:
        // peers running older software truncate here
        let last_ping = MasternodePing::consensus_decode(decoder, false).unwrap_or_default();
        let last_dsq = decoder.read_u64_le().unwrap_or(0);
        Ok(Self {
            collateral,
            addr,
            collateral_pubkey,
            operator_pubkey,
            signature,
            sig_time,
            protocol_version,
            last_ping,
            last_dsq,
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        Self::consensus_decode(&mut decoder)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn get_hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.sig_time);
        encoder.write_var_bytes(&self.collateral_pubkey);
        sha256d(&encoder.into_inner())
    }
}

impl Encodable for MasternodeBroadcast {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.collateral.consensus_encode(encoder);
        self.addr.consensus_encode(encoder);
        encoder.write_var_bytes(&self.collateral_pubkey);
        encoder.write_var_bytes(&self.operator_pubkey);
        encoder.write_var_bytes(&self.signature);
        encoder.write_u64_le(self.sig_time);
        encoder.write_u32_le(self.protocol_version);
        self.last_ping.consensus_encode(encoder);
        encoder.write_u64_le(self.last_dsq);
    }
}

#[cfg(test)]
mod tests {
    use super::{MasternodeBroadcast, MasternodePing, NetService, TxIn};
    use specterd_primitives::outpoint::OutPoint;

    fn sample_ping(outpoint_form: bool) -> MasternodePing {
        MasternodePing {
            collateral: TxIn::new(OutPoint::new([0x5a; 32], 1)),
            outpoint_form,
            block_hash: [0x33; 32],
            sig_time: 1_558_000_003,
            signature: vec![0x1f; 65],
            sentinel_current: true,
            sentinel_version: 0x0001_0200,
            daemon_version: 0x0101_0000,
        }
    }

    #[test]
    fn outpoint_form_round_trip() {
        let ping = sample_ping(true);
        let decoded = MasternodePing::decode(&ping.serialize(), false).unwrap();
        assert!(decoded.outpoint_form);
        assert_eq!(decoded.collateral.previous_outpoint, ping.collateral.previous_outpoint);
        assert_eq!(decoded.sig_time, ping.sig_time);
        assert_eq!(decoded.signature, ping.signature);
        assert_eq!(decoded.block_hash, ping.block_hash);
        assert_eq!(decoded.sentinel_version, ping.sentinel_version);
        assert_eq!(decoded.daemon_version, ping.daemon_version);
    }

    #[test]
    fn legacy_form_round_trip_keeps_flag_clear() {
        let ping = sample_ping(false);
        let decoded = MasternodePing::decode(&ping.serialize(), false).unwrap();
        assert!(!decoded.outpoint_form);
        assert_eq!(decoded, ping);
    }

    #[test]
    fn outpoint_hint_skips_legacy_attempt() {
        let ping = sample_ping(true);
        let decoded = MasternodePing::decode(&ping.serialize(), true).unwrap();
        assert!(decoded.outpoint_form);
        assert_eq!(decoded.sig_time, ping.sig_time);
    }

    #[test]
    fn missing_trailing_fields_default() {
        let mut ping = sample_ping(true);
        ping.sentinel_version = 0;
        ping.daemon_version = 0;
        let decoded = MasternodePing::decode(&ping.serialize(), false).unwrap();
        assert_eq!(decoded.sentinel_version, 0);
        assert_eq!(decoded.daemon_version, 0);
        assert!(!decoded.sentinel_current);
    }

    #[test]
    fn truncated_trailing_fields_are_swallowed() {
        let ping = sample_ping(true);
        let mut bytes = ping.serialize();
        // chop the daemon version off the tail
        bytes.truncate(bytes.len() - 4);
        let decoded = MasternodePing::decode(&bytes, false).unwrap();
        assert_eq!(decoded.sentinel_version, ping.sentinel_version);
        assert_eq!(decoded.daemon_version, 0);
        assert_eq!(decoded.signature, ping.signature);
    }

    #[test]
    fn truncated_signature_fails() {
        let ping = sample_ping(true);
        let mut bytes = ping.serialize();
        bytes.truncate(36 + 32 + 8 + 2);
        assert!(MasternodePing::decode(&bytes, true).is_err());
    }

    #[test]
    fn relay_hash_tracks_identity() {
        let ping = sample_ping(true);
        let mut other = sample_ping(false);
        assert_eq!(ping.get_hash(), other.get_hash());
        other.sig_time += 1;
        assert_ne!(ping.get_hash(), other.get_hash());
    }

    fn sample_broadcast() -> MasternodeBroadcast {
        MasternodeBroadcast {
            collateral: TxIn::new(OutPoint::new([0x5a; 32], 1)),
            addr: NetService {
                ip: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 7],
                port: 10001,
            },
            collateral_pubkey: vec![0x02; 33],
            operator_pubkey: vec![0x03; 33],
            signature: vec![0x30; 71],
            sig_time: 1_558_000_000,
            protocol_version: 70208,
            last_ping: sample_ping(false),
            last_dsq: 9,
        }
    }

    #[test]
    fn broadcast_round_trip() {
        let mnb = sample_broadcast();
        let decoded = MasternodeBroadcast::decode(&mnb.serialize()).unwrap();
        assert_eq!(decoded, mnb);
    }

    #[test]
    fn broadcast_without_trailing_counter_decodes() {
        let mnb = sample_broadcast();
        let mut bytes = mnb.serialize();
        bytes.truncate(bytes.len() - 8);
        let decoded = MasternodeBroadcast::decode(&bytes).unwrap();
        assert_eq!(decoded.last_dsq, 0);
        assert_eq!(decoded.last_ping, mnb.last_ping);
        assert_eq!(decoded.protocol_version, mnb.protocol_version);
    }
}
