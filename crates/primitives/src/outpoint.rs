use std::fmt;

use crate::encoding::{DecodeError, Decoder, Encodable, Encoder};
use crate::hash::{hash256_to_hex, Hash256};

/// Funding reference: the transaction hash and output index that back a node
/// identity.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_fixed::<32>()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.hash);
        encoder.write_u32_le(self.index);
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash256_to_hex(&self.hash), self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::OutPoint;
    use crate::encoding::{Decoder, Encodable, Encoder};

    #[test]
    fn codec_round_trip() {
        let outpoint = OutPoint::new([0x5a; 32], 3);
        let mut encoder = Encoder::new();
        outpoint.consensus_encode(&mut encoder);
        let bytes = encoder.into_inner();
        assert_eq!(bytes.len(), 36);
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(OutPoint::consensus_decode(&mut decoder).unwrap(), outpoint);
    }

    #[test]
    fn display_is_hex_colon_index() {
        let outpoint = OutPoint::new([0u8; 32], 1);
        assert_eq!(outpoint.to_string(), format!("{}:1", "00".repeat(32)));
    }
}
