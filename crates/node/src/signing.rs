//! Builds the canonical signed byte string for a liveness message and
//! produces the compact recoverable signature peers expect. The message
//! layout is bit-exact: two length-prefixed strings, double-hashed.

use secp256k1::{Message, Secp256k1, SecretKey};
use specterd_primitives::encoding::Encoder;
use specterd_primitives::hash::{bytes_to_hex, hash256_to_hex, sha256d, Hash256};
use specterd_primitives::outpoint::OutPoint;
use specterd_primitives::wif::wif_to_secret_key;

use crate::log::log_warn;

/// Fixed skew added to the scheduled due time; keeps the signature
/// deterministic for a given schedule and anchor.
pub const SIG_TIME_SKEW_SECS: u64 = 3;

/// Double-sha256 digest of the canonical liveness byte string.
pub fn ping_message_digest(
    magic_message: &str,
    outpoint: &OutPoint,
    signature_script: &[u8],
    block_hash: &Hash256,
    sig_time: u64,
) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_var_str(magic_message);
    let description = format!(
        "CTxIn(COutPoint({}, {}), scriptSig={}){}{}",
        hash256_to_hex(&outpoint.hash),
        outpoint.index,
        bytes_to_hex(signature_script),
        hash256_to_hex(block_hash),
        sig_time,
    );
    encoder.write_var_str(&description);
    sha256d(&encoder.into_inner())
}

/// Signs a liveness message. Bad key material or a signing failure is logged
/// and yields an empty signature; callers must not broadcast one.
pub fn sign_ping(
    magic_message: &str,
    outpoint: &OutPoint,
    signature_script: &[u8],
    block_hash: &Hash256,
    sig_time: u64,
    private_key_wif: &str,
) -> Vec<u8> {
    let secret = match wif_to_secret_key(private_key_wif) {
        Ok((secret, _compressed)) => secret,
        Err(err) => {
            log_warn!("failed to decode private key: {err}");
            return Vec::new();
        }
    };
    let secret_key = match SecretKey::from_slice(&secret) {
        Ok(secret_key) => secret_key,
        Err(err) => {
            log_warn!("invalid private key material: {err}");
            return Vec::new();
        }
    };

    let digest = ping_message_digest(magic_message, outpoint, signature_script, block_hash, sig_time);
    let message = Message::from_digest(digest);
    let secp = Secp256k1::signing_only();
    let signature = secp.sign_ecdsa_recoverable(&message, &secret_key);
    let (recovery_id, compact) = signature.serialize_compact();

    // header byte 27 + recovery id: the uncompressed-key compact form
    let mut out = Vec::with_capacity(65);
    out.push(27 + recovery_id.to_i32() as u8);
    out.extend_from_slice(&compact);
    out
}

#[cfg(test)]
mod tests {
    use super::{ping_message_digest, sign_ping};
    use specterd_primitives::outpoint::OutPoint;
    use specterd_primitives::wif::secret_key_to_wif;

    const MAGIC_MESSAGE: &str = "DarkCoin Signed Message:\n";

    fn fixture() -> (OutPoint, [u8; 32], u64, String) {
        let outpoint = OutPoint::new([0x44; 32], 1);
        let block_hash = [0x99u8; 32];
        let sig_time = 1_558_000_003u64;
        let wif = secret_key_to_wif(&[0x2c; 32], 0x80, false);
        (outpoint, block_hash, sig_time, wif)
    }

    #[test]
    fn signature_is_deterministic() {
        let (outpoint, block_hash, sig_time, wif) = fixture();
        let first = sign_ping(MAGIC_MESSAGE, &outpoint, &[], &block_hash, sig_time, &wif);
        let second = sign_ping(MAGIC_MESSAGE, &outpoint, &[], &block_hash, sig_time, &wif);
        assert_eq!(first.len(), 65);
        assert_eq!(first, second);
    }

    #[test]
    fn signature_varies_with_inputs() {
        let (outpoint, block_hash, sig_time, wif) = fixture();
        let base = sign_ping(MAGIC_MESSAGE, &outpoint, &[], &block_hash, sig_time, &wif);
        let other = sign_ping(MAGIC_MESSAGE, &outpoint, &[], &block_hash, sig_time + 1, &wif);
        assert_ne!(base, other);
    }

    #[test]
    fn bad_key_yields_empty_signature() {
        let (outpoint, block_hash, sig_time, _) = fixture();
        let signature = sign_ping(MAGIC_MESSAGE, &outpoint, &[], &block_hash, sig_time, "not-a-wif");
        assert!(signature.is_empty());
    }

    #[test]
    fn digest_covers_every_field() {
        let (outpoint, block_hash, sig_time, _) = fixture();
        let base = ping_message_digest(MAGIC_MESSAGE, &outpoint, &[], &block_hash, sig_time);
        assert_ne!(
            base,
            ping_message_digest("Other Signed Message:\n", &outpoint, &[], &block_hash, sig_time)
        );
        assert_ne!(
            base,
            ping_message_digest(MAGIC_MESSAGE, &OutPoint::new([0x44; 32], 2), &[], &block_hash, sig_time)
        );
        assert_ne!(
            base,
            ping_message_digest(MAGIC_MESSAGE, &outpoint, &[0x51], &block_hash, sig_time)
        );
        assert_ne!(
            base,
            ping_message_digest(MAGIC_MESSAGE, &outpoint, &[], &[0x9au8; 32], sig_time)
        );
    }
}
