use sha2::{Digest, Sha256};

/// Raw 32-byte hash in wire order (reversed relative to the display hex).
pub type Hash256 = [u8; 32];

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

pub fn hash256_from_hex(hex: &str) -> Result<Hash256, String> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex.len()));
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = hex_value(bytes[i * 2]).ok_or_else(|| "invalid hex digit".to_string())?;
        let low = hex_value(bytes[i * 2 + 1]).ok_or_else(|| "invalid hex digit".to_string())?;
        // display order is reversed relative to wire order
        out[31 - i] = (high << 4) | low;
    }
    Ok(out)
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + value - 10) as char,
    }
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{bytes_to_hex, hash256_from_hex, hash256_to_hex, sha256d};

    #[test]
    fn sha256d_empty_vector() {
        let digest = sha256d(b"");
        assert_eq!(
            bytes_to_hex(&digest),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn hex_round_trip_reverses_byte_order() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        hash[31] = 0x01;
        let hex = hash256_to_hex(&hash);
        assert!(hex.starts_with("01"));
        assert!(hex.ends_with("ab"));
        assert_eq!(hash256_from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(hash256_from_hex("abcd").is_err());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_err());
    }
}
