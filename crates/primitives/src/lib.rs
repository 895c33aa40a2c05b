//! Byte-level primitives shared by the wire codec and the daemon: hashing,
//! consensus-style encoding, outpoints, and WIF key material.

pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod wif;

pub use encoding::{DecodeError, Decoder, Encodable, Encoder};
pub use hash::{bytes_to_hex, hash256_from_hex, hash256_to_hex, sha256, sha256d, Hash256};
pub use outpoint::OutPoint;
pub use wif::{secret_key_to_wif, wif_to_secret_key, WifError};
