//! Hash primitives and the 256-bit hash newtype.
//!
//! Bitcoin convention: hashes are computed over the wire serialization and
//! kept internally in natural digest order, but displayed as hex with the
//! byte order reversed. `Hash256` stores the internal order and reverses on
//! `Display`/serde so the two never get mixed up.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use ripemd::Ripemd160;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::BlockchainError;

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256: `SHA-256(SHA-256(data))`. Used for block hashes, txids
/// and Merkle nodes.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

/// RIPEMD-160 digest of `data`.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

/// hash160: `RIPEMD-160(SHA-256(data))`, the 20-byte public-key hash that
/// forms the core of a P2PKH address.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(data))
}

/// A 256-bit hash in internal (wire) byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zeros hash; used as the genesis block's parent sentinel.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Double SHA-256 of `data`, as a `Hash256`.
    pub fn digest(data: &[u8]) -> Hash256 {
        Hash256(double_sha256(data))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the 64-hex display form (reversed byte order).
    pub fn from_display_hex(s: &str) -> Result<Hash256, BlockchainError> {
        let bytes = hex::decode(s)
            .map_err(|e| BlockchainError::Decode(format!("invalid hash hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(BlockchainError::Decode(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut internal = [0u8; 32];
        for (i, b) in bytes.iter().rev().enumerate() {
            internal[i] = *b;
        }
        Ok(Hash256(internal))
    }

    /// 64-hex display form (byte order reversed relative to the wire).
    pub fn to_display_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    /// Shortened display prefix for log lines.
    pub fn short(&self) -> String {
        self.to_display_hex()[..16].to_string()
    }

    /// The hash as a big-endian 256-bit integer of its display form, the
    /// value compared against the proof-of-work target.
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_le(&self.0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_display_hex())
    }
}

impl FromStr for Hash256 {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash256::from_display_hex(s)
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_display_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_display_hex(&s).map_err(de::Error::custom)
    }
}
