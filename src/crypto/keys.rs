//! ECDSA key management, signing and address derivation.
//!
//! secp256k1 keys sign and verify DER-encoded signatures over the double
//! SHA-256 of a message. Addresses are `Base58Check(version, hash160(pubkey))`
//! over the 33-byte compressed public-key encoding; private keys export to
//! Wallet Import Format.

use rand::thread_rng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, SecretKey, SECP256K1};

use crate::config::NetworkType;
use crate::crypto::hash::{double_sha256, hash160};
use crate::encoding::{base58check_decode, base58check_encode};
use crate::error::{BlockchainError, Result};

/// A secp256k1 private key.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    key: SecretKey,
}

impl PrivateKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        PrivateKey {
            key: SecretKey::new(&mut thread_rng()),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(PrivateKey {
            key: SecretKey::from_slice(bytes)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.secret_bytes()
    }

    /// Derive the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: secp256k1::PublicKey::from_secret_key(&SECP256K1, &self.key),
        }
    }

    /// Sign `message`: DER-encoded ECDSA over `double_sha256(message)`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let digest = Message::from_digest(double_sha256(message));
        SECP256K1
            .sign_ecdsa(&digest, &self.key)
            .serialize_der()
            .to_vec()
    }

    /// Export in Wallet Import Format:
    /// `Base58Check(version, key ‖ 0x01 if compressed)`.
    pub fn to_wif(&self, compressed: bool, network: NetworkType) -> String {
        let mut payload = self.to_bytes().to_vec();
        if compressed {
            payload.push(0x01);
        }
        base58check_encode(network.wif_version(), &payload)
    }

    /// Import from WIF, returning the key, its compression flag and the
    /// network encoded in the version byte.
    pub fn from_wif(wif: &str) -> Result<(Self, bool, NetworkType)> {
        let (version, payload) = base58check_decode(wif)?;
        let network = NetworkType::from_wif_version(version).ok_or_else(|| {
            BlockchainError::Decode(format!("unknown WIF version byte {version:#04x}"))
        })?;
        let (key_bytes, compressed) = match payload.len() {
            32 => (&payload[..], false),
            33 if payload[32] == 0x01 => (&payload[..32], true),
            n => {
                return Err(BlockchainError::Decode(format!(
                    "WIF payload must be 32 or 33 bytes, got {n}"
                )))
            }
        };
        Ok((PrivateKey::from_bytes(key_bytes)?, compressed, network))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("PrivateKey(..)")
    }
}

/// A secp256k1 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    key: secp256k1::PublicKey,
}

impl PublicKey {
    /// Accepts the 33-byte compressed and 65-byte uncompressed encodings.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(PublicKey {
            key: secp256k1::PublicKey::from_slice(bytes)?,
        })
    }

    /// 33-byte compressed encoding.
    pub fn serialize_compressed(&self) -> [u8; 33] {
        self.key.serialize()
    }

    /// Verify a DER-encoded signature over `double_sha256(message)`.
    pub fn verify(&self, message: &[u8], der_signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_der(der_signature) else {
            return false;
        };
        let digest = Message::from_digest(double_sha256(message));
        SECP256K1.verify_ecdsa(&digest, &signature, &self.key).is_ok()
    }

    /// hash160 of the compressed encoding, the 20-byte P2PKH locking script.
    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.serialize_compressed())
    }

    /// P2PKH address: `Base58Check(version, hash160(compressed_pubkey))`.
    pub fn to_address(&self, network: NetworkType) -> String {
        base58check_encode(network.address_version(), &self.pubkey_hash())
    }
}

/// A private/public key pair with its derived address.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
    pub address: String,
}

impl KeyPair {
    pub fn generate(network: NetworkType) -> Self {
        KeyPair::from_private(PrivateKey::generate(), network)
    }

    pub fn from_private(private_key: PrivateKey, network: NetworkType) -> Self {
        let public_key = private_key.public_key();
        let address = public_key.to_address(network);
        KeyPair {
            private_key,
            public_key,
            address,
        }
    }

    /// The 20-byte locking script for outputs paying this key.
    pub fn pubkey_script(&self) -> Vec<u8> {
        self.public_key.pubkey_hash().to_vec()
    }
}

/// Decode a P2PKH address back to its 20-byte public-key hash.
pub fn address_to_pubkey_hash(address: &str) -> Result<Vec<u8>> {
    let (version, payload) = base58check_decode(address)?;
    if NetworkType::from_address_version(version).is_none() {
        return Err(BlockchainError::Decode(format!(
            "unknown address version byte {version:#04x}"
        )));
    }
    if payload.len() != 20 {
        return Err(BlockchainError::Decode(format!(
            "address payload must be 20 bytes, got {}",
            payload.len()
        )));
    }
    Ok(payload)
}
