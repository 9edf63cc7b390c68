pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, hash160, ripemd160, sha256, Hash256};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use merkle::{MerkleProof, MerkleTree};
