//! Block and block-header data model.
//!
//! The header is exactly 80 bytes on the wire; its double SHA-256 is the
//! block hash that proof-of-work grinds on. The header's Merkle root commits
//! to the full transaction list, so any transaction mutation invalidates the
//! proof-of-work.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::blockchain::transaction::Transaction;
use crate::consensus::difficulty::bits_to_target;
use crate::crypto::hash::Hash256;
use crate::crypto::merkle::{compute_merkle_root, MerkleProof, MerkleTree};
use crate::encoding::{write_varint, SliceReader};
use crate::error::{BlockchainError, Result};

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 80;

/// The 80-byte block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_block_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix seconds.
    pub timestamp: u32,
    /// Compact (nBits) encoding of the proof-of-work target.
    pub difficulty_bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// The block hash: double SHA-256 of the 80-byte serialization.
    pub fn hash(&self) -> Hash256 {
        Hash256::digest(&self.serialize())
    }

    /// Serialize to exactly 80 bytes, all integers little-endian and hash
    /// fields in internal byte order.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.previous_block_hash.0);
        buf.extend_from_slice(&self.merkle_root.0);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.difficulty_bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);
        let header = BlockHeader::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(BlockchainError::Decode(format!(
                "{} trailing bytes after header",
                reader.remaining()
            )));
        }
        Ok(header)
    }

    pub fn read_from(reader: &mut SliceReader<'_>) -> Result<Self> {
        let version = reader.read_u32_le()?;
        let mut previous = [0u8; 32];
        previous.copy_from_slice(reader.read_bytes(32)?);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(reader.read_bytes(32)?);
        let timestamp = reader.read_u32_le()?;
        let difficulty_bits = reader.read_u32_le()?;
        let nonce = reader.read_u32_le()?;
        Ok(BlockHeader {
            version,
            previous_block_hash: Hash256(previous),
            merkle_root: Hash256(merkle),
            timestamp,
            difficulty_bits,
            nonce,
        })
    }

    /// The full 256-bit target this header claims to satisfy.
    pub fn target(&self) -> BigUint {
        bits_to_target(self.difficulty_bits)
    }

    /// Proof-of-work check: the hash, interpreted as a big-endian integer of
    /// its display form, must not exceed the target.
    pub fn meets_difficulty_target(&self) -> bool {
        self.hash().to_biguint() <= self.target()
    }
}

/// A block: header plus ordered transactions, the first being the coinbase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Recompute the Merkle root over the transaction ids.
    pub fn compute_merkle_root(&self) -> Hash256 {
        let txids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.txid()).collect();
        compute_merkle_root(&txids)
    }

    /// Inclusion proof for the transaction at `index`.
    pub fn merkle_proof(&self, index: usize) -> Option<MerkleProof> {
        let txids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.txid()).collect();
        MerkleTree::new(&txids).proof(index)
    }

    /// The coinbase transaction, when the block is well-formed.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Wire serialization: `header(80) ‖ varint(|txs|) ‖ txs`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.header.serialize();
        write_varint(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.serialize());
        }
        buf
    }

    pub fn serialized_size(&self) -> usize {
        let tx_bytes: usize = self
            .transactions
            .iter()
            .map(Transaction::serialized_size)
            .sum();
        HEADER_SIZE + crate::encoding::varint_len(self.transactions.len() as u64) + tx_bytes
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);
        let block = Block::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(BlockchainError::Decode(format!(
                "{} trailing bytes after block",
                reader.remaining()
            )));
        }
        Ok(block)
    }

    pub fn read_from(reader: &mut SliceReader<'_>) -> Result<Self> {
        let header = BlockHeader::read_from(reader)?;
        let tx_count = reader.read_varint()? as usize;
        let mut transactions = Vec::with_capacity(tx_count.min(1024));
        for _ in 0..tx_count {
            transactions.push(Transaction::read_from(reader)?);
        }
        Ok(Block {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{TransactionInput, TransactionOutput};
    use crate::consensus::difficulty::DEV_GENESIS_BITS;

    fn p2pkh_tx(tag: &[u8], value: i64) -> Transaction {
        let input = TransactionInput {
            previous_txid: Hash256::digest(tag),
            previous_output_index: 0,
            signature_script: tag.to_vec(),
            sequence: 0xFFFF_FFFF,
        };
        Transaction::new(vec![input], vec![TransactionOutput::new(value, vec![0x55; 20])])
    }

    fn sample_block() -> Block {
        let coinbase = Transaction::create_coinbase(7, vec![0xAA; 20], 50_0000_0000, 0);
        let transactions = vec![coinbase, p2pkh_tx(b"a", 1_000), p2pkh_tx(b"b", 2_000)];
        let mut header = BlockHeader {
            version: 1,
            previous_block_hash: Hash256::digest(b"parent"),
            merkle_root: Hash256::ZERO,
            timestamp: 1_231_006_505,
            difficulty_bits: DEV_GENESIS_BITS,
            nonce: 42,
        };
        let block = Block::new(header.clone(), transactions);
        header.merkle_root = block.compute_merkle_root();
        Block::new(header, block.transactions)
    }

    #[test]
    fn header_serializes_to_80_bytes() {
        let block = sample_block();
        let bytes = block.header.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::deserialize(&bytes).unwrap(), block.header);
    }

    #[test]
    fn header_hash_matches_equality() {
        let block = sample_block();
        let mut other = block.header.clone();
        assert_eq!(other.hash(), block.header.hash());
        other.nonce += 1;
        assert_ne!(other.hash(), block.header.hash());
    }

    #[test]
    fn block_round_trip_preserves_merkle_root() {
        let block = sample_block();
        let bytes = block.serialize();
        assert_eq!(bytes.len(), block.serialized_size());

        let restored = Block::deserialize(&bytes).unwrap();
        assert_eq!(restored, block);
        assert_eq!(restored.compute_merkle_root(), block.compute_merkle_root());
        assert_eq!(restored.hash(), block.hash());
    }

    #[test]
    fn merkle_proofs_verify_for_all_transactions() {
        let block = sample_block();
        let root = block.compute_merkle_root();
        for i in 0..block.transactions.len() {
            let proof = block.merkle_proof(i).unwrap();
            assert_eq!(proof.leaf, block.transactions[i].txid());
            assert!(proof.verify(&root));
        }
    }

    #[test]
    fn coinbase_accessor() {
        let block = sample_block();
        assert!(block.coinbase().is_some());

        let headless = Block::new(block.header.clone(), vec![p2pkh_tx(b"x", 1)]);
        assert!(headless.coinbase().is_none());
    }

    #[test]
    fn easy_target_is_met_by_searching_nonces() {
        let mut block = sample_block();
        // Dev-mode target: roughly one in 4096 hashes qualifies.
        for nonce in 0..200_000u32 {
            block.header.nonce = nonce;
            if block.header.meets_difficulty_target() {
                return;
            }
        }
        panic!("no nonce satisfied the development target");
    }
}
