//! Proof-of-work mining: template assembly, nonce search, extra-nonce
//! rolling and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_bigint::BigUint;

use crate::blockchain::block::{Block, BlockHeader};
use crate::blockchain::transaction::Transaction;
use crate::crypto::hash::Hash256;
use crate::error::{BlockchainError, Result};

use super::difficulty::bits_to_target;

/// Where the miner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinerStatus {
    #[default]
    Idle,
    Mining,
    /// Last search ended with a valid nonce.
    Found,
    /// Last search was cancelled through a [`StopHandle`].
    Stopped,
}

/// Cloneable cancellation handle; flips a flag the search loop checks every
/// iteration.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// The proof-of-work search engine.
pub struct Miner {
    /// Skip the search entirely and accept nonce 0 (tests/dev tooling).
    instant_mine: bool,
    stop_flag: Arc<AtomicBool>,
    status: MinerStatus,
    hash_count: u64,
}

impl Default for Miner {
    fn default() -> Self {
        Miner::new()
    }
}

impl Miner {
    pub fn new() -> Self {
        Miner {
            instant_mine: false,
            stop_flag: Arc::new(AtomicBool::new(false)),
            status: MinerStatus::Idle,
            hash_count: 0,
        }
    }

    pub fn instant() -> Self {
        Miner {
            instant_mine: true,
            ..Miner::new()
        }
    }

    pub fn status(&self) -> MinerStatus {
        self.status
    }

    /// Total hashes attempted over this miner's lifetime.
    pub fn hash_count(&self) -> u64 {
        self.hash_count
    }

    /// Handle that cancels an in-progress `mine_block` from another owner.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_flag))
    }

    /// Search for a nonce satisfying the block's own difficulty bits.
    ///
    /// Iterates the full 32-bit nonce space; on exhaustion the coinbase
    /// extra nonce is bumped, the Merkle root recomputed, and the search
    /// restarts at nonce 0. Cancellation surfaces as `MiningCancelled`.
    pub fn mine_block(&mut self, block: &mut Block) -> Result<()> {
        self.stop_flag.store(false, Ordering::Relaxed);
        self.status = MinerStatus::Mining;

        if self.instant_mine {
            block.header.nonce = 0;
            self.status = MinerStatus::Found;
            return Ok(());
        }

        let target: BigUint = bits_to_target(block.header.difficulty_bits);
        let mut extra_nonce: u64 = 0;

        loop {
            let mut nonce: u32 = 0;
            loop {
                if self.stop_flag.load(Ordering::Relaxed) {
                    self.status = MinerStatus::Stopped;
                    return Err(BlockchainError::MiningCancelled);
                }

                block.header.nonce = nonce;
                self.hash_count += 1;
                let hash = block.header.hash();
                if hash.to_biguint() <= target {
                    log::info!(
                        "block mined: hash={} nonce={} extra_nonce={} hashes={}",
                        hash.short(),
                        nonce,
                        extra_nonce,
                        self.hash_count
                    );
                    self.status = MinerStatus::Found;
                    return Ok(());
                }

                if nonce == u32::MAX {
                    break;
                }
                nonce += 1;
            }

            // Nonce space exhausted: roll the extra nonce for a fresh space.
            extra_nonce += 1;
            roll_extra_nonce(block, extra_nonce);
            log::info!(
                "nonce space exhausted, extra nonce rolled to {extra_nonce}"
            );
        }
    }
}

/// Replace the coinbase's trailing 8-byte extra-nonce field and recompute
/// the Merkle root, giving the header a fresh search space.
pub fn roll_extra_nonce(block: &mut Block, extra_nonce: u64) {
    if let Some(coinbase) = block.transactions.first_mut() {
        let script = &mut coinbase.inputs[0].signature_script;
        if script.len() >= 8 {
            let suffix_start = script.len() - 8;
            script[suffix_start..].copy_from_slice(&extra_nonce.to_le_bytes());
        }
    }
    block.header.merkle_root = block.compute_merkle_root();
}

/// Assemble a candidate block ready for the nonce search.
///
/// The coinbase pays `reward_amount` (subsidy plus fees) to `payout_script`
/// and embeds the height and a zero extra nonce; the Merkle root commits to
/// the full transaction list.
pub fn create_block_template(
    previous_block_hash: Hash256,
    height: u64,
    difficulty_bits: u32,
    transactions: Vec<Transaction>,
    payout_script: &[u8],
    reward_amount: i64,
    timestamp: u32,
) -> Block {
    let coinbase = Transaction::create_coinbase(height, payout_script.to_vec(), reward_amount, 0);

    let mut all_transactions = Vec::with_capacity(transactions.len() + 1);
    all_transactions.push(coinbase);
    all_transactions.extend(transactions);

    let header = BlockHeader {
        version: 1,
        previous_block_hash,
        merkle_root: Hash256::ZERO,
        timestamp,
        difficulty_bits,
        nonce: 0,
    };

    let mut block = Block::new(header, all_transactions);
    block.header.merkle_root = block.compute_merkle_root();
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::difficulty::{DEV_GENESIS_BITS, GENESIS_BITS};

    fn template(bits: u32) -> Block {
        create_block_template(
            Hash256::digest(b"parent"),
            1,
            bits,
            Vec::new(),
            &[0xAA; 20],
            50_0000_0000,
            1_231_006_600,
        )
    }

    #[test]
    fn template_is_well_formed() {
        let block = template(DEV_GENESIS_BITS);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.header.merkle_root, block.compute_merkle_root());
        assert_eq!(block.header.nonce, 0);
    }

    #[test]
    fn mining_finds_a_valid_nonce_at_dev_difficulty() {
        let mut block = template(DEV_GENESIS_BITS);
        let mut miner = Miner::new();

        miner.mine_block(&mut block).unwrap();
        assert_eq!(miner.status(), MinerStatus::Found);
        assert!(block.header.meets_difficulty_target());
        assert!(miner.hash_count() > 0);
    }

    #[test]
    fn instant_mode_skips_the_search() {
        let mut block = template(GENESIS_BITS);
        let mut miner = Miner::instant();

        miner.mine_block(&mut block).unwrap();
        assert_eq!(block.header.nonce, 0);
        assert_eq!(miner.status(), MinerStatus::Found);
        assert_eq!(miner.hash_count(), 0);
    }

    #[test]
    fn stop_handle_cancels_the_search() {
        // Production difficulty cannot be met by a unit test, so the loop
        // runs until cancelled.
        let mut block = template(GENESIS_BITS);
        let mut miner = Miner::new();
        let handle = miner.stop_handle();

        let worker = std::thread::spawn(move || {
            let result = miner.mine_block(&mut block);
            (miner.status(), result)
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        handle.stop();

        let (status, result) = worker.join().unwrap();
        assert_eq!(status, MinerStatus::Stopped);
        assert!(matches!(result, Err(BlockchainError::MiningCancelled)));
    }

    #[test]
    fn extra_nonce_roll_changes_merkle_root_and_preserves_height() {
        let mut block = template(DEV_GENESIS_BITS);
        let before_root = block.header.merkle_root;
        let before_script = block.transactions[0].inputs[0].signature_script.clone();

        roll_extra_nonce(&mut block, 99);

        assert_ne!(block.header.merkle_root, before_root);
        assert_eq!(block.header.merkle_root, block.compute_merkle_root());
        let after_script = &block.transactions[0].inputs[0].signature_script;
        // Height prefix untouched, only the 8-byte suffix changed.
        assert_eq!(after_script[..after_script.len() - 8], before_script[..before_script.len() - 8]);
        assert_eq!(&after_script[after_script.len() - 8..], &99u64.to_le_bytes());
    }
}
