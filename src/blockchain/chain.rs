//! The block tree and best-chain state machine.
//!
//! Every known block lives in the tree, side branches included. The best
//! chain is the branch with the most cumulative work; its effects are the
//! UTXO set and the mempool contents. When a competing branch overtakes the
//! best chain, the reorganizer unwinds the old branch (consuming per-block
//! undo data) and applies the new one, atomically: any failure restores the
//! pre-reorg state wholesale.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::blockchain::block::{Block, BlockHeader};
use crate::blockchain::mempool::Mempool;
use crate::blockchain::reward::block_reward;
use crate::blockchain::transaction::Transaction;
use crate::blockchain::utxo::{OutPoint, UtxoEntry, UtxoSet};
use crate::consensus::difficulty::{block_work, calculate_next_bits, should_adjust, DifficultyParams};
use crate::consensus::pow::{create_block_template, Miner};
use crate::consensus::validation::{self, SignaturePolicy, MEDIAN_TIME_SPAN};
use crate::consensus::unix_time;
use crate::crypto::hash::Hash256;
use crate::crypto::merkle::compute_merkle_root;
use crate::error::{BlockchainError, Result};

/// Genesis block timestamp (January 3, 2009 18:15:05 UTC).
pub const GENESIS_TIMESTAMP: u32 = 1_231_006_505;

/// The blockchain: block tree, best-chain state and mempool.
pub struct Blockchain {
    /// Every known block, side branches included.
    blocks: HashMap<Hash256, Block>,
    /// Height of every known block, derived from its parent at insertion.
    block_heights: HashMap<Hash256, u64>,
    /// All block hashes at a given height (more than one during forks).
    height_index: BTreeMap<u64, Vec<Hash256>>,
    /// Blocks with no known child.
    chain_tips: Vec<Hash256>,
    /// Tip of the branch with the most cumulative work.
    best_chain_tip: Hash256,
    /// Cumulative work from genesis through each block.
    chain_work: HashMap<Hash256, BigUint>,
    /// Spendable outputs of the best chain.
    utxo_set: UtxoSet,
    /// Spent entries per connected block, consumed when unwinding.
    undo_log: HashMap<Hash256, Vec<(OutPoint, UtxoEntry)>>,
    mempool: Mempool,
    params: DifficultyParams,
    signature_policy: SignaturePolicy,
    /// Confirmations required before coinbase outputs become spendable.
    coinbase_maturity: u64,
    development_mode: bool,
}

impl Blockchain {
    /// Development chain: low difficulty, 10-block adjustment interval.
    pub fn development() -> Self {
        Blockchain::with_params(DifficultyParams::development(), true)
    }

    /// Production chain: mainnet difficulty parameters.
    pub fn production() -> Self {
        Blockchain::with_params(DifficultyParams::production(), false)
    }

    pub fn with_params(params: DifficultyParams, development_mode: bool) -> Self {
        let mut chain = Blockchain {
            blocks: HashMap::new(),
            block_heights: HashMap::new(),
            height_index: BTreeMap::new(),
            chain_tips: Vec::new(),
            best_chain_tip: Hash256::ZERO,
            chain_work: HashMap::new(),
            utxo_set: UtxoSet::new(),
            undo_log: HashMap::new(),
            mempool: Mempool::new(),
            params,
            signature_policy: SignaturePolicy::default(),
            coinbase_maturity: validation::COINBASE_MATURITY,
            development_mode,
        };
        chain.create_genesis_block();
        chain
    }

    /// The genesis block is constructed, not mined or validated: its
    /// coinbase pays the initial subsidy to the all-zeros script.
    fn create_genesis_block(&mut self) {
        let coinbase = Transaction::create_coinbase(0, vec![0u8; 20], block_reward(0), 0);
        let merkle_root = compute_merkle_root(&[coinbase.txid()]);
        let header = BlockHeader {
            version: 1,
            previous_block_hash: Hash256::ZERO,
            merkle_root,
            timestamp: GENESIS_TIMESTAMP,
            difficulty_bits: self.params.genesis_bits,
            nonce: 0,
        };
        let genesis = Block::new(header, vec![coinbase]);
        let hash = genesis.hash();

        self.blocks.insert(hash, genesis.clone());
        self.block_heights.insert(hash, 0);
        self.height_index.insert(0, vec![hash]);
        self.chain_tips = vec![hash];
        self.chain_work
            .insert(hash, block_work(self.params.genesis_bits));
        self.best_chain_tip = hash;
        self.connect_block(&genesis, 0);

        log::info!("genesis block created: {}", hash.short());
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn params(&self) -> &DifficultyParams {
        &self.params
    }

    pub fn development_mode(&self) -> bool {
        self.development_mode
    }

    pub fn signature_policy(&self) -> SignaturePolicy {
        self.signature_policy
    }

    pub fn set_signature_policy(&mut self, policy: SignaturePolicy) {
        self.signature_policy = policy;
    }

    pub fn coinbase_maturity(&self) -> u64 {
        self.coinbase_maturity
    }

    pub fn set_coinbase_maturity(&mut self, maturity: u64) {
        self.coinbase_maturity = maturity;
    }

    pub fn get_block(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u64> {
        self.block_heights.get(hash).copied()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn best_chain_tip(&self) -> Hash256 {
        self.best_chain_tip
    }

    pub fn chain_tips(&self) -> &[Hash256] {
        &self.chain_tips
    }

    /// Height of the best chain's tip.
    pub fn chain_height(&self) -> u64 {
        self.block_heights[&self.best_chain_tip]
    }

    pub fn chain_tip(&self) -> &Block {
        &self.blocks[&self.best_chain_tip]
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// The block at `height` on the best chain.
    pub fn get_block_by_height(&self, height: u64) -> Option<&Block> {
        let candidates = self.height_index.get(&height)?;
        if candidates.len() == 1 {
            return self.blocks.get(&candidates[0]);
        }
        let on_best_chain = self.ancestor_at(&self.best_chain_tip, height)?;
        self.blocks.get(&on_best_chain)
    }

    /// Walk `previous_block_hash` links from `tip` down to `height`.
    fn ancestor_at(&self, tip: &Hash256, height: u64) -> Option<Hash256> {
        let mut current = *tip;
        loop {
            let current_height = self.height_of(&current)?;
            if current_height == height {
                return Some(current);
            }
            if current_height < height {
                return None;
            }
            current = self.blocks.get(&current)?.header.previous_block_hash;
        }
    }

    /// The chain from genesis to `tip` (defaults to the best tip).
    pub fn get_chain(&self, tip: Option<Hash256>) -> Vec<&Block> {
        let mut chain = Vec::new();
        let mut current = tip.unwrap_or(self.best_chain_tip);
        while let Some(block) = self.blocks.get(&current) {
            chain.push(block);
            if block.header.previous_block_hash.is_zero() {
                break;
            }
            current = block.header.previous_block_hash;
        }
        chain.reverse();
        chain
    }

    /// Timestamps of up to `count` blocks ending at `from` (inclusive),
    /// most recent first. Feeds the median-time-past rule.
    pub fn previous_timestamps(&self, from: &Hash256, count: usize) -> Vec<u32> {
        let mut timestamps = Vec::with_capacity(count);
        let mut current = *from;
        while timestamps.len() < count {
            let Some(block) = self.blocks.get(&current) else {
                break;
            };
            timestamps.push(block.header.timestamp);
            if block.header.previous_block_hash.is_zero() {
                break;
            }
            current = block.header.previous_block_hash;
        }
        timestamps
    }

    /// Median-time-past of the chain ending at `from`.
    pub fn median_time_past(&self, from: &Hash256) -> u32 {
        let timestamps = self.previous_timestamps(from, MEDIAN_TIME_SPAN);
        if timestamps.is_empty() {
            0
        } else {
            validation::median_time(&timestamps)
        }
    }

    /// Balance locked by `pubkey_script` on the best chain.
    pub fn balance_of(&self, pubkey_script: &[u8]) -> i64 {
        self.utxo_set.balance(pubkey_script)
    }

    /// Submit a transaction to the mempool under its acceptance rules.
    pub fn submit_transaction(&mut self, tx: Transaction) -> bool {
        self.mempool.accept(tx, &self.utxo_set)
    }

    // ------------------------------------------------------------------
    // Difficulty
    // ------------------------------------------------------------------

    /// Expected compact bits for a block at `height` whose parent is
    /// `parent_hash`, following that block's own ancestry. Off adjustment
    /// boundaries the parent's bits are inherited; on a boundary the target
    /// is recomputed from the previous interval's timestamps.
    pub fn next_bits(&self, parent_hash: &Hash256, height: u64) -> u32 {
        if height == 0 {
            return self.params.genesis_bits;
        }
        let parent = self
            .blocks
            .get(parent_hash)
            .expect("difficulty requested for unknown parent");
        if !should_adjust(height, self.params.adjustment_interval) {
            return parent.header.difficulty_bits;
        }

        let mut timestamps = Vec::with_capacity(self.params.adjustment_interval as usize);
        let mut current = *parent_hash;
        for _ in 0..self.params.adjustment_interval {
            let block = &self.blocks[&current];
            timestamps.push(block.header.timestamp);
            if block.header.previous_block_hash.is_zero() {
                break;
            }
            current = block.header.previous_block_hash;
        }
        timestamps.reverse();
        if timestamps.len() < 2 {
            return parent.header.difficulty_bits;
        }

        let new_bits = calculate_next_bits(&timestamps, parent.header.difficulty_bits, &self.params);
        if new_bits != parent.header.difficulty_bits {
            log::info!(
                "difficulty retarget at height {height}: {:#010x} -> {new_bits:#010x}",
                parent.header.difficulty_bits
            );
        }
        new_bits
    }

    /// Bits the next block on the best chain must carry.
    pub fn current_difficulty_bits(&self) -> u32 {
        self.next_bits(&self.best_chain_tip, self.chain_height() + 1)
    }

    // ------------------------------------------------------------------
    // Block acceptance
    // ------------------------------------------------------------------

    /// Attempt to add a block to the tree.
    ///
    /// Validation failures reject the block (returning `false`) without
    /// touching state. An accepted block either extends the best chain,
    /// triggers a reorganization when its branch carries more work, or is
    /// stored as a side branch.
    pub fn add_block(&mut self, block: Block) -> bool {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            log::debug!("block {} already known", hash.short());
            return false;
        }

        if let Err(e) = validation::validate_block(self, &block, &self.utxo_set) {
            log::warn!("block {} rejected: {e}", hash.short());
            return false;
        }

        let prev_hash = block.header.previous_block_hash;
        let height = if prev_hash.is_zero() {
            0
        } else {
            self.block_heights[&prev_hash] + 1
        };
        let parent_work = if prev_hash.is_zero() {
            BigUint::zero()
        } else {
            self.chain_work[&prev_hash].clone()
        };
        let work = parent_work + block_work(block.header.difficulty_bits);

        self.blocks.insert(hash, block);
        self.block_heights.insert(hash, height);
        self.height_index.entry(height).or_default().push(hash);
        self.chain_tips.retain(|tip| *tip != prev_hash);
        self.chain_tips.push(hash);
        self.chain_work.insert(hash, work.clone());

        if prev_hash == self.best_chain_tip {
            let block = self.blocks[&hash].clone();
            self.connect_block(&block, height);
            self.best_chain_tip = hash;
            log::info!("block {} extends best chain to height {height}", hash.short());
        } else if work > self.chain_work[&self.best_chain_tip] {
            log::info!(
                "branch ending at {} overtakes the best chain, reorganizing",
                hash.short()
            );
            if let Err(e) = self.reorganize(hash) {
                log::warn!(
                    "reorganization to {} abandoned, best chain unchanged: {e}",
                    hash.short()
                );
            }
        } else {
            log::info!(
                "block {} stored on side branch at height {height}",
                hash.short()
            );
        }

        true
    }

    /// Apply a block's UTXO effects, record its undo data and purge its
    /// transactions from the mempool.
    fn connect_block(&mut self, block: &Block, height: u64) {
        let mut undo = Vec::new();
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let outpoint = input.outpoint();
                    let entry = self
                        .utxo_set
                        .remove(&outpoint)
                        .expect("validated block spends existing outputs");
                    undo.push((outpoint, entry));
                }
            }
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                self.utxo_set.add(
                    OutPoint::new(txid, index as u32),
                    UtxoEntry {
                        value: output.value,
                        pubkey_script: output.pubkey_script.clone(),
                        block_height: height,
                        is_coinbase: tx.is_coinbase(),
                    },
                );
            }
        }
        self.undo_log.insert(block.hash(), undo);
        self.mempool.purge_confirmed(block);
    }

    /// Reverse a connected block's UTXO effects using its undo data.
    /// Returns the non-coinbase transactions for mempool requeueing.
    fn disconnect_block(&mut self, hash: &Hash256) -> Result<Vec<Transaction>> {
        let block = self
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| BlockchainError::Snapshot(format!("unknown block {hash} in unwind")))?;

        // Reinstate spent entries first so intra-block chains resolve, then
        // remove every output the block created.
        for (outpoint, entry) in self.undo_log.remove(hash).unwrap_or_default() {
            self.utxo_set.add(outpoint, entry);
        }
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for index in (0..tx.outputs.len()).rev() {
                self.utxo_set.remove(&OutPoint::new(txid, index as u32))?;
            }
        }

        Ok(block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .cloned()
            .collect())
    }

    // ------------------------------------------------------------------
    // Reorganization
    // ------------------------------------------------------------------

    /// Switch the best chain to the branch ending at `new_tip`.
    ///
    /// Unwinds the old branch back to the common ancestor (returning its
    /// transactions to the mempool), then applies the new branch with full
    /// validation against the evolving UTXO snapshot. On any failure the
    /// saved state is restored wholesale and the old tip stays in force.
    fn reorganize(&mut self, new_tip: Hash256) -> Result<()> {
        let old_tip = self.best_chain_tip;
        let ancestor = self
            .find_common_ancestor(&old_tip, &new_tip)
            .ok_or_else(|| BlockchainError::NoCommonAncestor {
                old_tip: old_tip.to_string(),
                new_tip: new_tip.to_string(),
            })?;

        log::info!(
            "reorg: old tip {}, new tip {}, common ancestor {}",
            old_tip.short(),
            new_tip.short(),
            ancestor.short()
        );

        let unwind = self.path_above(&old_tip, &ancestor);
        let mut apply = self.path_above(&new_tip, &ancestor);
        apply.reverse();

        let saved_utxo = self.utxo_set.clone();
        let saved_mempool = self.mempool.clone();
        let saved_undo = self.undo_log.clone();

        match self.switch_branches(&unwind, &apply) {
            Ok(()) => {
                self.best_chain_tip = new_tip;
                log::info!(
                    "reorg complete: new best tip {} at height {}",
                    new_tip.short(),
                    self.chain_height()
                );
                Ok(())
            }
            Err(e) => {
                self.utxo_set = saved_utxo;
                self.mempool = saved_mempool;
                self.undo_log = saved_undo;
                Err(e)
            }
        }
    }

    fn switch_branches(&mut self, unwind: &[Hash256], apply: &[Hash256]) -> Result<()> {
        for hash in unwind {
            let returned = self.disconnect_block(hash)?;
            self.mempool.requeue(returned, &self.utxo_set);
        }
        for hash in apply {
            let block = self.blocks[hash].clone();
            let height = self.block_heights[hash];
            validation::validate_block(self, &block, &self.utxo_set)?;
            self.connect_block(&block, height);
        }
        Ok(())
    }

    /// Most recent block on both branches, found by walking each chain of
    /// `previous_block_hash` links.
    fn find_common_ancestor(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let mut on_a = HashSet::new();
        let mut current = *a;
        while let Some(block) = self.blocks.get(&current) {
            on_a.insert(current);
            if block.header.previous_block_hash.is_zero() {
                break;
            }
            current = block.header.previous_block_hash;
        }

        let mut current = *b;
        while let Some(block) = self.blocks.get(&current) {
            if on_a.contains(&current) {
                return Some(current);
            }
            if block.header.previous_block_hash.is_zero() {
                break;
            }
            current = block.header.previous_block_hash;
        }
        None
    }

    /// Hashes from `tip` down to (excluding) `ancestor`, newest first.
    fn path_above(&self, tip: &Hash256, ancestor: &Hash256) -> Vec<Hash256> {
        let mut path = Vec::new();
        let mut current = *tip;
        while current != *ancestor {
            path.push(current);
            current = self.blocks[&current].header.previous_block_hash;
        }
        path
    }

    // ------------------------------------------------------------------
    // Mining convenience
    // ------------------------------------------------------------------

    /// Assemble a template from the mempool, mine it and add it.
    ///
    /// The coinbase pays the subsidy plus collected fees to
    /// `payout_script`; the timestamp is wall clock, floored to one past
    /// the median-time-past so rapid mining stays valid.
    pub fn mine_next_block(&mut self, payout_script: &[u8], miner: &mut Miner) -> Result<Block> {
        let parent_hash = self.best_chain_tip;
        let height = self.chain_height() + 1;
        let bits = self.next_bits(&parent_hash, height);

        let transactions = self.mempool.select(None);
        let fees: i64 = transactions
            .iter()
            .map(|tx| tx.fee(&self.utxo_set).unwrap_or(0))
            .sum();
        let reward = block_reward(height) + fees;

        let timestamp = unix_time().max(self.median_time_past(&parent_hash) + 1);
        let mut block = create_block_template(
            parent_hash,
            height,
            bits,
            transactions,
            payout_script,
            reward,
            timestamp,
        );

        miner.mine_block(&mut block)?;

        if self.add_block(block.clone()) {
            Ok(block)
        } else {
            Err(BlockchainError::BlockRejected)
        }
    }

    // ------------------------------------------------------------------
    // JSON snapshot
    // ------------------------------------------------------------------

    pub fn to_snapshot(&self) -> ChainSnapshot {
        let blocks = self
            .blocks
            .iter()
            .map(|(hash, block)| {
                (
                    hash.to_string(),
                    SnapshotBlock {
                        height: self.block_heights[hash],
                        block: block.clone(),
                    },
                )
            })
            .collect();

        ChainSnapshot {
            development_mode: self.development_mode,
            params: self.params,
            chain_height: self.chain_height(),
            best_chain_tip: self.best_chain_tip,
            chain_tips: self.chain_tips.clone(),
            height_index: self.height_index.clone(),
            blocks,
            utxo_set: self.utxo_set.to_snapshot(),
            mempool: self.mempool.to_snapshot(),
        }
    }

    /// Rebuild a chain by replaying the snapshot's blocks in ascending
    /// height order (parents sort before children), then requeueing its
    /// mempool transactions.
    pub fn from_snapshot(snapshot: &ChainSnapshot) -> Result<Blockchain> {
        let mut chain = Blockchain::with_params(snapshot.params, snapshot.development_mode);

        // Blocks on the snapshot's declared best chain replay first at each
        // height, preserving the first-seen tie-break among equal-work tips.
        let mut on_best_chain = HashSet::new();
        let mut current = snapshot.best_chain_tip;
        while let Some(entry) = snapshot.blocks.get(&current.to_string()) {
            on_best_chain.insert(current);
            if entry.block.header.previous_block_hash.is_zero() {
                break;
            }
            current = entry.block.header.previous_block_hash;
        }

        let mut ordered: Vec<&SnapshotBlock> = snapshot.blocks.values().collect();
        ordered.sort_by_key(|entry| {
            let hash = entry.block.hash();
            (entry.height, !on_best_chain.contains(&hash), hash)
        });

        for entry in ordered {
            let hash = entry.block.hash();
            if entry.height == 0 {
                if hash != chain.best_chain_tip {
                    return Err(BlockchainError::Snapshot(format!(
                        "snapshot genesis {hash} does not match chain parameters"
                    )));
                }
                continue;
            }
            if !chain.add_block(entry.block.clone()) {
                log::warn!("snapshot block {} was not accepted on replay", hash.short());
            }
        }

        for tx in snapshot.mempool.values() {
            chain.mempool.accept(tx.clone(), &chain.utxo_set);
        }

        if chain.best_chain_tip != snapshot.best_chain_tip {
            log::warn!(
                "restored best tip {} differs from snapshot tip {}",
                chain.best_chain_tip.short(),
                snapshot.best_chain_tip.short()
            );
        }

        Ok(chain)
    }

    pub fn export_to_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, &self.to_snapshot())?;
        log::info!("blockchain exported to {}", path.as_ref().display());
        Ok(())
    }

    pub fn import_from_json(path: impl AsRef<Path>) -> Result<Blockchain> {
        let file = std::fs::File::open(path.as_ref())?;
        let snapshot: ChainSnapshot = serde_json::from_reader(file)?;
        let chain = Blockchain::from_snapshot(&snapshot)?;
        log::info!("blockchain imported from {}", path.as_ref().display());
        Ok(chain)
    }
}

/// A block plus its height, as stored in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBlock {
    pub height: u64,
    pub block: Block,
}

/// Round-trippable JSON form of the full chain state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub development_mode: bool,
    pub params: DifficultyParams,
    pub chain_height: u64,
    pub best_chain_tip: Hash256,
    pub chain_tips: Vec<Hash256>,
    pub height_index: BTreeMap<u64, Vec<Hash256>>,
    pub blocks: BTreeMap<String, SnapshotBlock>,
    pub utxo_set: BTreeMap<String, UtxoEntry>,
    pub mempool: BTreeMap<String, Transaction>,
}
