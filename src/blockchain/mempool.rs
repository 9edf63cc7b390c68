//! The transaction memory pool.
//!
//! Validated-but-unconfirmed transactions staged for mining, ordered by fee
//! rate. Double spends against pool members are rejected first-seen; the
//! first transaction consuming an outpoint wins.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::blockchain::block::Block;
use crate::blockchain::transaction::Transaction;
use crate::blockchain::utxo::{OutPoint, UtxoSet};
use crate::crypto::hash::Hash256;

/// Fee-rate-ordered staging area for unconfirmed transactions.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: HashMap<Hash256, Transaction>,
    /// Descending fee rate (satoshis per byte); ties keep insertion order.
    fee_index: Vec<(f64, Hash256)>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.transactions.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.transactions.get(txid)
    }

    /// Attempt to admit a transaction.
    ///
    /// Rejected when the txid is already present, the transaction is a
    /// coinbase, or any input conflicts with an existing member
    /// (first-seen). The fee rate is computed against `utxo_set`, defaulting
    /// to 0 when an input cannot be resolved or the fee would be negative.
    pub fn accept(&mut self, tx: Transaction, utxo_set: &UtxoSet) -> bool {
        let txid = tx.txid();

        if self.transactions.contains_key(&txid) {
            log::debug!("mempool: {} already present", txid.short());
            return false;
        }
        if tx.is_coinbase() {
            log::debug!("mempool: rejecting coinbase {}", txid.short());
            return false;
        }
        if self.double_spends(&tx) {
            log::warn!("mempool: rejecting double spend {}", txid.short());
            return false;
        }

        let fee_rate = Self::fee_rate(&tx, utxo_set);
        self.transactions.insert(txid, tx);
        self.fee_index.push((fee_rate, txid));
        // Stable sort keeps insertion order among equal fee rates.
        self.fee_index
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        log::info!(
            "mempool: accepted {} (fee rate {:.2} sat/byte, {} pooled)",
            txid.short(),
            fee_rate,
            self.transactions.len()
        );
        true
    }

    /// Remove a transaction by txid.
    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let removed = self.transactions.remove(txid);
        if removed.is_some() {
            self.fee_index.retain(|(_, id)| id != txid);
        }
        removed
    }

    /// Highest-fee-rate transactions first, optionally capped at `limit`.
    pub fn select(&self, limit: Option<usize>) -> Vec<Transaction> {
        let cap = limit.unwrap_or(self.fee_index.len());
        self.fee_index
            .iter()
            .take(cap)
            .filter_map(|(_, txid)| self.transactions.get(txid).cloned())
            .collect()
    }

    /// Drop every non-coinbase transaction confirmed by `block`.
    /// Returns how many were removed.
    pub fn purge_confirmed(&mut self, block: &Block) -> usize {
        let mut removed = 0;
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            if self.remove(&tx.txid()).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("mempool: purged {removed} confirmed transactions");
        }
        removed
    }

    /// Re-admit transactions unwound by a reorganization under the normal
    /// acceptance rules; conflicts are silently dropped.
    pub fn requeue(&mut self, transactions: Vec<Transaction>, utxo_set: &UtxoSet) {
        for tx in transactions {
            self.accept(tx, utxo_set);
        }
    }

    /// Whether any input of `tx` consumes an outpoint already consumed by a
    /// pool member.
    pub fn double_spends(&self, tx: &Transaction) -> bool {
        let spent: HashSet<OutPoint> = self
            .transactions
            .values()
            .flat_map(|member| member.inputs.iter())
            .filter(|input| !input.is_coinbase())
            .map(|input| input.outpoint())
            .collect();

        tx.inputs
            .iter()
            .filter(|input| !input.is_coinbase())
            .any(|input| spent.contains(&input.outpoint()))
    }

    /// Fee rate in satoshis per serialized byte; 0 when any input is
    /// unresolvable or the fee comes out negative.
    fn fee_rate(tx: &Transaction, utxo_set: &UtxoSet) -> f64 {
        let mut total_input = 0i64;
        for input in &tx.inputs {
            match utxo_set.get(&input.outpoint()) {
                Some(entry) => total_input += entry.value,
                None => return 0.0,
            }
        }
        let fee = total_input - tx.total_output_value();
        if fee < 0 {
            return 0.0;
        }
        let size = tx.serialized_size();
        if size == 0 {
            return 0.0;
        }
        fee as f64 / size as f64
    }

    /// Snapshot form: transactions keyed by display txid.
    pub fn to_snapshot(&self) -> BTreeMap<String, Transaction> {
        self.transactions
            .iter()
            .map(|(txid, tx)| (txid.to_string(), tx.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{TransactionInput, TransactionOutput};
    use crate::blockchain::utxo::UtxoEntry;

    fn spend(tag: &[u8], index: u32, value: i64) -> Transaction {
        Transaction::new(
            vec![TransactionInput::new(Hash256::digest(tag), index)],
            vec![TransactionOutput::new(value, vec![0x01; 20])],
        )
    }

    fn fund(utxo_set: &mut UtxoSet, tx: &Transaction, value: i64) {
        for input in &tx.inputs {
            utxo_set.add(
                input.outpoint(),
                UtxoEntry {
                    value,
                    pubkey_script: vec![0x02; 20],
                    block_height: 1,
                    is_coinbase: false,
                },
            );
        }
    }

    #[test]
    fn accepts_and_orders_by_fee_rate() {
        let mut pool = Mempool::new();
        let mut utxo_set = UtxoSet::new();

        let cheap = spend(b"a", 0, 99_000); // fee 1_000
        let pricey = spend(b"b", 0, 50_000); // fee 50_000
        fund(&mut utxo_set, &cheap, 100_000);
        fund(&mut utxo_set, &pricey, 100_000);

        assert!(pool.accept(cheap.clone(), &utxo_set));
        assert!(pool.accept(pricey.clone(), &utxo_set));
        assert_eq!(pool.len(), 2);

        let selected = pool.select(None);
        assert_eq!(selected[0].txid(), pricey.txid());
        assert_eq!(selected[1].txid(), cheap.txid());

        assert_eq!(pool.select(Some(1)).len(), 1);
    }

    #[test]
    fn rejects_duplicates_and_coinbase() {
        let mut pool = Mempool::new();
        let utxo_set = UtxoSet::new();

        let tx = spend(b"a", 0, 1_000);
        assert!(pool.accept(tx.clone(), &utxo_set));
        assert!(!pool.accept(tx, &utxo_set));

        let coinbase = Transaction::create_coinbase(1, vec![0xAA; 20], 50, 0);
        assert!(!pool.accept(coinbase, &utxo_set));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn first_seen_wins_on_conflicts() {
        let mut pool = Mempool::new();
        let utxo_set = UtxoSet::new();

        let first = spend(b"shared", 0, 1_000);
        let conflicting = spend(b"shared", 0, 2_000);

        assert!(pool.accept(first.clone(), &utxo_set));
        assert!(!pool.accept(conflicting, &utxo_set));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&first.txid()));
    }

    #[test]
    fn unresolvable_inputs_give_zero_fee_rate() {
        let mut pool = Mempool::new();
        let utxo_set = UtxoSet::new();
        let tx = spend(b"unknown", 0, 1_000);

        assert!(pool.accept(tx.clone(), &utxo_set));
        assert_eq!(pool.fee_index[0].0, 0.0);
    }

    #[test]
    fn negative_fee_clamps_to_zero() {
        let mut pool = Mempool::new();
        let mut utxo_set = UtxoSet::new();
        let tx = spend(b"a", 0, 10_000);
        fund(&mut utxo_set, &tx, 1_000); // outputs exceed inputs

        assert!(pool.accept(tx, &utxo_set));
        assert_eq!(pool.fee_index[0].0, 0.0);
    }

    #[test]
    fn purge_confirmed_removes_block_members() {
        let mut pool = Mempool::new();
        let utxo_set = UtxoSet::new();

        let confirmed = spend(b"a", 0, 1_000);
        let unrelated = spend(b"b", 0, 2_000);
        pool.accept(confirmed.clone(), &utxo_set);
        pool.accept(unrelated.clone(), &utxo_set);

        let coinbase = Transaction::create_coinbase(2, vec![0xAA; 20], 50, 0);
        let block = Block::new(
            crate::blockchain::block::BlockHeader {
                version: 1,
                previous_block_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp: 0,
                difficulty_bits: 0,
                nonce: 0,
            },
            vec![coinbase, confirmed.clone()],
        );

        assert_eq!(pool.purge_confirmed(&block), 1);
        assert!(!pool.contains(&confirmed.txid()));
        assert!(pool.contains(&unrelated.txid()));
    }

    #[test]
    fn requeue_drops_conflicts_silently() {
        let mut pool = Mempool::new();
        let utxo_set = UtxoSet::new();

        let member = spend(b"shared", 0, 1_000);
        pool.accept(member.clone(), &utxo_set);

        let conflicting = spend(b"shared", 0, 2_000);
        let fresh = spend(b"fresh", 0, 500);
        pool.requeue(vec![conflicting, fresh.clone()], &utxo_set);

        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&member.txid()));
        assert!(pool.contains(&fresh.txid()));
    }
}
