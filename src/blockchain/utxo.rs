//! The unspent transaction output set.
//!
//! The UTXO set is the ledger state: every spendable output keyed by its
//! outpoint. Blocks being connected remove the outputs their inputs consume
//! and add the outputs they create; reorganizations do the reverse. Cloning
//! the set gives the copy-on-branch semantics used by intra-block validation
//! and by the transactional reorganizer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::hash::Hash256;
use crate::error::{BlockchainError, Result};

/// A reference to a transaction output: `(txid, output index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        OutPoint { txid, index }
    }

    /// Parse the `"txid:index"` snapshot key form.
    pub fn from_key(key: &str) -> Result<OutPoint> {
        let (txid_part, index_part) = key
            .rsplit_once(':')
            .ok_or_else(|| BlockchainError::Decode(format!("malformed outpoint key '{key}'")))?;
        let txid = Hash256::from_display_hex(txid_part)?;
        let index = index_part
            .parse::<u32>()
            .map_err(|e| BlockchainError::Decode(format!("bad outpoint index '{index_part}': {e}")))?;
        Ok(OutPoint { txid, index })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Everything needed to validate and spend an output later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: i64,
    #[serde(with = "hex::serde")]
    pub pubkey_script: Vec<u8>,
    /// Height of the block that confirmed this output.
    pub block_height: u64,
    /// Coinbase outputs are subject to the maturity rule.
    pub is_coinbase: bool,
}

/// Aggregate statistics over the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UtxoStats {
    pub entries: u64,
    pub total_value: i64,
}

/// In-memory set of all unspent outputs. `Clone` is a deep copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
}

impl UtxoSet {
    pub fn new() -> Self {
        UtxoSet::default()
    }

    /// Insert a new unspent output.
    ///
    /// Overwriting an existing entry is a logic error in the caller, not
    /// adversarial input, so it panics.
    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        let previous = self.entries.insert(outpoint, entry);
        assert!(
            previous.is_none(),
            "duplicate UTXO insertion for {outpoint}"
        );
    }

    /// Remove and return an entry; `UtxoNotFound` if absent.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Result<UtxoEntry> {
        self.entries
            .remove(outpoint)
            .ok_or_else(|| BlockchainError::UtxoNotFound {
                outpoint: outpoint.to_string(),
            })
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All outputs locked by `pubkey_script`. Linear scan.
    pub fn utxos_for(&self, pubkey_script: &[u8]) -> Vec<(OutPoint, UtxoEntry)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.pubkey_script == pubkey_script)
            .map(|(outpoint, entry)| (*outpoint, entry.clone()))
            .collect()
    }

    /// Total value locked by `pubkey_script`. Linear scan.
    pub fn balance(&self, pubkey_script: &[u8]) -> i64 {
        self.entries
            .values()
            .filter(|entry| entry.pubkey_script == pubkey_script)
            .map(|entry| entry.value)
            .sum()
    }

    pub fn stats(&self) -> UtxoStats {
        UtxoStats {
            entries: self.entries.len() as u64,
            total_value: self.entries.values().map(|e| e.value).sum(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter()
    }

    /// Snapshot form: entries keyed `"txid:index"`, deterministically ordered.
    pub fn to_snapshot(&self) -> BTreeMap<String, UtxoEntry> {
        self.entries
            .iter()
            .map(|(outpoint, entry)| (outpoint.to_string(), entry.clone()))
            .collect()
    }

    pub fn from_snapshot(snapshot: &BTreeMap<String, UtxoEntry>) -> Result<UtxoSet> {
        let mut set = UtxoSet::new();
        for (key, entry) in snapshot {
            set.entries.insert(OutPoint::from_key(key)?, entry.clone());
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: i64, script: u8) -> UtxoEntry {
        UtxoEntry {
            value,
            pubkey_script: vec![script; 20],
            block_height: 1,
            is_coinbase: false,
        }
    }

    fn outpoint(tag: &str, index: u32) -> OutPoint {
        OutPoint::new(Hash256::digest(tag.as_bytes()), index)
    }

    #[test]
    fn add_get_remove() {
        let mut set = UtxoSet::new();
        let op = outpoint("tx", 0);
        set.add(op, entry(42, 0x01));

        assert!(set.contains(&op));
        assert_eq!(set.get(&op).unwrap().value, 42);

        let removed = set.remove(&op).unwrap();
        assert_eq!(removed.value, 42);
        assert!(!set.contains(&op));

        match set.remove(&op) {
            Err(BlockchainError::UtxoNotFound { .. }) => {}
            other => panic!("expected UtxoNotFound, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "duplicate UTXO insertion")]
    fn duplicate_insertion_panics() {
        let mut set = UtxoSet::new();
        let op = outpoint("tx", 0);
        set.add(op, entry(1, 0x01));
        set.add(op, entry(2, 0x01));
    }

    #[test]
    fn balance_and_scan_by_script() {
        let mut set = UtxoSet::new();
        set.add(outpoint("a", 0), entry(10, 0x01));
        set.add(outpoint("b", 0), entry(20, 0x01));
        set.add(outpoint("c", 0), entry(99, 0x02));

        assert_eq!(set.balance(&[0x01; 20]), 30);
        assert_eq!(set.balance(&[0x02; 20]), 99);
        assert_eq!(set.balance(&[0x03; 20]), 0);
        assert_eq!(set.utxos_for(&[0x01; 20]).len(), 2);
    }

    #[test]
    fn clone_is_independent() {
        let mut set = UtxoSet::new();
        let op = outpoint("a", 0);
        set.add(op, entry(10, 0x01));

        let mut copy = set.clone();
        copy.remove(&op).unwrap();
        copy.add(outpoint("b", 1), entry(5, 0x02));

        assert!(set.contains(&op));
        assert_eq!(set.len(), 1);
        assert_eq!(copy.len(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut set = UtxoSet::new();
        set.add(outpoint("a", 0), entry(10, 0x01));
        set.add(
            outpoint("b", 3),
            UtxoEntry {
                value: 7,
                pubkey_script: vec![0xEE; 20],
                block_height: 12,
                is_coinbase: true,
            },
        );

        let snapshot = set.to_snapshot();
        let restored = UtxoSet::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored, set);
    }

    #[test]
    fn outpoint_key_round_trip() {
        let op = outpoint("key", 7);
        assert_eq!(OutPoint::from_key(&op.to_string()).unwrap(), op);
        assert!(OutPoint::from_key("not-a-key").is_err());
        assert!(OutPoint::from_key("abcd:xyz").is_err());
    }

    #[test]
    fn stats_sum_values() {
        let mut set = UtxoSet::new();
        set.add(outpoint("a", 0), entry(10, 0x01));
        set.add(outpoint("b", 0), entry(32, 0x02));
        let stats = set.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_value, 42);
    }
}
