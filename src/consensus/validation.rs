//! Consensus validation rules.
//!
//! Every candidate block runs through `validate_block`, cheapest checks
//! first so invalid work is rejected before any expensive UTXO or signature
//! processing. Transaction checks operate on a clone of the UTXO set so that
//! intra-block spends are visible to later transactions without touching the
//! canonical state.

use std::collections::HashSet;

use crate::blockchain::block::Block;
use crate::blockchain::chain::Blockchain;
use crate::blockchain::reward::{block_reward, MAX_MONEY};
use crate::blockchain::transaction::Transaction;
use crate::blockchain::utxo::{UtxoEntry, UtxoSet};
use crate::crypto::hash::hash160;
use crate::crypto::keys::PublicKey;
use crate::error::ValidationError;

use super::unix_time;

/// Maximum serialized block size in bytes (legacy 1 MB limit).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Confirmations required before a coinbase output may be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// Number of preceding blocks whose timestamps feed the median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum seconds a header timestamp may run ahead of wall clock.
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;

/// How strictly input signatures are enforced.
///
/// `Strict` (consensus mode, the default) rejects anything that does not
/// carry a verifiable `"<sig_hex> <pubkey_hex>"` script. `Lenient` accepts
/// scripts that cannot be parsed at all, for hand-built demo transactions;
/// parseable scripts are still fully verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum SignaturePolicy {
    #[default]
    Strict,
    Lenient,
}

// ----------------------------------------------------------------------
// Block validation
// ----------------------------------------------------------------------

/// Validate `block` against chain context, with `utxo` as the spendable set.
///
/// `utxo` is the best-chain set for normal acceptance, or the evolving
/// snapshot during a reorganization.
pub fn validate_block(
    chain: &Blockchain,
    block: &Block,
    utxo: &UtxoSet,
) -> Result<(), ValidationError> {
    let block_hash = block.hash();

    // 1. Proof-of-work.
    if !block.header.meets_difficulty_target() {
        return Err(ValidationError::InvalidProofOfWork {
            hash: block_hash.to_string(),
        });
    }

    // 2. Parent must be known (or this is a genesis block).
    let prev_hash = block.header.previous_block_hash;
    let is_genesis = prev_hash.is_zero();
    let height = if is_genesis {
        0
    } else {
        chain
            .height_of(&prev_hash)
            .ok_or_else(|| ValidationError::UnknownParent {
                hash: prev_hash.to_string(),
            })?
            + 1
    };

    // 3. Merkle commitment.
    let computed_root = block.compute_merkle_root();
    if computed_root != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch {
            header: block.header.merkle_root.to_string(),
            computed: computed_root.to_string(),
        });
    }

    // 4. Timestamp rules (genesis is constructed, never received).
    if !is_genesis {
        let previous = chain.previous_timestamps(&prev_hash, MEDIAN_TIME_SPAN);
        validate_timestamp(block.header.timestamp, &previous, unix_time())?;
    }

    // 5. Size limit.
    let size = block.serialized_size();
    if size > MAX_BLOCK_SIZE {
        return Err(ValidationError::BlockTooLarge {
            size,
            max: MAX_BLOCK_SIZE,
        });
    }

    // 6. Coinbase structure.
    validate_coinbase_structure(block)?;

    // 7. Transaction set, tracking fees for the coinbase bound.
    let total_fees = if is_genesis {
        0
    } else {
        validate_block_transactions(
            block,
            utxo,
            height,
            chain.coinbase_maturity(),
            chain.signature_policy(),
        )?
    };

    let coinbase_total = block.transactions[0].total_output_value();
    let max_allowed = block_reward(height) + total_fees;
    if coinbase_total > max_allowed {
        return Err(ValidationError::BadCoinbase(format!(
            "coinbase outputs {coinbase_total} exceed subsidy plus fees {max_allowed}"
        )));
    }

    // 8. No duplicate txids.
    validate_no_duplicate_txids(&block.transactions)?;

    // 9. Expected difficulty for this height on this branch.
    if !is_genesis {
        let expected = chain.next_bits(&prev_hash, height);
        if block.header.difficulty_bits != expected {
            return Err(ValidationError::BadDifficulty {
                got: block.header.difficulty_bits,
                expected,
            });
        }
    }

    Ok(())
}

/// Rules on the coinbase position: the first transaction must be a coinbase,
/// no other may be, and its outputs must be within monetary bounds.
fn validate_coinbase_structure(block: &Block) -> Result<(), ValidationError> {
    let Some(first) = block.transactions.first() else {
        return Err(ValidationError::BadCoinbase(
            "block has no transactions".into(),
        ));
    };
    if !first.is_coinbase() {
        return Err(ValidationError::BadCoinbase(
            "first transaction is not a coinbase".into(),
        ));
    }
    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_coinbase() {
            return Err(ValidationError::BadCoinbase(format!(
                "transaction at index {i} is a coinbase"
            )));
        }
    }
    check_output_amounts(first)?;
    Ok(())
}

/// Validate every non-coinbase transaction against a snapshot of `utxo`,
/// supporting intra-block dependencies. Returns the sum of fees.
pub fn validate_block_transactions(
    block: &Block,
    utxo: &UtxoSet,
    height: u64,
    maturity: u64,
    policy: SignaturePolicy,
) -> Result<i64, ValidationError> {
    let mut working = utxo.clone();
    let mut total_fees = 0i64;

    for (i, tx) in block.transactions.iter().enumerate() {
        if i == 0 && tx.is_coinbase() {
            continue;
        }

        total_fees += validate_transaction(tx, &working, height, maturity, policy)?;

        // Reflect this transaction in the snapshot so later transactions in
        // the block can spend its outputs but not double-spend its inputs.
        for input in &tx.inputs {
            working
                .remove(&input.outpoint())
                .expect("validated input exists in working set");
        }
        let txid = tx.txid();
        for (index, output) in tx.outputs.iter().enumerate() {
            working.add(
                crate::blockchain::utxo::OutPoint::new(txid, index as u32),
                UtxoEntry {
                    value: output.value,
                    pubkey_script: output.pubkey_script.clone(),
                    block_height: height,
                    is_coinbase: false,
                },
            );
        }
    }

    Ok(total_fees)
}

// ----------------------------------------------------------------------
// Transaction validation
// ----------------------------------------------------------------------

/// Validate a single non-coinbase transaction against `utxo` for inclusion
/// at `height`. Returns the fee it pays.
pub fn validate_transaction(
    tx: &Transaction,
    utxo: &UtxoSet,
    height: u64,
    maturity: u64,
    policy: SignaturePolicy,
) -> Result<i64, ValidationError> {
    if tx.is_coinbase() {
        return Err(ValidationError::BadTransaction(
            "coinbase outside the first block position".into(),
        ));
    }
    if tx.inputs.is_empty() {
        return Err(ValidationError::BadTransaction("no inputs".into()));
    }
    if tx.outputs.is_empty() {
        return Err(ValidationError::BadTransaction("no outputs".into()));
    }

    check_output_amounts(tx)?;

    let mut total_input = 0i64;
    for (i, input) in tx.inputs.iter().enumerate() {
        if input.is_coinbase() {
            return Err(ValidationError::BadTransaction(format!(
                "coinbase input at index {i} in a regular transaction"
            )));
        }

        let outpoint = input.outpoint();
        let entry = utxo
            .get(&outpoint)
            .ok_or_else(|| ValidationError::InputMissing {
                index: i,
                outpoint: outpoint.to_string(),
            })?;

        if entry.is_coinbase {
            let confirmations = height.saturating_sub(entry.block_height);
            if confirmations < maturity {
                return Err(ValidationError::CoinbaseMaturity {
                    outpoint: outpoint.to_string(),
                    confirmations,
                    required: maturity,
                });
            }
        }

        check_input_signature(tx, i, entry, policy)?;
        total_input += entry.value;
    }

    let total_output = tx.total_output_value();
    if total_output > total_input {
        return Err(ValidationError::AmountOutOfRange(format!(
            "outputs {total_output} exceed inputs {total_input}"
        )));
    }

    Ok(total_input - total_output)
}

/// Monetary bounds common to all transactions: no negative output, no
/// output above `MAX_MONEY`, total within `MAX_MONEY`.
fn check_output_amounts(tx: &Transaction) -> Result<(), ValidationError> {
    let mut total = 0i64;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 {
            return Err(ValidationError::AmountOutOfRange(format!(
                "output {i} has negative value {}",
                output.value
            )));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationError::AmountOutOfRange(format!(
                "output {i} value {} exceeds MAX_MONEY",
                output.value
            )));
        }
        total += output.value;
        if total > MAX_MONEY {
            return Err(ValidationError::AmountOutOfRange(format!(
                "total output value {total} exceeds MAX_MONEY"
            )));
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Signature checking (simplified P2PKH)
// ----------------------------------------------------------------------

/// Verify the unlocking script of input `index` against the consumed entry.
///
/// The script is the ASCII concatenation `"<der_sig_hex> <pubkey_hex>"`. The
/// public key must hash (hash160) to the entry's 20-byte script, and the
/// signature must verify over the transaction's signature hash.
pub fn check_input_signature(
    tx: &Transaction,
    index: usize,
    entry: &UtxoEntry,
    policy: SignaturePolicy,
) -> Result<(), ValidationError> {
    let reject = |reason: &str| ValidationError::BadSignature {
        index,
        reason: reason.to_string(),
    };
    let unparseable = |reason: &str| {
        if policy == SignaturePolicy::Lenient {
            log::warn!(
                "accepting input {index} of {} with unparseable signature script: {reason}",
                tx.txid().short()
            );
            Ok(())
        } else {
            Err(reject(reason))
        }
    };

    let script = &tx.inputs[index].signature_script;
    if script.is_empty() {
        return unparseable("empty signature script");
    }
    let Ok(text) = std::str::from_utf8(script) else {
        return unparseable("script is not ASCII");
    };
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() != 2 {
        return unparseable("expected '<sig_hex> <pubkey_hex>'");
    }
    let Ok(signature) = hex::decode(parts[0]) else {
        return unparseable("signature is not valid hex");
    };
    let Ok(pubkey_bytes) = hex::decode(parts[1]) else {
        return unparseable("public key is not valid hex");
    };

    if hash160(&pubkey_bytes).as_slice() != entry.pubkey_script.as_slice() {
        return Err(reject("public key does not hash to the locking script"));
    }

    let Ok(public_key) = PublicKey::from_slice(&pubkey_bytes) else {
        return unparseable("public key is not a valid curve point");
    };

    // Signatures commit to the transaction with every signature script
    // empty (whole-transaction SIGHASH-ALL, no per-input substitution).
    let mut unsigned = tx.clone();
    for input in &mut unsigned.inputs {
        input.signature_script.clear();
    }
    if !public_key.verify(&unsigned.serialize(), &signature) {
        return Err(reject("ECDSA verification failed"));
    }

    Ok(())
}

// ----------------------------------------------------------------------
// Timestamp rules
// ----------------------------------------------------------------------

/// Lower median: for an even count the smaller of the two middle values,
/// matching Bitcoin Core's integer behavior.
pub fn median_time(timestamps: &[u32]) -> u32 {
    assert!(!timestamps.is_empty(), "median of empty timestamp list");
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        sorted[mid - 1]
    }
}

/// Median-time-past plus the future-time bound.
///
/// With at least `MEDIAN_TIME_SPAN` predecessors, the timestamp must be
/// strictly greater than their median; it must never exceed wall clock by
/// more than `MAX_FUTURE_BLOCK_TIME`.
pub fn validate_timestamp(
    timestamp: u32,
    previous_timestamps: &[u32],
    now: u32,
) -> Result<(), ValidationError> {
    if previous_timestamps.len() >= MEDIAN_TIME_SPAN {
        let median = median_time(&previous_timestamps[..MEDIAN_TIME_SPAN]);
        if timestamp <= median {
            return Err(ValidationError::BadTimestamp {
                timestamp,
                reason: format!("not greater than median-time-past {median}"),
            });
        }
    }

    let max_allowed = now.saturating_add(MAX_FUTURE_BLOCK_TIME);
    if timestamp > max_allowed {
        return Err(ValidationError::BadTimestamp {
            timestamp,
            reason: format!("more than {MAX_FUTURE_BLOCK_TIME}s ahead of wall clock {now}"),
        });
    }

    Ok(())
}

/// No two transactions in a block may share a txid.
pub fn validate_no_duplicate_txids(transactions: &[Transaction]) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(transactions.len());
    for tx in transactions {
        let txid = tx.txid();
        if !seen.insert(txid) {
            return Err(ValidationError::DuplicateTxid {
                txid: txid.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{TransactionInput, TransactionOutput};
    use crate::blockchain::utxo::OutPoint;
    use crate::config::NetworkType;
    use crate::crypto::hash::Hash256;
    use crate::crypto::keys::KeyPair;

    fn funded_utxo(script: Vec<u8>, value: i64, height: u64, coinbase: bool) -> (UtxoSet, OutPoint) {
        let mut set = UtxoSet::new();
        let outpoint = OutPoint::new(Hash256::digest(b"funding"), 0);
        set.add(
            outpoint,
            UtxoEntry {
                value,
                pubkey_script: script,
                block_height: height,
                is_coinbase: coinbase,
            },
        );
        (set, outpoint)
    }

    fn signed_spend(pair: &KeyPair, outpoint: OutPoint, outputs: Vec<TransactionOutput>) -> Transaction {
        let mut tx = Transaction::new(
            vec![TransactionInput::new(outpoint.txid, outpoint.index)],
            outputs,
        );
        let signature = pair.private_key.sign(&tx.serialize());
        let script = format!(
            "{} {}",
            hex::encode(signature),
            hex::encode(pair.public_key.serialize_compressed())
        );
        tx.inputs[0].signature_script = script.into_bytes();
        tx
    }

    #[test]
    fn valid_signed_transaction_passes_strict() {
        let pair = KeyPair::generate(NetworkType::Mainnet);
        let (utxo, outpoint) = funded_utxo(pair.pubkey_script(), 100_000, 1, false);
        let tx = signed_spend(&pair, outpoint, vec![TransactionOutput::new(90_000, vec![0x01; 20])]);

        let fee = validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict).unwrap();
        assert_eq!(fee, 10_000);
    }

    #[test]
    fn missing_input_is_reported() {
        let pair = KeyPair::generate(NetworkType::Mainnet);
        let utxo = UtxoSet::new();
        let tx = signed_spend(
            &pair,
            OutPoint::new(Hash256::digest(b"nowhere"), 0),
            vec![TransactionOutput::new(1, vec![0x01; 20])],
        );
        match validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict) {
            Err(ValidationError::InputMissing { index: 0, .. }) => {}
            other => panic!("expected InputMissing, got {other:?}"),
        }
    }

    #[test]
    fn immature_coinbase_is_rejected_until_100_confirmations() {
        let pair = KeyPair::generate(NetworkType::Mainnet);
        let (utxo, outpoint) = funded_utxo(pair.pubkey_script(), 100_000, 0, true);
        let tx = signed_spend(&pair, outpoint, vec![TransactionOutput::new(90_000, vec![0x01; 20])]);

        // Height 99: only 99 confirmations.
        match validate_transaction(&tx, &utxo, 99, COINBASE_MATURITY, SignaturePolicy::Strict) {
            Err(ValidationError::CoinbaseMaturity {
                confirmations: 99,
                required: 100,
                ..
            }) => {}
            other => panic!("expected CoinbaseMaturity, got {other:?}"),
        }

        // Height 100: exactly mature.
        assert!(validate_transaction(&tx, &utxo, 100, COINBASE_MATURITY, SignaturePolicy::Strict).is_ok());
    }

    #[test]
    fn outputs_exceeding_inputs_are_rejected() {
        let pair = KeyPair::generate(NetworkType::Mainnet);
        let (utxo, outpoint) = funded_utxo(pair.pubkey_script(), 1_000, 1, false);
        let tx = signed_spend(&pair, outpoint, vec![TransactionOutput::new(2_000, vec![0x01; 20])]);

        match validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict) {
            Err(ValidationError::AmountOutOfRange(_)) => {}
            other => panic!("expected AmountOutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn negative_and_oversized_outputs_are_rejected() {
        let pair = KeyPair::generate(NetworkType::Mainnet);
        let (utxo, outpoint) = funded_utxo(pair.pubkey_script(), 1_000, 1, false);

        let negative = signed_spend(&pair, outpoint, vec![TransactionOutput::new(-1, vec![])]);
        assert!(matches!(
            validate_transaction(&negative, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict),
            Err(ValidationError::AmountOutOfRange(_))
        ));

        let oversized = signed_spend(
            &pair,
            outpoint,
            vec![TransactionOutput::new(MAX_MONEY + 1, vec![])],
        );
        assert!(matches!(
            validate_transaction(&oversized, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict),
            Err(ValidationError::AmountOutOfRange(_))
        ));
    }

    #[test]
    fn wrong_key_fails_hash160_contract() {
        let owner = KeyPair::generate(NetworkType::Mainnet);
        let thief = KeyPair::generate(NetworkType::Mainnet);
        let (utxo, outpoint) = funded_utxo(owner.pubkey_script(), 100_000, 1, false);
        let tx = signed_spend(&thief, outpoint, vec![TransactionOutput::new(1_000, vec![0x01; 20])]);

        match validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict) {
            Err(ValidationError::BadSignature { .. }) => {}
            other => panic!("expected BadSignature, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_signature_fails_verification() {
        let pair = KeyPair::generate(NetworkType::Mainnet);
        let (utxo, outpoint) = funded_utxo(pair.pubkey_script(), 100_000, 1, false);
        let mut tx = signed_spend(&pair, outpoint, vec![TransactionOutput::new(1_000, vec![0x01; 20])]);
        // Tamper with an output after signing.
        tx.outputs[0].value = 2_000;

        assert!(matches!(
            validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict),
            Err(ValidationError::BadSignature { .. })
        ));
    }

    #[test]
    fn lenient_policy_accepts_unparseable_scripts_only() {
        let pair = KeyPair::generate(NetworkType::Mainnet);
        let (utxo, outpoint) = funded_utxo(pair.pubkey_script(), 100_000, 1, false);

        let mut tx = Transaction::new(
            vec![TransactionInput::new(outpoint.txid, outpoint.index)],
            vec![TransactionOutput::new(1_000, vec![0x01; 20])],
        );

        // Empty script: rejected strictly, accepted leniently.
        assert!(validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Strict).is_err());
        assert!(validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Lenient).is_ok());

        // Parseable script with the wrong key stays rejected either way.
        let thief = KeyPair::generate(NetworkType::Mainnet);
        let signature = thief.private_key.sign(&tx.serialize());
        tx.inputs[0].signature_script = format!(
            "{} {}",
            hex::encode(signature),
            hex::encode(thief.public_key.serialize_compressed())
        )
        .into_bytes();
        assert!(validate_transaction(&tx, &utxo, 2, COINBASE_MATURITY, SignaturePolicy::Lenient).is_err());
    }

    #[test]
    fn median_uses_lower_middle_for_even_counts() {
        assert_eq!(median_time(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(median_time(&[1, 2, 3, 4]), 2);
        assert_eq!(median_time(&[5, 1, 3, 2, 4]), 3);
    }

    #[test]
    fn timestamp_rules() {
        let now = 1_000_000;

        // Fewer than 11 predecessors: only the future bound applies.
        assert!(validate_timestamp(now, &[1, 2, 3], now).is_ok());
        assert!(validate_timestamp(now + MAX_FUTURE_BLOCK_TIME + 1, &[], now).is_err());
        assert!(validate_timestamp(now + MAX_FUTURE_BLOCK_TIME, &[], now).is_ok());

        // Eleven predecessors: must exceed the median strictly.
        let previous: Vec<u32> = (100..111).collect();
        let median = median_time(&previous);
        assert!(validate_timestamp(median, &previous, now).is_err());
        assert!(validate_timestamp(median + 1, &previous, now).is_ok());
    }

    #[test]
    fn duplicate_txids_detected() {
        let tx = Transaction::create_coinbase(1, vec![0xAA; 20], 50, 0);
        let other = Transaction::create_coinbase(1, vec![0xBB; 20], 50, 0);

        assert!(validate_no_duplicate_txids(&[tx.clone(), other.clone()]).is_ok());
        assert!(matches!(
            validate_no_duplicate_txids(&[tx.clone(), other, tx]),
            Err(ValidationError::DuplicateTxid { .. })
        ));
    }
}
