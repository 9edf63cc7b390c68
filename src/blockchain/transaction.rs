//! Transaction data model and wire serialization.
//!
//! A transaction consumes unspent outputs through its inputs and creates new
//! outputs; the value difference is the fee. The txid is the double SHA-256
//! of the wire serialization. A coinbase transaction has a single input with
//! a zero previous txid and an output index of `0xFFFFFFFF`, and carries the
//! block height plus an extra nonce in its signature script (BIP-34 style).

use serde::{Deserialize, Serialize};

use crate::blockchain::reward::DUST_THRESHOLD;
use crate::blockchain::utxo::{OutPoint, UtxoSet};
use crate::crypto::hash::Hash256;
use crate::encoding::{varint_len, write_varint, SliceReader};
use crate::error::{BlockchainError, Result};

/// Output index marking a coinbase input.
pub const COINBASE_OUTPUT_INDEX: u32 = 0xFFFF_FFFF;

/// Default sequence number (final).
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// A transaction output: a value locked by a script.
///
/// In the simplified P2PKH model the `pubkey_script` is the 20-byte hash160
/// of the recipient's compressed public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: i64,
    #[serde(with = "hex::serde")]
    pub pubkey_script: Vec<u8>,
}

impl TransactionOutput {
    pub fn new(value: i64, pubkey_script: Vec<u8>) -> Self {
        TransactionOutput {
            value,
            pubkey_script,
        }
    }

    /// Outputs below the dust threshold are uneconomical to spend.
    /// Informational only; not a consensus rule here.
    pub fn is_dust(&self) -> bool {
        self.value < DUST_THRESHOLD
    }

    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        write_varint(buf, self.pubkey_script.len() as u64);
        buf.extend_from_slice(&self.pubkey_script);
    }

    pub fn read_from(reader: &mut SliceReader<'_>) -> Result<Self> {
        let value = reader.read_i64_le()?;
        let script_len = reader.read_varint()? as usize;
        let pubkey_script = reader.read_bytes(script_len)?.to_vec();
        Ok(TransactionOutput {
            value,
            pubkey_script,
        })
    }
}

/// A transaction input: a reference to a previous output plus the unlocking
/// script that authorizes the spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub previous_txid: Hash256,
    pub previous_output_index: u32,
    #[serde(with = "hex::serde")]
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl TransactionInput {
    pub fn new(previous_txid: Hash256, previous_output_index: u32) -> Self {
        TransactionInput {
            previous_txid,
            previous_output_index,
            signature_script: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }

    /// The outpoint this input consumes.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.previous_txid,
            index: self.previous_output_index,
        }
    }

    /// A coinbase input has an all-zeros previous txid and the sentinel
    /// output index.
    pub fn is_coinbase(&self) -> bool {
        self.previous_txid.is_zero() && self.previous_output_index == COINBASE_OUTPUT_INDEX
    }

    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        // txid is stored internally in wire order already
        buf.extend_from_slice(&self.previous_txid.0);
        buf.extend_from_slice(&self.previous_output_index.to_le_bytes());
        write_varint(buf, self.signature_script.len() as u64);
        buf.extend_from_slice(&self.signature_script);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }

    pub fn read_from(reader: &mut SliceReader<'_>) -> Result<Self> {
        let mut txid = [0u8; 32];
        txid.copy_from_slice(reader.read_bytes(32)?);
        let previous_output_index = reader.read_u32_le()?;
        let script_len = reader.read_varint()? as usize;
        let signature_script = reader.read_bytes(script_len)?.to_vec();
        let sequence = reader.read_u32_le()?;
        Ok(TransactionInput {
            previous_txid: Hash256(txid),
            previous_output_index,
            signature_script,
            sequence,
        })
    }
}

/// A complete transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub locktime: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>) -> Self {
        Transaction {
            version: 1,
            inputs,
            outputs,
            locktime: 0,
        }
    }

    /// The transaction ID: double SHA-256 of the serialization, kept in
    /// internal byte order (display form is reversed hex).
    pub fn txid(&self) -> Hash256 {
        Hash256::digest(&self.serialize())
    }

    /// Wire serialization:
    /// `version ‖ varint(|inputs|) ‖ inputs ‖ varint(|outputs|) ‖ outputs ‖ locktime`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.serialize_into(&mut buf);
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.serialize_into(&mut buf);
        }
        buf.extend_from_slice(&self.locktime.to_le_bytes());
        buf
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + varint_len(self.inputs.len() as u64);
        for input in &self.inputs {
            size += 32 + 4 + varint_len(input.signature_script.len() as u64);
            size += input.signature_script.len() + 4;
        }
        size += varint_len(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8 + varint_len(output.pubkey_script.len() as u64);
            size += output.pubkey_script.len();
        }
        size + 4
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);
        let tx = Transaction::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(BlockchainError::Decode(format!(
                "{} trailing bytes after transaction",
                reader.remaining()
            )));
        }
        Ok(tx)
    }

    pub fn read_from(reader: &mut SliceReader<'_>) -> Result<Self> {
        let version = reader.read_u32_le()?;
        let input_count = reader.read_varint()? as usize;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TransactionInput::read_from(reader)?);
        }
        let output_count = reader.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TransactionOutput::read_from(reader)?);
        }
        let locktime = reader.read_u32_le()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    /// A coinbase transaction has exactly one input, and it is the coinbase
    /// input pattern.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// Sum of consumed input values looked up in `utxo_set`.
    pub fn total_input_value(&self, utxo_set: &UtxoSet) -> Result<i64> {
        let mut total = 0i64;
        for input in &self.inputs {
            let outpoint = input.outpoint();
            let entry = utxo_set
                .get(&outpoint)
                .ok_or_else(|| BlockchainError::UtxoNotFound {
                    outpoint: outpoint.to_string(),
                })?;
            total += entry.value;
        }
        Ok(total)
    }

    /// Transaction fee: inputs minus outputs. Zero for coinbase.
    pub fn fee(&self, utxo_set: &UtxoSet) -> Result<i64> {
        if self.is_coinbase() {
            return Ok(0);
        }
        Ok(self.total_input_value(utxo_set)? - self.total_output_value())
    }

    /// The digest that input signatures commit to: double SHA-256 of the
    /// transaction serialized with every signature script empty
    /// (whole-transaction SIGHASH-ALL style, no per-input substitution).
    pub fn signature_hash(&self) -> [u8; 32] {
        let mut unsigned = self.clone();
        for input in &mut unsigned.inputs {
            input.signature_script.clear();
        }
        crate::crypto::hash::double_sha256(&unsigned.serialize())
    }

    /// Build the coinbase transaction for a block at `height`.
    ///
    /// The signature script is `[len(height_le)] ‖ height_le ‖ extra_nonce(8, LE)`;
    /// the trailing eight bytes are the miner's extra-nonce field.
    pub fn create_coinbase(
        height: u64,
        reward_script: Vec<u8>,
        reward_amount: i64,
        extra_nonce: u64,
    ) -> Transaction {
        let height_bytes = if height == 0 {
            vec![0u8]
        } else {
            let le = height.to_le_bytes();
            let used = 8 - le.iter().rev().take_while(|&&b| b == 0).count();
            le[..used].to_vec()
        };

        let mut script = Vec::with_capacity(1 + height_bytes.len() + 8);
        script.push(height_bytes.len() as u8);
        script.extend_from_slice(&height_bytes);
        script.extend_from_slice(&extra_nonce.to_le_bytes());

        let input = TransactionInput {
            previous_txid: Hash256::ZERO,
            previous_output_index: COINBASE_OUTPUT_INDEX,
            signature_script: script,
            sequence: SEQUENCE_FINAL,
        };
        let output = TransactionOutput::new(reward_amount, reward_script);

        Transaction::new(vec![input], vec![output])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::utxo::UtxoEntry;

    fn sample_tx() -> Transaction {
        let input = TransactionInput {
            previous_txid: Hash256::digest(b"previous"),
            previous_output_index: 1,
            signature_script: b"3045... 02ab...".to_vec(),
            sequence: SEQUENCE_FINAL,
        };
        let outputs = vec![
            TransactionOutput::new(70_000, vec![0x11; 20]),
            TransactionOutput::new(25_000, vec![0x22; 20]),
        ];
        Transaction::new(vec![input], outputs)
    }

    #[test]
    fn serialization_round_trip() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        assert_eq!(bytes.len(), tx.serialized_size());

        let restored = Transaction::deserialize(&bytes).unwrap();
        assert_eq!(restored, tx);
        assert_eq!(restored.txid(), tx.txid());
    }

    #[test]
    fn deserialize_rejects_trailing_bytes() {
        let mut bytes = sample_tx().serialize();
        bytes.push(0x00);
        assert!(Transaction::deserialize(&bytes).is_err());
    }

    #[test]
    fn coinbase_detection() {
        let coinbase = Transaction::create_coinbase(5, vec![0xAB; 20], 50_0000_0000, 0);
        assert!(coinbase.is_coinbase());
        assert!(coinbase.inputs[0].is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn coinbase_script_embeds_height_and_extra_nonce() {
        let coinbase = Transaction::create_coinbase(0x0203, vec![0xAB; 20], 1, 7);
        let script = &coinbase.inputs[0].signature_script;
        assert_eq!(script[0], 2); // two height bytes
        assert_eq!(&script[1..3], &[0x03, 0x02]); // little-endian height
        assert_eq!(&script[3..], &7u64.to_le_bytes());

        // Genesis height serializes as a single zero byte.
        let genesis = Transaction::create_coinbase(0, vec![], 1, 0);
        assert_eq!(genesis.inputs[0].signature_script[..2], [1, 0]);
    }

    #[test]
    fn different_extra_nonce_changes_txid() {
        let a = Transaction::create_coinbase(1, vec![0xAB; 20], 1, 0);
        let b = Transaction::create_coinbase(1, vec![0xAB; 20], 1, 1);
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn fee_from_utxo_set() {
        let tx = sample_tx();
        let mut utxo_set = UtxoSet::new();
        utxo_set.add(
            tx.inputs[0].outpoint(),
            UtxoEntry {
                value: 100_000,
                pubkey_script: vec![0x33; 20],
                block_height: 1,
                is_coinbase: false,
            },
        );

        assert_eq!(tx.fee(&utxo_set).unwrap(), 5_000);

        let empty = UtxoSet::new();
        assert!(tx.fee(&empty).is_err());
    }

    #[test]
    fn signature_hash_ignores_signature_scripts() {
        let mut tx = sample_tx();
        let before = tx.signature_hash();
        tx.inputs[0].signature_script = b"different signature".to_vec();
        assert_eq!(tx.signature_hash(), before);
        tx.outputs[0].value += 1;
        assert_ne!(tx.signature_hash(), before);
    }

    #[test]
    fn dust_outputs_reported() {
        assert!(TransactionOutput::new(545, vec![]).is_dust());
        assert!(!TransactionOutput::new(546, vec![]).is_dust());
    }
}
