use thiserror::Error;

/// A consensus rule violation.
///
/// Each variant names the rule that fired and the offending entity. These are
/// protocol errors: `Blockchain::add_block` converts them into a rejection
/// while leaving chain state untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("block {hash} does not meet its difficulty target")]
    InvalidProofOfWork { hash: String },

    #[error("previous block {hash} not known")]
    UnknownParent { hash: String },

    #[error("merkle root mismatch: header has {header}, computed {computed}")]
    MerkleMismatch { header: String, computed: String },

    #[error("bad timestamp {timestamp}: {reason}")]
    BadTimestamp { timestamp: u32, reason: String },

    #[error("block size {size} bytes exceeds maximum of {max}")]
    BlockTooLarge { size: usize, max: usize },

    #[error("bad coinbase: {0}")]
    BadCoinbase(String),

    #[error("transaction structure invalid: {0}")]
    BadTransaction(String),

    #[error("coinbase output {outpoint} is immature: {confirmations} of {required} confirmations")]
    CoinbaseMaturity {
        outpoint: String,
        confirmations: u64,
        required: u64,
    },

    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("input {index} references missing UTXO {outpoint}")]
    InputMissing { index: usize, outpoint: String },

    #[error("bad signature on input {index}: {reason}")]
    BadSignature { index: usize, reason: String },

    #[error("duplicate txid {txid} within block")]
    DuplicateTxid { txid: String },

    #[error("bad difficulty bits: block has {got:#010x}, expected {expected:#010x}")]
    BadDifficulty { got: u32, expected: u32 },
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no common ancestor between {old_tip} and {new_tip}")]
    NoCommonAncestor { old_tip: String, new_tip: String },

    #[error("insufficient funds: need {needed} satoshis, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },

    #[error("base58check checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: String, got: String },

    #[error("mining cancelled")]
    MiningCancelled,

    #[error("mined block was rejected by the chain")]
    BlockRejected,

    #[error("UTXO not found: {outpoint}")]
    UtxoNotFound { outpoint: String },

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("key error: {0}")]
    Key(#[from] secp256k1::Error),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BlockchainError>;
