//! Error types for consensus validation.
//!
//! [`RuleError`] covers consensus rejections: the block (or transaction) is
//! invalid and stays invalid. [`ValidateError`] additionally carries the I/O
//! failures of the state and cross-chain layers, which a caller may retry,
//! and cancellation, which is neither.

use braid_cross::CrossError;
use braid_primitives::Hash256;
use braid_state::StateError;
use thiserror::Error;

/// Consensus rule violations.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("unexpected difficulty: {0}")]
    UnexpectedDifficulty(String),

    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("block timestamp of {timestamp} is not after expected {median}")]
    TimeTooOld { timestamp: i64, median: i64 },

    #[error("block timestamp of {timestamp} is too far in the future")]
    TimeTooNew { timestamp: i64 },

    #[error("block does not contain any transactions")]
    NoTransactions,

    #[error("transaction has no inputs")]
    NoTxInputs,

    #[error("transaction has no outputs")]
    NoTxOutputs,

    #[error("serialized transaction is too big - got {size}, max {max}")]
    TxTooBig { size: usize, max: usize },

    #[error("serialized transaction is too small - got {size}, min {min}")]
    TxTooSmall { size: usize, min: usize },

    #[error("transaction has too many sigops - got {got}, max {max}")]
    TxTooManySigOps { got: usize, max: usize },

    #[error("bad transaction output value: {0}")]
    BadTxOutValue(String),

    #[error("bad transaction input: {0}")]
    BadTxInput(String),

    #[error("transaction contains duplicate inputs")]
    DuplicateTxInputs,

    #[error("block contains duplicate transaction {0}")]
    DuplicateTx(Hash256),

    #[error("coinbase script length of {length} is out of range (min: {min}, max: {max})")]
    BadCoinbaseScriptLen {
        length: usize,
        min: usize,
        max: usize,
    },

    #[error("first transaction in block is not a coinbase")]
    FirstTxNotCoinbase,

    #[error("block contains second coinbase at index {0}")]
    MultipleCoinbases(usize),

    #[error("block merkle root is invalid - header indicates {header}, but calculated value is {calculated}")]
    BadMerkleRoot {
        header: Hash256,
        calculated: Hash256,
    },

    #[error("transactions are not in lexicographical order")]
    InvalidTxOrder,

    #[error("missing coinbase height: {0}")]
    MissingCoinbaseHeight(String),

    #[error("coinbase serialized block height is {got} when {want} was expected")]
    BadCoinbaseHeight { got: i32, want: i32 },

    #[error("block at height {0} does not match checkpoint hash")]
    BadCheckpoint(i32),

    #[error("block at height {height} forks the main chain before the previous checkpoint at height {checkpoint}")]
    ForkTooOld { height: i32, checkpoint: i32 },

    #[error("previous block mismatch: {0}")]
    PrevBlockNotBest(String),

    #[error("block too big: {0}")]
    BlockTooBig(String),

    #[error("block contains unfinalized transaction: {0}")]
    UnfinalizedTx(String),

    #[error("missing txout: {0}")]
    MissingTxOut(String),

    #[error("spent txout: {0}")]
    SpentTxOut(String),

    #[error("immature spend: {0}")]
    ImmatureSpend(String),

    #[error("spend too high: {0}")]
    SpendTooHigh(String),

    #[error("bad fees: {0}")]
    BadFees(String),

    #[error("too many signature operations: {0}")]
    TooManySigOps(String),

    #[error("bad coinbase value: {0}")]
    BadCoinbaseValue(String),

    #[error("high hash: {0}")]
    HighHash(String),

    #[error("unordered entangle tx in the block")]
    EntangleUnordered,

    #[error("the pool{pool} reward was wrong [{got}, expected:{expected}] height:{height}")]
    EntanglePoolMismatch {
        pool: u8,
        got: i64,
        expected: i64,
        height: i32,
    },

    #[error("not match the entangle amount [{got}, {expected}]")]
    EntangleAmountMismatch { got: i64, expected: i64 },

    #[error("script validation failed: {0}")]
    ScriptValidation(String),

    /// An internal invariant did not hold (corrupt index, missing ancestor).
    #[error("assertion failed: {0}")]
    Assertion(String),
}

/// Any failure surfaced by block validation.
#[derive(Error, Debug)]
pub enum ValidateError {
    /// A consensus rule rejection; the block is invalid.
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// A state-layer failure (utxo cache I/O, cancellation).
    #[error(transparent)]
    State(#[from] StateError),

    /// A cross-chain failure (entangle rule rejections and foreign RPC I/O).
    #[error(transparent)]
    Cross(#[from] CrossError),
}

impl ValidateError {
    /// Whether the failure is retryable I/O rather than a rule rejection.
    pub fn is_io(&self) -> bool {
        match self {
            ValidateError::Rule(_) => false,
            ValidateError::State(err) => err.is_io(),
            ValidateError::Cross(err) => err.is_io(),
        }
    }

    /// Whether the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ValidateError::State(StateError::Cancelled) | ValidateError::Cross(CrossError::Cancelled)
        )
    }
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ValidateError>;
