//! Error types for cross-chain verification.

use thiserror::Error;

/// Cross-chain errors.
#[derive(Error, Debug)]
pub enum CrossError {
    /// The transaction carries no entangle outputs.
    #[error("not an entangle tx")]
    NotEntangleTx,

    /// A serialized entangle or keeped-amount payload is malformed.
    #[error("bad payload: {0}")]
    BadPayload(String),

    /// The same foreign deposit was already entangled.
    #[error("txid has already entangle: [txid:{ext_tx_hash}, height:{height}]")]
    Duplicate { ext_tx_hash: String, height: u64 },

    /// The referenced foreign output index does not exist.
    #[error("{chain} tx out index err: [txid:{ext_tx_hash}, index:{index}]")]
    VoutOutOfRange {
        chain: &'static str,
        ext_tx_hash: String,
        index: u32,
    },

    /// The foreign output value does not match the entangle amount.
    #[error("amount err, [request:{requested}, {chain}:{actual}] [txid:{ext_tx_hash}, height:{height}]")]
    AmountMismatch {
        chain: &'static str,
        requested: String,
        actual: i64,
        ext_tx_hash: String,
        height: u64,
    },

    /// The foreign output script is not of the pay-to-script-hash class.
    #[error("{chain} pk script class err: [txid:{ext_tx_hash}, height:{height}]")]
    ScriptClass {
        chain: &'static str,
        ext_tx_hash: String,
        height: u64,
    },

    /// The foreign deposit was not made to the pool address.
    #[error("{chain} pool addr err: got {addr} [txid:{ext_tx_hash}, height:{height}]")]
    PoolMismatch {
        chain: &'static str,
        addr: String,
        ext_tx_hash: String,
        height: u64,
    },

    /// The foreign deposit has not matured yet.
    #[error("{chain} maturity err: count {count}, height {height} [txid:{ext_tx_hash}]")]
    Maturity {
        chain: &'static str,
        count: i64,
        height: u64,
        ext_tx_hash: String,
    },

    /// Entangle-bearing transactions break the block sequence rule.
    #[error("unordered entangle tx sequence: {0}")]
    UnorderedSequence(String),

    /// A base58check address failed to decode.
    #[error("bad address {0}")]
    BadAddress(String),

    /// Foreign RPC failure, including exceeded timeouts. Retryable by the
    /// caller, unlike the rule errors above.
    #[error("foreign rpc error: {0}")]
    Rpc(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl CrossError {
    /// Whether this error is an I/O failure rather than a verification rule
    /// violation.
    pub fn is_io(&self) -> bool {
        matches!(self, CrossError::Rpc(_))
    }
}

/// Result type for cross-chain operations.
pub type CrossResult<T> = Result<T, CrossError>;
