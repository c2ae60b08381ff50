//! Error types for the UTXO state layer.

use thiserror::Error;

/// UTXO state errors.
#[derive(Error, Debug)]
pub enum StateError {
    /// A referenced output does not exist in the view.
    #[error("output {outpoint} referenced from transaction {tx_hash}:{input_index} does not exist")]
    MissingUtxo {
        outpoint: String,
        tx_hash: String,
        input_index: usize,
    },

    /// A referenced output exists but has already been spent.
    #[error(
        "output {outpoint} referenced from transaction {tx_hash}:{input_index} has already been spent"
    )]
    SpentUtxo {
        outpoint: String,
        tx_hash: String,
        input_index: usize,
    },

    /// The journal does not line up with the block being disconnected.
    #[error("spent journal mismatch: {0}")]
    JournalMismatch(String),

    /// The persistent cache below the view failed.
    #[error("utxo cache error: {0}")]
    Cache(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl StateError {
    /// Whether this error is an I/O failure rather than a state rule
    /// violation. I/O failures may be retried by the caller.
    pub fn is_io(&self) -> bool {
        matches!(self, StateError::Cache(_))
    }
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
