//! # braid-consensus
//!
//! Consensus rules for the Braid chain.
//!
//! This crate provides:
//! - Block, header and transaction validation (context-free sanity,
//!   contextual rules, and the connect-time fixed point)
//! - The per-block difficulty retargeting algorithm and the compact
//!   encoding of 256-bit targets
//! - Subsidy and pool accounting, including the entangle mint
//!   reconciliation carried through the coinbase
//! - The chain driver surface: block index, checkpoint lookup, deployment
//!   oracle, median-time source, and the injected seal, script and
//!   entangle-verification seams
//!
//! ## Difficulty
//!
//! Difficulty adjusts on every block: the step is
//! `max(1 - elapsed/30, -99)` applied to the parent's per-block work over a
//! bound divisor of 128, so a 30-second pace is the fixed point.
//!
//! ## Entanglement
//!
//! Blocks may carry transactions whose value is anchored to deposits on
//! foreign UTXO chains. The validator checks each one through the injected
//! [`braid_cross::EntangleVerifier`] and reconciles the minted outputs
//! against the two pool balances the coinbase rolls forward.

mod chain;
mod chain_params;
pub mod compact;
pub mod difficulty;
mod error;
pub mod sigops;
pub mod subsidy;
pub mod validate;

pub use chain::{
    calc_sequence_lock, deployment_state, sequence_lock_active, BlockNode, BlockStore, Chain,
    ChainServices, HashSeal, MedianTimeSource, NoopScriptExecutor, ScriptExecutor, SealVerifier,
    SequenceLock, SystemTimeSource, ThresholdState, SEQUENCE_LOCK_TIME_DISABLED,
    SEQUENCE_LOCK_TIME_GRANULARITY, SEQUENCE_LOCK_TIME_IS_SECONDS, SEQUENCE_LOCK_TIME_MASK,
};
pub use chain_params::{
    ChainConfig, ChainParams, Checkpoint, Deployment, DEFINED_DEPLOYMENTS, DEPLOYMENT_CSV,
    DEPLOYMENT_SEQ,
};
pub use compact::{big_to_compact, calc_work, compact_to_big, hash_to_big};
pub use difficulty::{
    calc_next_required_difficulty, find_prev_testnet_difficulty, get_suitable_block,
    DIFFICULTY_ADJUSTMENT_WINDOW, DIFFICULTY_BOUND_DIVISOR,
};
pub use error::{ConsensusResult, RuleError, ValidateError};
pub use subsidy::{calc_block_subsidy, check_block_subsidy, KeepedInfoSummary};
pub use validate::{
    check_proof_of_work, check_transaction_inputs, check_transaction_sanity,
    extract_coinbase_height, is_coinbase_tx, is_finalized_transaction, max_block_sig_ops,
    BehaviorFlags,
};

/// Fixed consensus constants.
pub mod params {
    use braid_primitives::COIN;

    /// One megabyte, the sigop budget granularity.
    pub const ONE_MEGABYTE: usize = 1_000_000;

    /// Maximum seconds a block time may run ahead of the adjusted time.
    pub const MAX_TIME_OFFSET_SECONDS: i64 = 2 * 60 * 60;

    /// Seconds a block time may run ahead of the wall clock.
    pub const ALLOWED_FUTURE_BLOCK_TIME: i64 = 10;

    /// Minimum length of a coinbase signature script.
    pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;

    /// Maximum length of a coinbase signature script.
    pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

    /// Blocks sampled for the median time past.
    pub const MEDIAN_TIME_BLOCKS: usize = 11;

    /// Starting block subsidy.
    pub const BASE_SUBSIDY: i64 = 1000 * COIN;

    /// Maximum serialized transaction size in bytes.
    pub const MAX_TRANSACTION_SIZE: usize = 1_000_000;

    /// Minimum serialized transaction size once magnetic anomaly applies.
    pub const MIN_TRANSACTION_SIZE: usize = 100;

    /// Maximum signature operations in one transaction.
    pub const MAX_TRANSACTION_SIGOPS: usize = 20_000;

    /// Maximum signature operations per (started) megabyte of block.
    pub const MAX_BLOCK_SIGOPS_PER_MB: usize = 20_000;

    /// Lock-time values below this are block heights, above it timestamps.
    pub const LOCK_TIME_THRESHOLD: u32 = 500_000_000;
}
