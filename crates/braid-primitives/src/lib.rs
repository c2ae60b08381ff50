//! # braid-primitives
//!
//! Wire data model for the Braid chain.
//!
//! This crate provides:
//! - Chain hashes (double-SHA256) and the 32-byte [`Hash256`] type
//! - Transactions, outpoints and blocks with their canonical serialization
//! - Merkle root computation
//! - Script primitives: opcodes, verification flags, classification and
//!   signature-operation counting, plus the entangle and keeped-amount
//!   payload framings carried in output scripts
//!
//! The script *interpreter* is deliberately not part of this crate; consensus
//! code consumes only flags, classification and sigop counts from here.

pub mod block;
pub mod cancel;
pub mod hash;
pub mod merkle;
pub mod script;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use cancel::CancelToken;
pub use hash::{sha256d, Hash256, HASH_SIZE};
pub use merkle::build_merkle_root;
pub use script::{ScriptError, ScriptFlags};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut, COIN, MAX_TX_IN_SEQUENCE_NUM};
