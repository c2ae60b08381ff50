//! # braid-state
//!
//! The in-memory UTXO layer used during block validation.
//!
//! A [`UtxoView`] sits above a persistent [`UtxoCache`] (injected as a
//! trait): inputs referenced by a candidate block are pulled up into the
//! view, the block's transactions are connected against it atomically, and a
//! [`SpentTxOut`] journal captures everything needed to disconnect the block
//! again during a reorganization.

mod error;
mod utxo;

pub use braid_primitives::CancelToken;
pub use error::{StateError, StateResult};
pub use utxo::{SpentTxOut, UtxoCache, UtxoEntry, UtxoView};
