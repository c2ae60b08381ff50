//! # braid-cross
//!
//! Cross-chain entanglement support for the Braid chain.
//!
//! Entanglement lets a deposit locked on a foreign UTXO chain (a
//! Dogecoin-like or a Litecoin-like chain) authorize the minting of braid on
//! this chain. This crate provides:
//!
//! - The entangle payload codec carried in output scripts, and detection of
//!   entangle-bearing transactions
//! - The keeped-amount codec: per-chain reserves carried through the
//!   coinbase that parameterize the minting curves
//! - The `to_doge` / `to_ltc` minting curves with diminishing returns
//! - Foreign-chain verification against an injected RPC client pool, with a
//!   per-block dedup cache
//!
//! The validator in `braid-consensus` consumes this crate exclusively
//! through the [`EntangleVerifier`], [`ForeignChainClient`] and
//! [`EntangleCache`] seams, which keeps the crate graph acyclic.

mod address;
mod error;
mod tx;
mod verify;

pub use address::{decode_base58check, legacy_script_hash_address};
pub use error::{CrossError, CrossResult};
pub use tx::{
    is_entangle_tx, pre_calc_entangle_amount, to_doge, to_ltc, verify_txs_sequence, EntangleItem,
    EntangleTxInfo, EtsInfo, ExpandedTxType, KeepedAmount, KeepedItem,
};
pub use verify::{
    EntangleCache, EntangleVerifier, EntangleVerify, ForeignChainClient, ForeignTx, ForeignTxIn,
    ForeignTxOut, MemoryEntangleCache, MockForeignClient, MockForeignClientBuilder, TuplePubIndex,
    DOGE_MATURITY, DOGE_POOL_ADDR, DOGE_SCRIPT_HASH_ID, LTC_MATURITY, LTC_POOL_ADDR,
    LTC_SCRIPT_HASH_ID, SCRIPT_CLASS_SCRIPT_HASH,
};
