//! Foreign-chain verification of entangle transactions.

use crate::address::legacy_script_hash_address;
use crate::tx::{is_entangle_tx, EntangleTxInfo, ExpandedTxType};
use crate::{CrossError, CrossResult};
use braid_primitives::{CancelToken, Transaction};
use num_bigint::BigInt;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Hard-coded deposit pool address on the doge chain.
pub const DOGE_POOL_ADDR: &str = "DNGzkoZbnVMihLTMq8M1m7L62XvN3d2cN2";
/// Hard-coded deposit pool address on the ltc chain.
pub const LTC_POOL_ADDR: &str = "MUy9qiaLQtaqmKBSk27FXrEEfUkRBeddCZ";

/// Confirmations a doge deposit needs before it can entangle.
pub const DOGE_MATURITY: i64 = 14;
/// Confirmations an ltc deposit needs before it can entangle.
pub const LTC_MATURITY: i64 = 14;

/// Legacy script-hash address version byte of the doge chain.
pub const DOGE_SCRIPT_HASH_ID: u8 = 0x1e;
/// Legacy script-hash address version byte of the ltc chain.
pub const LTC_SCRIPT_HASH_ID: u8 = 0x32;

/// Script class reported by the foreign chain for pay-to-script-hash.
pub const SCRIPT_CLASS_SCRIPT_HASH: u8 = 2;

/// A decoded foreign transaction output.
#[derive(Clone, Debug)]
pub struct ForeignTxOut {
    pub value: i64,
    pub pk_script: Vec<u8>,
}

/// A decoded foreign transaction input.
#[derive(Clone, Debug)]
pub struct ForeignTxIn {
    pub signature_script: Vec<u8>,
}

/// A decoded foreign transaction.
#[derive(Clone, Debug, Default)]
pub struct ForeignTx {
    pub inputs: Vec<ForeignTxIn>,
    pub outputs: Vec<ForeignTxOut>,
}

/// The capability set a foreign-chain RPC client must provide.
///
/// Calls may block on the network; implementations are required to bound
/// every call by a configured timeout and surface expiry as
/// [`CrossError::Rpc`], which the validator reports as a retryable failure
/// rather than skipping the check.
pub trait ForeignChainClient: Send + Sync {
    /// Fetch a raw transaction by its textual id.
    fn get_raw_transaction(&self, txid: &str) -> CrossResult<ForeignTx>;

    /// Current foreign chain height.
    fn get_block_count(&self) -> CrossResult<i64>;

    /// Recover the depositor's public key from a signature script.
    fn compute_pk(&self, signature_script: &[u8]) -> CrossResult<Vec<u8>>;

    /// Extract the hash committed to by a pay-to-script-hash output script.
    fn extract_pk_script_pub(&self, pk_script: &[u8]) -> CrossResult<Vec<u8>>;

    /// Classify an output script under the foreign chain's conventions.
    fn get_script_class(&self, pk_script: &[u8]) -> u8;
}

/// Per-block dedup cache over already-entangled foreign deposits, keyed by
/// `(ext_tx_hash, height, ex_type)`. Implementations are typically backed by
/// the utxo store; the chain driver updates the cache only after a block
/// fully connects.
pub trait EntangleCache: Send + Sync {
    fn contains(&self, info: &EntangleTxInfo) -> bool;
    fn insert(&self, info: &EntangleTxInfo);
}

type CacheKey = (Vec<u8>, u64, u8);

/// In-memory [`EntangleCache`].
#[derive(Default)]
pub struct MemoryEntangleCache {
    seen: RwLock<HashSet<CacheKey>>,
}

impl MemoryEntangleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cache_key(info: &EntangleTxInfo) -> CacheKey {
    (
        info.ext_tx_hash.clone(),
        info.height,
        info.ex_type.to_byte(),
    )
}

impl EntangleCache for MemoryEntangleCache {
    fn contains(&self, info: &EntangleTxInfo) -> bool {
        self.seen.read().contains(&cache_key(info))
    }

    fn insert(&self, info: &EntangleTxInfo) {
        self.seen.write().insert(cache_key(info));
    }
}

/// One successfully verified entangle item: the foreign chain, the output
/// index inside the braid transaction, and the recovered depositor key.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TuplePubIndex {
    pub e_type: ExpandedTxType,
    pub index: u32,
    pub pub_key: Vec<u8>,
}

/// The verification capability the block validator depends on. Injected at
/// construction so the consensus crate never depends on concrete RPC
/// machinery.
pub trait EntangleVerifier: Send + Sync {
    /// Verify every entangle output of `tx` against the foreign chains.
    fn verify_entangle_tx(
        &self,
        tx: &Transaction,
        cancel: &CancelToken,
    ) -> CrossResult<Vec<TuplePubIndex>>;
}

/// Foreign-chain entangle verifier backed by RPC client pools.
pub struct EntangleVerify {
    doge_clients: Vec<Arc<dyn ForeignChainClient>>,
    ltc_clients: Vec<Arc<dyn ForeignChainClient>>,
    cache: Option<Arc<dyn EntangleCache>>,
}

impl EntangleVerify {
    pub fn new(
        doge_clients: Vec<Arc<dyn ForeignChainClient>>,
        ltc_clients: Vec<Arc<dyn ForeignChainClient>>,
        cache: Option<Arc<dyn EntangleCache>>,
    ) -> Self {
        EntangleVerify {
            doge_clients,
            ltc_clients,
            cache,
        }
    }

    fn pick_client(&self, ex_type: ExpandedTxType) -> CrossResult<&dyn ForeignChainClient> {
        let pool = match ex_type {
            ExpandedTxType::Doge => &self.doge_clients,
            ExpandedTxType::Ltc => &self.ltc_clients,
        };
        if pool.is_empty() {
            return Err(CrossError::Rpc(format!(
                "no clients configured for {:?}",
                ex_type
            )));
        }
        let picked = rand::thread_rng().gen_range(0..pool.len());
        Ok(pool[picked].as_ref())
    }

    fn verify_item(&self, info: &EntangleTxInfo) -> CrossResult<Vec<u8>> {
        let (chain, pool_addr, maturity, version) = match info.ex_type {
            ExpandedTxType::Doge => ("doge", DOGE_POOL_ADDR, DOGE_MATURITY, DOGE_SCRIPT_HASH_ID),
            ExpandedTxType::Ltc => ("ltc", LTC_POOL_ADDR, LTC_MATURITY, LTC_SCRIPT_HASH_ID),
        };
        let ext_tx_hash = String::from_utf8_lossy(&info.ext_tx_hash).into_owned();
        let client = self.pick_client(info.ex_type)?;

        let foreign_tx = client.get_raw_transaction(&ext_tx_hash)?;
        let txout = foreign_tx.outputs.get(info.index as usize).ok_or_else(|| {
            CrossError::VoutOutOfRange {
                chain,
                ext_tx_hash: ext_tx_hash.clone(),
                index: info.index,
            }
        })?;

        if BigInt::from(txout.value) != info.amount {
            return Err(CrossError::AmountMismatch {
                chain,
                requested: info.amount.to_string(),
                actual: txout.value,
                ext_tx_hash,
                height: info.height,
            });
        }
        if client.get_script_class(&txout.pk_script) != SCRIPT_CLASS_SCRIPT_HASH {
            return Err(CrossError::ScriptClass {
                chain,
                ext_tx_hash,
                height: info.height,
            });
        }

        let script_hash = client.extract_pk_script_pub(&txout.pk_script)?;
        let addr = legacy_script_hash_address(&script_hash, version);
        if addr != pool_addr {
            return Err(CrossError::PoolMismatch {
                chain,
                addr,
                ext_tx_hash,
                height: info.height,
            });
        }

        let first_input = foreign_tx
            .inputs
            .first()
            .ok_or_else(|| CrossError::Rpc(format!("{chain} tx {ext_tx_hash} has no inputs")))?;
        let pub_key = client.compute_pk(&first_input.signature_script)?;

        let count = client.get_block_count()?;
        if count - info.height as i64 > maturity {
            debug!(chain, %ext_tx_hash, count, "entangle deposit verified");
            Ok(pub_key)
        } else {
            Err(CrossError::Maturity {
                chain,
                count,
                height: info.height,
                ext_tx_hash,
            })
        }
    }
}

impl EntangleVerifier for EntangleVerify {
    #[instrument(skip_all, fields(tx = %tx.hash()))]
    fn verify_entangle_tx(
        &self,
        tx: &Transaction,
        cancel: &CancelToken,
    ) -> CrossResult<Vec<TuplePubIndex>> {
        let infos = is_entangle_tx(tx).ok_or(CrossError::NotEntangleTx)?;

        if let Some(cache) = &self.cache {
            for info in infos.values() {
                if cache.contains(info) {
                    return Err(CrossError::Duplicate {
                        ext_tx_hash: String::from_utf8_lossy(&info.ext_tx_hash).into_owned(),
                        height: info.height,
                    });
                }
            }
        }

        let mut pairs = Vec::with_capacity(infos.len());
        for (&index, info) in &infos {
            if cancel.is_cancelled() {
                return Err(CrossError::Cancelled);
            }
            let pub_key = self.verify_item(info)?;
            pairs.push(TuplePubIndex {
                e_type: info.ex_type,
                index,
                pub_key,
            });
        }
        Ok(pairs)
    }
}

/// Canned-data foreign client for tests, built with a builder the way the
/// RPC mocks in this workspace are.
#[derive(Default)]
pub struct MockForeignClient {
    transactions: HashMap<String, ForeignTx>,
    block_count: i64,
    depositor_pk: Vec<u8>,
}

impl MockForeignClient {
    pub fn builder() -> MockForeignClientBuilder {
        MockForeignClientBuilder {
            inner: MockForeignClient {
                transactions: HashMap::new(),
                block_count: 100,
                depositor_pk: vec![0x02; 33],
            },
        }
    }
}

/// Builder for [`MockForeignClient`].
pub struct MockForeignClientBuilder {
    inner: MockForeignClient,
}

impl MockForeignClientBuilder {
    /// Register a canned transaction under its textual id.
    pub fn with_tx(mut self, txid: &str, tx: ForeignTx) -> Self {
        self.inner.transactions.insert(txid.to_string(), tx);
        self
    }

    /// Override the reported chain height.
    pub fn with_block_count(mut self, count: i64) -> Self {
        self.inner.block_count = count;
        self
    }

    /// Override the recovered depositor key.
    pub fn with_depositor_pk(mut self, pk: Vec<u8>) -> Self {
        self.inner.depositor_pk = pk;
        self
    }

    pub fn build(self) -> MockForeignClient {
        self.inner
    }
}

impl ForeignChainClient for MockForeignClient {
    fn get_raw_transaction(&self, txid: &str) -> CrossResult<ForeignTx> {
        self.transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| CrossError::Rpc(format!("unknown tx {txid}")))
    }

    fn get_block_count(&self) -> CrossResult<i64> {
        Ok(self.block_count)
    }

    fn compute_pk(&self, _signature_script: &[u8]) -> CrossResult<Vec<u8>> {
        Ok(self.depositor_pk.clone())
    }

    fn extract_pk_script_pub(&self, pk_script: &[u8]) -> CrossResult<Vec<u8>> {
        if braid_primitives::script::is_pay_to_script_hash(pk_script) {
            Ok(pk_script[2..22].to_vec())
        } else {
            Err(CrossError::Rpc("not a p2sh script".into()))
        }
    }

    fn get_script_class(&self, pk_script: &[u8]) -> u8 {
        if braid_primitives::script::is_pay_to_script_hash(pk_script) {
            SCRIPT_CLASS_SCRIPT_HASH
        } else {
            0
        }
    }
}
