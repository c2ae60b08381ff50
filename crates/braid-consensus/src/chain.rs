//! Chain index and the driver surface the validator runs against.
//!
//! [`BlockNode`] records the header metadata the consensus rules consult
//! (height, bits, timestamps, cumulative work); nodes reference their parent
//! through an `Arc`, forming the ancestor DAG with one best chain. The
//! [`Chain`] driver owns the index and the injected collaborators, and
//! serializes every entry point through one exclusive lock: even read-only
//! paths traverse the ancestor index, so they take the same lock.

use crate::chain_params::{ChainParams, Deployment, DEPLOYMENT_CSV};
use crate::compact::{calc_work, hash_to_big};
use crate::error::{ConsensusResult, RuleError};
use crate::params::MEDIAN_TIME_BLOCKS;
use braid_cross::{EntangleCache, EntangleVerifier};
use braid_primitives::{sha256d, Block, BlockHeader, Hash256, ScriptFlags, Transaction};
use braid_state::{UtxoCache, UtxoView};
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Chain metadata for one block header.
#[derive(Clone, Debug)]
pub struct BlockNode {
    pub hash: Hash256,
    pub parent: Option<Arc<BlockNode>>,
    pub height: i32,
    pub bits: u32,
    pub timestamp: i64,
    /// Cumulative work of the chain ending at this node.
    pub work_sum: BigUint,
}

impl BlockNode {
    /// Create the node for `header` on top of `parent` (`None` for genesis).
    pub fn new(header: &BlockHeader, parent: Option<Arc<BlockNode>>) -> Arc<BlockNode> {
        let work = calc_work(header.bits);
        let (height, work_sum) = match &parent {
            Some(parent) => (parent.height + 1, &parent.work_sum + work),
            None => (0, work),
        };
        Arc::new(BlockNode {
            hash: header.block_hash(),
            parent,
            height,
            bits: header.bits,
            timestamp: header.timestamp,
            work_sum,
        })
    }

    /// The ancestor at an absolute height, or `None` when out of range.
    pub fn ancestor(&self, height: i32) -> Option<&BlockNode> {
        if height < 0 || height > self.height {
            return None;
        }
        let mut node = self;
        while node.height > height {
            node = node.parent.as_deref()?;
        }
        Some(node)
    }

    /// The ancestor `distance` blocks back.
    pub fn relative_ancestor(&self, distance: i32) -> Option<&BlockNode> {
        self.ancestor(self.height - distance)
    }

    /// Median timestamp of the last [`MEDIAN_TIME_BLOCKS`] blocks ending at
    /// this node.
    pub fn calc_past_median_time(&self) -> i64 {
        let mut timestamps = Vec::with_capacity(MEDIAN_TIME_BLOCKS);
        let mut node = Some(self);
        while let Some(current) = node {
            timestamps.push(current.timestamp);
            if timestamps.len() == MEDIAN_TIME_BLOCKS {
                break;
            }
            node = current.parent.as_deref();
        }
        timestamps.sort_unstable();
        timestamps[timestamps.len() / 2]
    }
}

/// Threshold state of a consensus deployment.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

/// Deployment state as a pure function over the ancestor chain.
///
/// Activation is time-window based: the core consults only the window
/// boundaries against the median time past. Miner signalling and the
/// `Started`/`LockedIn` transitions happen outside the validation core.
pub fn deployment_state(node: Option<&BlockNode>, deployment: &Deployment) -> ThresholdState {
    if deployment.start_time == 0 {
        return ThresholdState::Active;
    }
    let Some(node) = node else {
        return ThresholdState::Defined;
    };
    let median = node.calc_past_median_time();
    if deployment.expire_time != 0 && median >= deployment.expire_time {
        ThresholdState::Failed
    } else if median >= deployment.start_time {
        ThresholdState::Active
    } else {
        ThresholdState::Defined
    }
}

/// Source of network-adjusted time.
pub trait MedianTimeSource: Send + Sync {
    /// Current time adjusted by the median offset of connected peers.
    fn adjusted_time(&self) -> i64;
}

/// [`MedianTimeSource`] backed by the system clock.
pub struct SystemTimeSource;

impl MedianTimeSource for SystemTimeSource {
    fn adjusted_time(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Block bodies by hash; backed by whatever storage the node uses.
pub trait BlockStore: Send + Sync {
    fn block_by_hash(&self, hash: &Hash256) -> Option<Block>;

    fn block_by_hash_and_height(&self, hash: &Hash256, _height: i32) -> Option<Block> {
        self.block_by_hash(hash)
    }
}

/// The proof-of-work seal predicate. The seal algorithm is pluggable (and
/// may be memory-hard); consensus consumes it opaquely.
pub trait SealVerifier: Send + Sync {
    /// Whether `nonce` seals `head_hash` under `target`.
    fn verify_block_seal(&self, head_hash: &Hash256, target: &BigUint, nonce: u64) -> bool;
}

/// Hash-comparison seal: double-SHA256 of the sealed header message and the
/// nonce must not exceed the target.
pub struct HashSeal;

impl SealVerifier for HashSeal {
    fn verify_block_seal(&self, head_hash: &Hash256, target: &BigUint, nonce: u64) -> bool {
        let mut message = Vec::with_capacity(40);
        message.extend_from_slice(head_hash.as_bytes());
        message.extend_from_slice(&nonce.to_le_bytes());
        hash_to_big(&sha256d(&message)) <= *target
    }
}

/// Executes the scripts of a fully-loaded block. The interpreter lives
/// outside the consensus core; only its flag set crosses this seam.
pub trait ScriptExecutor: Send + Sync {
    fn check_block_scripts(
        &self,
        block: &Block,
        view: &UtxoView,
        flags: ScriptFlags,
    ) -> Result<(), RuleError>;
}

/// [`ScriptExecutor`] that accepts every script. Used where validity is
/// already pinned by checkpoints, and by tests.
pub struct NoopScriptExecutor;

impl ScriptExecutor for NoopScriptExecutor {
    fn check_block_scripts(
        &self,
        _block: &Block,
        _view: &UtxoView,
        _flags: ScriptFlags,
    ) -> Result<(), RuleError> {
        Ok(())
    }
}

// Relative lock-time encoding inside the input sequence field.
pub const SEQUENCE_LOCK_TIME_DISABLED: u32 = 1 << 31;
pub const SEQUENCE_LOCK_TIME_IS_SECONDS: u32 = 1 << 22;
pub const SEQUENCE_LOCK_TIME_MASK: u32 = 0x0000_ffff;
pub const SEQUENCE_LOCK_TIME_GRANULARITY: u32 = 9;

/// The point after which all of a transaction's relative lock times are
/// satisfied. `-1` fields are trivially satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceLock {
    pub seconds: i64,
    pub block_height: i32,
}

/// Compute the combined BIP68 sequence lock of `tx` against the view.
pub fn calc_sequence_lock(
    node: &BlockNode,
    tx: &Transaction,
    view: &UtxoView,
    is_coinbase: bool,
) -> ConsensusResult<SequenceLock> {
    let mut lock = SequenceLock {
        seconds: -1,
        block_height: -1,
    };

    if is_coinbase || tx.version < 2 {
        return Ok(lock);
    }

    let tx_hash = tx.hash();
    for (input_index, txin) in tx.inputs.iter().enumerate() {
        if txin.sequence & SEQUENCE_LOCK_TIME_DISABLED != 0 {
            continue;
        }
        let utxo = view
            .lookup_entry(&txin.previous_out_point)
            .ok_or_else(|| RuleError::MissingTxOut(format!(
                "output {} referenced from transaction {}:{} does not exist",
                txin.previous_out_point, tx_hash, input_index
            )))?;

        let input_height = utxo.block_height();
        let masked = (txin.sequence & SEQUENCE_LOCK_TIME_MASK) as i64;
        if txin.sequence & SEQUENCE_LOCK_TIME_IS_SECONDS != 0 {
            let prev_height = (input_height - 1).max(0);
            let median = node
                .ancestor(prev_height)
                .map(BlockNode::calc_past_median_time)
                .unwrap_or(0);
            let time_lock = median + (masked << SEQUENCE_LOCK_TIME_GRANULARITY) - 1;
            lock.seconds = lock.seconds.max(time_lock);
        } else {
            lock.block_height = lock.block_height.max(input_height + masked as i32 - 1);
        }
    }
    Ok(lock)
}

/// Whether a sequence lock has been satisfied at the given height and
/// median time past.
pub fn sequence_lock_active(lock: &SequenceLock, block_height: i32, median_time_past: i64) -> bool {
    !(lock.seconds >= median_time_past || lock.block_height >= block_height)
}

/// Collaborators the chain needs injected at construction.
pub struct ChainServices {
    pub time_source: Arc<dyn MedianTimeSource>,
    pub seal: Arc<dyn SealVerifier>,
    pub scripts: Arc<dyn ScriptExecutor>,
    pub entangle: Arc<dyn EntangleVerifier>,
    pub entangle_cache: Option<Arc<dyn EntangleCache>>,
    pub utxo_cache: Arc<dyn UtxoCache>,
    pub store: Arc<dyn BlockStore>,
}

pub(crate) struct ChainInner {
    pub index: HashMap<Hash256, Arc<BlockNode>>,
    pub tip: Option<Arc<BlockNode>>,
}

/// The consensus chain driver.
///
/// Single-writer model: every public entry point acquires the one chain
/// lock, including read-only paths, because they walk the ancestor index and
/// memoizing oracles.
pub struct Chain {
    pub(crate) params: ChainParams,
    pub(crate) inner: Mutex<ChainInner>,
    pub(crate) services: ChainServices,
}

impl Chain {
    pub fn new(params: ChainParams, services: ChainServices) -> Self {
        Chain {
            params,
            inner: Mutex::new(ChainInner {
                index: HashMap::new(),
                tip: None,
            }),
            services,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Register a header in the index, extending the best chain when it has
    /// more cumulative work.
    pub fn register_header(&self, header: &BlockHeader) -> Arc<BlockNode> {
        let mut inner = self.inner.lock();
        let parent = inner.index.get(&header.prev_block).cloned();
        let node = BlockNode::new(header, parent);
        inner.index.insert(node.hash, node.clone());

        let extends_best = match &inner.tip {
            Some(tip) => node.work_sum > tip.work_sum,
            None => true,
        };
        if extends_best {
            debug!(height = node.height, hash = %node.hash, "best chain tip updated");
            inner.tip = Some(node.clone());
        }
        node
    }

    /// The current best-chain tip.
    pub fn tip(&self) -> Option<Arc<BlockNode>> {
        self.inner.lock().tip.clone()
    }

    /// Record every entangle deposit of a fully-connected block in the
    /// dedup cache. Must only be called after the connect succeeded; a
    /// half-connected block never reaches the cache.
    pub fn record_block_entangles(&self, block: &Block) {
        let Some(cache) = &self.services.entangle_cache else {
            return;
        };
        for tx in &block.transactions {
            if let Some(infos) = braid_cross::is_entangle_tx(tx) {
                for info in infos.values() {
                    cache.insert(info);
                }
            }
        }
    }

    /// CSV deployment state above `prev_node`.
    pub(crate) fn csv_state(&self, prev_node: Option<&BlockNode>) -> ThresholdState {
        deployment_state(prev_node, &self.params.deployments[DEPLOYMENT_CSV])
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_params::ChainParams;

    fn header_with(prev: Hash256, timestamp: i64, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: Hash256::ZERO,
            timestamp,
            bits,
            nonce: 0,
        }
    }

    fn build_chain(count: usize, spacing: i64) -> Vec<Arc<BlockNode>> {
        let mut nodes = Vec::with_capacity(count);
        let mut prev_hash = Hash256::ZERO;
        let mut parent: Option<Arc<BlockNode>> = None;
        for i in 0..count {
            let header = header_with(prev_hash, 1_600_000_000 + spacing * i as i64, 0x1d00ffff);
            let node = BlockNode::new(&header, parent.clone());
            prev_hash = node.hash;
            parent = Some(node.clone());
            nodes.push(node);
        }
        nodes
    }

    // ============ BlockNode Tests ============

    #[test]
    fn test_work_sum_accumulates() {
        let nodes = build_chain(3, 30);
        assert!(nodes[2].work_sum > nodes[1].work_sum);
        assert_eq!(
            &nodes[2].work_sum - &nodes[1].work_sum,
            calc_work(0x1d00ffff)
        );
    }

    #[test]
    fn test_ancestor_walk() {
        let nodes = build_chain(5, 30);
        let tip = &nodes[4];
        assert_eq!(tip.ancestor(2).unwrap().height, 2);
        assert_eq!(tip.relative_ancestor(1).unwrap().height, 3);
        assert!(tip.ancestor(9).is_none());
        assert!(tip.ancestor(-1).is_none());
    }

    #[test]
    fn test_past_median_time() {
        let nodes = build_chain(11, 60);
        // Eleven blocks at 60s spacing: the median is the 6th newest.
        let tip = &nodes[10];
        assert_eq!(tip.calc_past_median_time(), nodes[5].timestamp);

        // A short chain takes the median of what exists.
        assert_eq!(nodes[2].calc_past_median_time(), nodes[1].timestamp);
    }

    // ============ Deployment Tests ============

    #[test]
    fn test_deployment_always_active() {
        let deployment = Deployment {
            start_time: 0,
            expire_time: 0,
        };
        assert_eq!(deployment_state(None, &deployment), ThresholdState::Active);
    }

    #[test]
    fn test_deployment_window() {
        let nodes = build_chain(11, 60);
        let tip = &nodes[10];
        let median = tip.calc_past_median_time();

        let future = Deployment {
            start_time: median + 1,
            expire_time: 0,
        };
        assert_eq!(
            deployment_state(Some(tip), &future),
            ThresholdState::Defined
        );

        let live = Deployment {
            start_time: median,
            expire_time: 0,
        };
        assert_eq!(deployment_state(Some(tip), &live), ThresholdState::Active);

        let expired = Deployment {
            start_time: 1,
            expire_time: median,
        };
        assert_eq!(
            deployment_state(Some(tip), &expired),
            ThresholdState::Failed
        );
    }

    // ============ Sequence Lock Tests ============

    #[test]
    fn test_sequence_lock_active() {
        let lock = SequenceLock {
            seconds: 100,
            block_height: 50,
        };
        assert!(sequence_lock_active(&lock, 51, 101));
        assert!(!sequence_lock_active(&lock, 50, 101));
        assert!(!sequence_lock_active(&lock, 51, 100));
    }

    // ============ Seal Tests ============

    #[test]
    fn test_hash_seal_bounds() {
        use num_traits::{One, Zero};

        let head = sha256d(b"sealed header");
        let everything = (BigUint::one() << 256) - BigUint::one();
        assert!(HashSeal.verify_block_seal(&head, &everything, 0));
        assert!(!HashSeal.verify_block_seal(&head, &BigUint::zero(), 0));
    }

    // ============ Chain Index Tests ============

    #[test]
    fn test_record_block_entangles_fills_cache() {
        use braid_cross::{is_entangle_tx, EntangleTxInfo, ExpandedTxType, MemoryEntangleCache};
        use braid_primitives::script::entangle_script;
        use braid_primitives::{OutPoint, TxIn, TxOut};

        let cache = Arc::new(MemoryEntangleCache::new());
        let (mut chain, _store) = test_util::test_chain(ChainParams::regtest());
        chain.services.entangle_cache = Some(cache.clone());

        let info = EntangleTxInfo {
            ex_type: ExpandedTxType::Doge,
            index: 0,
            height: 77,
            amount: num_bigint::BigInt::from(10),
            ext_tx_hash: b"aa".to_vec(),
        };
        let tx = Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::NULL, vec![])],
            outputs: vec![TxOut::new(0, entangle_script(&info.serialize()))],
            lock_time: 0,
        };
        let block = Block::new(
            BlockHeader {
                version: 1,
                prev_block: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp: 1_600_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            vec![tx.clone()],
        );

        use braid_cross::EntangleCache as _;
        assert!(!cache.contains(&info));
        chain.record_block_entangles(&block);
        assert!(cache.contains(&info));
        assert!(is_entangle_tx(&tx).is_some());
    }

    #[test]
    fn test_register_header_tracks_best_tip() {
        let (chain, _store) = test_util::test_chain(ChainParams::regtest());
        let genesis = header_with(Hash256::ZERO, 1_600_000_000, 0x207fffff);
        let genesis_node = chain.register_header(&genesis);
        assert_eq!(chain.tip().unwrap().hash, genesis_node.hash);

        let child = header_with(genesis_node.hash, 1_600_000_030, 0x207fffff);
        let child_node = chain.register_header(&child);
        assert_eq!(child_node.height, 1);
        assert_eq!(chain.tip().unwrap().hash, child_node.hash);
    }
}
