//! Block and transaction validation.
//!
//! Three layers, in checking order: context-free sanity (header, block,
//! transaction), contextual checks against the chain index (difficulty,
//! median time, checkpoints, finality), and the connect-time fixed point
//! where the utxo view is mutated and the pooled subsidy is reconciled.

use crate::chain::{
    calc_sequence_lock, sequence_lock_active, BlockNode, Chain, SealVerifier, ThresholdState,
};
use crate::chain_params::{ChainParams, DEPLOYMENT_SEQ};
use crate::compact::compact_to_big;
use crate::difficulty;
use crate::error::{ConsensusResult, RuleError};
use crate::params::{
    ALLOWED_FUTURE_BLOCK_TIME, LOCK_TIME_THRESHOLD, MAX_COINBASE_SCRIPT_LEN,
    MAX_BLOCK_SIGOPS_PER_MB, MAX_TIME_OFFSET_SECONDS, MAX_TRANSACTION_SIGOPS,
    MAX_TRANSACTION_SIZE, MIN_COINBASE_SCRIPT_LEN, MIN_TRANSACTION_SIZE, ONE_MEGABYTE,
};
use crate::sigops::{count_sig_ops, get_sig_ops};
use crate::subsidy::{
    calc_block_subsidy, check_block_subsidy, check_merge_tx_in_coinbase, check_tx_sequence,
};
use braid_cross::is_entangle_tx;
use braid_primitives::script::{OP_0, OP_1, OP_16};
use braid_primitives::{
    build_merkle_root, Block, BlockHeader, CancelToken, Hash256, ScriptFlags, Transaction,
    MAX_TX_IN_SEQUENCE_NUM,
};
use braid_state::{SpentTxOut, StateError, UtxoView};
use num_bigint::{BigUint, Sign};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

/// Flags steering optional validation behavior.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BehaviorFlags(u32);

impl BehaviorFlags {
    pub const NONE: BehaviorFlags = BehaviorFlags(0);
    /// Trust checks already performed on this block; skip the expensive
    /// context work.
    pub const FAST_ADD: BehaviorFlags = BehaviorFlags(1 << 0);
    /// Skip the proof-of-work seal check (block templates).
    pub const NO_POW_CHECK: BehaviorFlags = BehaviorFlags(1 << 1);
    /// Validate under the magnetic-anomaly rule set (CTOR, minimum
    /// transaction size, extended script flags).
    pub const MAGNETIC_ANOMALY: BehaviorFlags = BehaviorFlags(1 << 2);

    pub fn has_flag(self, other: BehaviorFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BehaviorFlags {
    type Output = BehaviorFlags;

    fn bitor(self, rhs: BehaviorFlags) -> BehaviorFlags {
        BehaviorFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BehaviorFlags {
    fn bitor_assign(&mut self, rhs: BehaviorFlags) {
        self.0 |= rhs.0;
    }
}

/// Maximum signature operations for a block of the given serialized size:
/// one budget per started megabyte.
pub fn max_block_sig_ops(block_bytes: usize) -> usize {
    let megabytes_rounded_up = 1 + (block_bytes.saturating_sub(1)) / ONE_MEGABYTE;
    megabytes_rounded_up * MAX_BLOCK_SIGOPS_PER_MB
}

/// Whether a transaction is a coinbase.
///
/// A coinbase's first input references the null outpoint; after entanglement
/// activates the coinbase also spends the two pool outputs forward and so
/// carries exactly three inputs instead of one.
pub fn is_coinbase_tx(tx: &Transaction, params: &ChainParams) -> bool {
    let Ok(height) = extract_coinbase_height(tx) else {
        return false;
    };

    let expected_inputs = if height >= params.entangle_height { 3 } else { 1 };
    if tx.inputs.len() != expected_inputs {
        return false;
    }

    tx.inputs[0].previous_out_point.is_null()
}

/// Extract the block height serialized at the front of a coinbase signature
/// script: `OP_0`, a small-integer opcode, or a length byte followed by the
/// little-endian height.
pub fn extract_coinbase_height(tx: &Transaction) -> Result<i32, RuleError> {
    let sig_script = tx
        .inputs
        .first()
        .map(|txin| txin.signature_script.as_slice())
        .unwrap_or(&[]);
    if sig_script.is_empty() {
        return Err(RuleError::MissingCoinbaseHeight(
            "the coinbase signature script must start with the length of the serialized block height"
                .to_string(),
        ));
    }

    let opcode = sig_script[0];
    if opcode == OP_0 {
        return Ok(0);
    }
    if (OP_1..=OP_16).contains(&opcode) {
        return Ok((opcode - (OP_1 - 1)) as i32);
    }

    let serialized_len = opcode as usize;
    if sig_script.len() - 1 < serialized_len {
        return Err(RuleError::MissingCoinbaseHeight(format!(
            "the coinbase signature script must start with the {} serialized bytes of the block height",
            serialized_len
        )));
    }

    let mut height_bytes = [0u8; 8];
    let copy_len = serialized_len.min(8);
    height_bytes[..copy_len].copy_from_slice(&sig_script[1..1 + copy_len]);
    Ok(u64::from_le_bytes(height_bytes) as i32)
}

/// Check that a coinbase encodes exactly the wanted block height.
pub fn check_serialized_height(coinbase: &Transaction, want_height: i32) -> ConsensusResult<()> {
    let serialized_height = extract_coinbase_height(coinbase)?;
    if serialized_height != want_height {
        return Err(RuleError::BadCoinbaseHeight {
            got: serialized_height,
            want: want_height,
        }
        .into());
    }
    Ok(())
}

/// Whether a transaction is finalized at the given height and time.
pub fn is_finalized_transaction(tx: &Transaction, block_height: i32, block_time: i64) -> bool {
    let lock_time = tx.lock_time;
    if lock_time == 0 {
        return true;
    }

    let block_time_or_height = if lock_time < LOCK_TIME_THRESHOLD {
        block_height as i64
    } else {
        block_time
    };
    if (lock_time as i64) < block_time_or_height {
        return true;
    }

    // Not past the lock time, but maxed-out sequences finalize anyway.
    tx.inputs
        .iter()
        .all(|txin| txin.sequence == MAX_TX_IN_SEQUENCE_NUM)
}

/// Context-free transaction sanity.
pub fn check_transaction_sanity(
    tx: &Transaction,
    magnetic_anomaly_active: bool,
    flags: ScriptFlags,
    params: &ChainParams,
) -> ConsensusResult<()> {
    if tx.inputs.is_empty() {
        return Err(RuleError::NoTxInputs.into());
    }
    if tx.outputs.is_empty() {
        return Err(RuleError::NoTxOutputs.into());
    }

    let serialized_size = tx.serialized_size();
    if serialized_size > MAX_TRANSACTION_SIZE {
        return Err(RuleError::TxTooBig {
            size: serialized_size,
            max: MAX_TRANSACTION_SIZE,
        }
        .into());
    }
    if magnetic_anomaly_active && serialized_size < MIN_TRANSACTION_SIZE {
        return Err(RuleError::TxTooSmall {
            size: serialized_size,
            min: MIN_TRANSACTION_SIZE,
        }
        .into());
    }

    let sig_ops = count_sig_ops(tx, flags);
    if sig_ops > MAX_TRANSACTION_SIGOPS {
        return Err(RuleError::TxTooManySigOps {
            got: sig_ops,
            max: MAX_TRANSACTION_SIGOPS,
        }
        .into());
    }

    // Output values must stay in range individually and in total.
    let mut total_satoshi = 0i64;
    for txout in &tx.outputs {
        let satoshi = txout.value;
        if satoshi < 0 {
            return Err(RuleError::BadTxOutValue(format!(
                "transaction output has negative value of {}",
                satoshi
            ))
            .into());
        }
        if satoshi > params.max_satoshi {
            return Err(RuleError::BadTxOutValue(format!(
                "transaction output value of {} is higher than max allowed value of {}",
                satoshi, params.max_satoshi
            ))
            .into());
        }

        total_satoshi = total_satoshi.wrapping_add(satoshi);
        if total_satoshi < 0 || total_satoshi > params.max_satoshi {
            return Err(RuleError::BadTxOutValue(format!(
                "total value of all transaction outputs is {} which is higher than max allowed value of {}",
                total_satoshi, params.max_satoshi
            ))
            .into());
        }
    }

    let mut existing_out_points = HashSet::with_capacity(tx.inputs.len());
    for txin in &tx.inputs {
        if !existing_out_points.insert(txin.previous_out_point) {
            return Err(RuleError::DuplicateTxInputs.into());
        }
    }

    if is_coinbase_tx(tx, params) {
        let script_len = tx.inputs[0].signature_script.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&script_len) {
            return Err(RuleError::BadCoinbaseScriptLen {
                length: script_len,
                min: MIN_COINBASE_SCRIPT_LEN,
                max: MAX_COINBASE_SCRIPT_LEN,
            }
            .into());
        }
    } else {
        for txin in &tx.inputs {
            if txin.previous_out_point.is_null() {
                return Err(RuleError::BadTxInput(
                    "transaction input refers to previous output that is null".to_string(),
                )
                .into());
            }
        }
    }

    Ok(())
}

/// Check the header's claimed target range and its proof-of-work seal.
pub fn check_proof_of_work(
    header: &BlockHeader,
    pow_limit: &BigUint,
    flags: BehaviorFlags,
    seal: &dyn SealVerifier,
) -> ConsensusResult<()> {
    let target = compact_to_big(header.bits);
    if target.sign() != Sign::Plus {
        return Err(RuleError::UnexpectedDifficulty(format!(
            "block target difficulty of {:064x} is too low",
            target
        ))
        .into());
    }
    if target.magnitude() > pow_limit {
        return Err(RuleError::UnexpectedDifficulty(format!(
            "block target difficulty of {:064x} is higher than max of {:064x}",
            target, pow_limit
        ))
        .into());
    }

    if !flags.has_flag(BehaviorFlags::NO_POW_CHECK) {
        let head_hash = header.block_hash_no_nonce();
        if !seal.verify_block_seal(&head_hash, target.magnitude(), header.nonce) {
            return Err(RuleError::HighHash(format!(
                "block hash of {} does not satisfy the target of {:064x}",
                header.block_hash(),
                target
            ))
            .into());
        }
    }

    Ok(())
}

/// Per-transaction input checks at connect time. Returns the transaction
/// fee. The transaction must already have passed sanity checks.
pub fn check_transaction_inputs(
    tx: &Transaction,
    tx_height: i32,
    view: &UtxoView,
    params: &ChainParams,
) -> ConsensusResult<i64> {
    if check_merge_tx_in_coinbase(tx, tx_height, view, params)? {
        return Ok(0);
    }

    let tx_hash = tx.hash();
    let mut total_satoshi_in = 0i64;
    for (input_index, txin) in tx.inputs.iter().enumerate() {
        let utxo = view.lookup_entry(&txin.previous_out_point).ok_or_else(|| {
            RuleError::MissingTxOut(format!(
                "output {} referenced from transaction {}:{} does not exist",
                txin.previous_out_point, tx_hash, input_index
            ))
        })?;
        if utxo.is_spent() {
            return Err(RuleError::SpentTxOut(format!(
                "output {} referenced from transaction {}:{} has already been spent",
                txin.previous_out_point, tx_hash, input_index
            ))
            .into());
        }

        // Coinbase outputs season before they can be spent; pool outputs
        // are exempt since the next coinbase rolls them forward at once.
        if utxo.is_coinbase() && !utxo.is_pool() {
            let origin_height = utxo.block_height();
            let blocks_since_prev = tx_height - origin_height;
            if blocks_since_prev < params.coinbase_maturity {
                return Err(RuleError::ImmatureSpend(format!(
                    "tried to spend coinbase transaction output {} from height {} at height {} before required maturity of {} blocks",
                    txin.previous_out_point, origin_height, tx_height, params.coinbase_maturity
                ))
                .into());
            }
        }

        let origin_satoshi = utxo.amount();
        if origin_satoshi < 0 {
            return Err(RuleError::BadTxOutValue(format!(
                "transaction output has negative value of {}",
                origin_satoshi
            ))
            .into());
        }
        if origin_satoshi > params.max_satoshi {
            return Err(RuleError::BadTxOutValue(format!(
                "transaction output value of {} is higher than max allowed value of {}",
                origin_satoshi, params.max_satoshi
            ))
            .into());
        }

        let last_satoshi_in = total_satoshi_in;
        total_satoshi_in = total_satoshi_in.wrapping_add(origin_satoshi);
        if total_satoshi_in < last_satoshi_in || total_satoshi_in > params.max_satoshi {
            return Err(RuleError::BadTxOutValue(format!(
                "total value of all transaction inputs is {} which is higher than max allowed value of {}",
                total_satoshi_in, params.max_satoshi
            ))
            .into());
        }
    }

    let total_satoshi_out: i64 = tx.outputs.iter().map(|txout| txout.value).sum();
    if total_satoshi_in < total_satoshi_out {
        return Err(RuleError::SpendTooHigh(format!(
            "total value of all transaction inputs for transaction {} is {} which is less than the amount spent of {}",
            tx_hash, total_satoshi_in, total_satoshi_out
        ))
        .into());
    }

    Ok(total_satoshi_in - total_satoshi_out)
}

impl Chain {
    /// Context-free header checks: target range, seal, timestamp bounds.
    fn check_block_header_sanity(
        &self,
        header: &BlockHeader,
        flags: BehaviorFlags,
    ) -> ConsensusResult<()> {
        check_proof_of_work(
            header,
            &self.params.pow_limit,
            flags,
            self.services.seal.as_ref(),
        )?;

        // Timestamps carry whole seconds by representation, so the
        // second-precision rule needs no separate check here.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if header.timestamp > now + ALLOWED_FUTURE_BLOCK_TIME {
            return Err(RuleError::InvalidTime(format!(
                "block timestamp of {} is beyond the current time",
                header.timestamp
            ))
            .into());
        }

        // Once the SEQ deployment applies, a header's timestamp must be
        // strictly greater than its predecessor's.
        let seq = &self.params.deployments[DEPLOYMENT_SEQ];
        if seq.start_time < header.timestamp {
            if let Some(prev_block) = self.services.store.block_by_hash(&header.prev_block) {
                if prev_block.header.timestamp >= header.timestamp {
                    return Err(RuleError::InvalidTime(format!(
                        "prev header timestamp {} >= header {}",
                        prev_block.header.timestamp, header.timestamp
                    ))
                    .into());
                }
            }
        }

        let max_timestamp = self.services.time_source.adjusted_time() + MAX_TIME_OFFSET_SECONDS;
        if header.timestamp > max_timestamp {
            return Err(RuleError::TimeTooNew {
                timestamp: header.timestamp,
            }
            .into());
        }

        Ok(())
    }

    pub(crate) fn check_block_sanity_flags(
        &self,
        block: &Block,
        flags: BehaviorFlags,
    ) -> ConsensusResult<()> {
        self.check_block_header_sanity(&block.header, flags)?;

        if block.transactions.is_empty() {
            return Err(RuleError::NoTransactions.into());
        }

        let transactions = &block.transactions;
        if !is_coinbase_tx(&transactions[0], &self.params) {
            return Err(RuleError::FirstTxNotCoinbase.into());
        }
        for (i, tx) in transactions[1..].iter().enumerate() {
            if is_coinbase_tx(tx, &self.params) {
                return Err(RuleError::MultipleCoinbases(i + 1).into());
            }
        }

        let magnetic_anomaly = flags.has_flag(BehaviorFlags::MAGNETIC_ANOMALY);
        let mut script_flags = ScriptFlags::NONE;
        if magnetic_anomaly {
            script_flags |= ScriptFlags::VERIFY_SIG_PUSH_ONLY
                | ScriptFlags::VERIFY_CLEAN_STACK
                | ScriptFlags::VERIFY_CHECK_DATA_SIG;
        }

        // Per-transaction sanity, and the canonical ordering of the
        // non-coinbase transactions when magnetic anomaly applies.
        let mut last_txid: Option<Hash256> = None;
        for (i, tx) in transactions.iter().enumerate() {
            let tx_hash = tx.hash();
            if magnetic_anomaly && i > 1 {
                if let Some(last) = last_txid {
                    if last >= tx_hash {
                        return Err(RuleError::InvalidTxOrder.into());
                    }
                }
            }
            last_txid = Some(tx_hash);
            check_transaction_sanity(tx, magnetic_anomaly, script_flags, &self.params)?;
        }

        let calculated_merkle_root = build_merkle_root(transactions);
        if block.header.merkle_root != calculated_merkle_root {
            return Err(RuleError::BadMerkleRoot {
                header: block.header.merkle_root,
                calculated: calculated_merkle_root,
            }
            .into());
        }

        let mut existing_tx_hashes = HashSet::with_capacity(transactions.len());
        for tx in transactions {
            let tx_hash = tx.hash();
            if !existing_tx_hashes.insert(tx_hash) {
                return Err(RuleError::DuplicateTx(tx_hash).into());
            }
        }

        Ok(())
    }

    /// Context-free block checks.
    pub fn check_block_sanity(
        &self,
        block: &Block,
        magnetic_anomaly_active: bool,
    ) -> ConsensusResult<()> {
        let mut flags = BehaviorFlags::NONE;
        if magnetic_anomaly_active {
            flags |= BehaviorFlags::MAGNETIC_ANOMALY;
        }
        self.check_block_sanity_flags(block, flags)
    }

    /// Contextual header checks against its position in the chain.
    fn header_context(
        &self,
        header: &BlockHeader,
        prev_node: &BlockNode,
        tip: Option<&BlockNode>,
        flags: BehaviorFlags,
    ) -> ConsensusResult<()> {
        let block_height = prev_node.height + 1;

        if !flags.has_flag(BehaviorFlags::FAST_ADD) {
            let expected_difficulty = difficulty::calc_next_required_difficulty(
                Some(prev_node),
                header.timestamp,
                &self.params,
            )?;
            debug!(
                block_height,
                hash = %header.block_hash(),
                timestamp = header.timestamp,
                "checking header context"
            );
            if header.bits != expected_difficulty {
                return Err(RuleError::UnexpectedDifficulty(format!(
                    "block difficulty of {} is not the expected value of {}",
                    header.bits, expected_difficulty
                ))
                .into());
            }

            let median_time = prev_node.calc_past_median_time();
            if header.timestamp <= median_time {
                return Err(RuleError::TimeTooOld {
                    timestamp: header.timestamp,
                    median: median_time,
                }
                .into());
            }
        }

        // The chain must line up with the predetermined checkpoints, and
        // new blocks must not fork the chain before the latest one.
        let block_hash = header.block_hash();
        if let Some(checkpoint) = self.params.checkpoint_at(block_height) {
            if checkpoint.hash != block_hash.to_string() {
                return Err(RuleError::BadCheckpoint(block_height).into());
            }
        }
        if let Some(tip) = tip {
            let previous_checkpoint = self
                .params
                .checkpoints
                .iter()
                .rev()
                .find(|checkpoint| checkpoint.height <= tip.height);
            if let Some(checkpoint) = previous_checkpoint {
                if block_height < checkpoint.height {
                    return Err(RuleError::ForkTooOld {
                        height: block_height,
                        checkpoint: checkpoint.height,
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Contextual header checks against the current best chain. Takes the
    /// chain lock.
    pub fn check_block_header_context(&self, header: &BlockHeader) -> ConsensusResult<()> {
        let inner = self.inner.lock();
        let tip = inner.tip.as_deref().ok_or_else(|| {
            RuleError::Assertion("chain index has no tip".to_string())
        })?;

        self.check_block_header_sanity(header, BehaviorFlags::NONE)?;
        self.header_context(header, tip, Some(tip), BehaviorFlags::NONE)
    }

    /// Contextual block checks against its position in the chain.
    fn block_context(
        &self,
        block: &Block,
        prev_node: &BlockNode,
        tip: Option<&BlockNode>,
        flags: BehaviorFlags,
    ) -> ConsensusResult<()> {
        self.header_context(&block.header, prev_node, tip, flags)?;

        let max_block_size = self.params.excessive_block_size as usize;
        let num_tx = block.transactions.len();
        if num_tx > max_block_size {
            return Err(RuleError::BlockTooBig(format!(
                "block contains too many transactions - got {}, max {}",
                num_tx, max_block_size
            ))
            .into());
        }
        let serialized_size = block.serialized_size();
        if serialized_size > max_block_size {
            return Err(RuleError::BlockTooBig(format!(
                "serialized block is too big - got {}, max {}",
                serialized_size, max_block_size
            ))
            .into());
        }

        if !flags.has_flag(BehaviorFlags::FAST_ADD) {
            // Under an active CSV deployment, lock-time finality runs
            // against the median time past instead of the block time.
            let block_time = if self.csv_state(Some(prev_node)) == ThresholdState::Active {
                prev_node.calc_past_median_time()
            } else {
                block.header.timestamp
            };
            let block_height = prev_node.height + 1;

            for tx in &block.transactions {
                if !is_finalized_transaction(tx, block_height, block_time) {
                    return Err(RuleError::UnfinalizedTx(tx.hash().to_string()).into());
                }
            }

            check_serialized_height(&block.transactions[0], block_height)?;
        }

        Ok(())
    }

    /// The connect-time fixed point: load the referenced utxos, run every
    /// input and subsidy check, and mutate the view as if the block were
    /// connected. Must run under the chain lock.
    #[instrument(skip_all, fields(height = node.height, hash = %node.hash))]
    pub(crate) fn check_connect_block(
        &self,
        node: &BlockNode,
        block: &Block,
        view: &mut UtxoView,
        stxos: Option<&mut Vec<SpentTxOut>>,
        cancel: &CancelToken,
    ) -> ConsensusResult<()> {
        // The coinbase of the genesis block is not spendable.
        if node.hash == self.params.genesis_hash {
            return Err(RuleError::MissingTxOut(
                "the coinbase for the genesis block is not spendable".to_string(),
            )
            .into());
        }

        view.add_input_utxos(self.services.utxo_cache.as_ref(), block)?;

        // The full flag set blocks run under.
        let mut script_flags = ScriptFlags::BIP16
            | ScriptFlags::VERIFY_DER_SIGNATURES
            | ScriptFlags::VERIFY_CHECK_LOCK_TIME_VERIFY
            | ScriptFlags::VERIFY_STRICT_ENCODING
            | ScriptFlags::VERIFY_BIP143_SIG_HASH
            | ScriptFlags::VERIFY_LOW_S
            | ScriptFlags::VERIFY_NULL_FAIL
            | ScriptFlags::VERIFY_SIG_PUSH_ONLY
            | ScriptFlags::VERIFY_CLEAN_STACK
            | ScriptFlags::VERIFY_CHECK_DATA_SIG
            | ScriptFlags::VERIFY_SCHNORR
            | ScriptFlags::VERIFY_ALLOW_SEGWIT_RECOVERY;

        // Block-wide sigop budget, including the precise pay-to-script-hash
        // counts the sanity pass cannot see.
        let transactions = &block.transactions;
        let max_sig_ops = max_block_sig_ops(block.serialized_size());
        let mut total_sig_ops = 0usize;
        for (i, tx) in transactions.iter().enumerate() {
            let sig_ops = get_sig_ops(tx, i == 0, view, script_flags)?;
            let last_total = total_sig_ops;
            total_sig_ops = total_sig_ops.wrapping_add(sig_ops);
            if total_sig_ops < last_total || total_sig_ops > max_sig_ops {
                return Err(RuleError::TooManySigOps(format!(
                    "block contains too many signature operations - got {}, max {}",
                    total_sig_ops, max_sig_ops
                ))
                .into());
            }
        }

        let mut total_fees = 0i64;
        for tx in transactions {
            let tx_fee = check_transaction_inputs(tx, node.height, view, &self.params)?;
            let last_total_fees = total_fees;
            total_fees = total_fees.wrapping_add(tx_fee);
            if total_fees < last_total_fees {
                return Err(RuleError::BadFees(
                    "total fees for block overflows accumulator".to_string(),
                )
                .into());
            }
        }

        check_tx_sequence(block, node.height, view, &self.params)?;

        // Outputs-then-inputs connect of the whole block. Cancellation must
        // surface; any other connect failure is not propagated from here,
        // and the view's all-or-nothing contract leaves no partial state.
        if let Err(err) = view.connect_transactions(block, node.height, stxos, false, cancel) {
            if matches!(err, StateError::Cancelled) {
                return Err(err.into());
            }
            warn!(height = node.height, error = %err, "connect failed");
            return Ok(());
        }

        // The miner output may not exceed subsidy plus fees.
        let coinbase_payout = transactions[0]
            .outputs
            .first()
            .map_or(0, |txout| txout.value);
        let amount_subsidy = calc_block_subsidy(node.height, &self.params);
        let expected_payout = amount_subsidy + total_fees;
        if coinbase_payout > expected_payout {
            return Err(RuleError::BadCoinbaseValue(format!(
                "coinbase transaction for block pays {} which is more than expected value of {}",
                coinbase_payout, expected_payout
            ))
            .into());
        }

        // Reconcile the pooled subsidy flows against the previous block.
        let prev_hash = block.header.prev_block;
        let prev_height = node.height - 1;
        if prev_height > 0 {
            let prev_block = self
                .services
                .store
                .block_by_hash_and_height(&prev_hash, prev_height)
                .ok_or_else(|| {
                    RuleError::PrevBlockNotBest(format!(
                        "cannot get previous block {} at height {}",
                        prev_hash, prev_height
                    ))
                })?;
            check_block_subsidy(
                block,
                &prev_block,
                node.height,
                view,
                amount_subsidy,
                &self.params,
            )?;
        }

        // Script execution is the expensive part; blocks at or below the
        // latest checkpoint are already pinned by the merkle root.
        let run_scripts = match self.params.latest_checkpoint() {
            Some(checkpoint) => node.height > checkpoint.height,
            None => true,
        };

        if self.csv_state(node.parent.as_deref()) == ThresholdState::Active {
            script_flags |= ScriptFlags::VERIFY_CHECK_SEQUENCE_VERIFY;

            // Relative lock-times are judged against the previous block's
            // median time past.
            let median_time = node
                .parent
                .as_deref()
                .map(BlockNode::calc_past_median_time)
                .unwrap_or(0);
            for (i, tx) in transactions.iter().enumerate() {
                let sequence_lock = calc_sequence_lock(node, tx, view, i == 0)?;
                if !sequence_lock_active(&sequence_lock, node.height, median_time) {
                    return Err(RuleError::UnfinalizedTx(
                        "block contains transaction whose input sequence locks are not met"
                            .to_string(),
                    )
                    .into());
                }
            }
        }

        if run_scripts {
            self.services
                .scripts
                .check_block_scripts(block, view, script_flags)?;
        }

        debug!(height = node.height, fees = total_fees, "block connects cleanly");
        Ok(())
    }

    /// Fully validate that `block` connects to the current best-chain tip,
    /// proof-of-work aside. Takes the chain lock.
    pub fn check_connect_block_template(
        &self,
        block: &Block,
        cancel: &CancelToken,
    ) -> ConsensusResult<()> {
        let inner = self.inner.lock();
        let tip = inner.tip.clone().ok_or_else(|| {
            RuleError::Assertion("chain index has no tip".to_string())
        })?;

        if tip.hash != block.header.prev_block {
            return Err(RuleError::PrevBlockNotBest(format!(
                "previous block must be the current chain tip {}, instead got {}",
                tip.hash, block.header.prev_block
            ))
            .into());
        }

        let flags = BehaviorFlags::NO_POW_CHECK | BehaviorFlags::MAGNETIC_ANOMALY;
        self.check_block_sanity_flags(block, flags)?;
        self.block_context(block, &tip, Some(tip.as_ref()), flags)?;

        let mut view = UtxoView::new();
        let node = BlockNode::new(&block.header, Some(tip));
        self.check_connect_block(&node, block, &mut view, None, cancel)
    }

    /// Verify every entangle-bearing transaction of a block against the
    /// foreign chains, and their in-block ordering by deposit height.
    /// Takes the chain lock; foreign RPC runs under it.
    pub fn check_block_entangle(&self, block: &Block, cancel: &CancelToken) -> ConsensusResult<()> {
        let _inner = self.inner.lock();

        let mut current_height = 0i64;
        for tx in &block.transactions {
            let Some(infos) = is_entangle_tx(tx) else {
                continue;
            };
            let max_height = infos
                .values()
                .map(|info| info.height as i64)
                .max()
                .unwrap_or(0);
            if current_height > max_height {
                return Err(RuleError::EntangleUnordered.into());
            }
            current_height = max_height;

            self.services.entangle.verify_entangle_tx(tx, cancel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_util::{test_chain, FixedSeal};
    use crate::chain::{ChainServices, NoopScriptExecutor, SystemTimeSource};
    use crate::chain_params::Checkpoint;
    use crate::params::BASE_SUBSIDY;
    use braid_primitives::script::pay_to_pubkey_hash_script;
    use braid_primitives::{sha256d, OutPoint, TxIn, TxOut};
    use braid_state::{StateResult, UtxoCache, UtxoEntry};
    use std::collections::HashMap;
    use std::sync::Arc;

    const REGTEST_BITS: u32 = 0x207fffff;
    const BASE_TIME: i64 = 1_600_000_000;

    /// Coinbase for a pre-entangle height: height-prefixed script padded so
    /// the transaction clears the minimum size rule.
    fn small_coinbase(height: u8, payout: i64) -> Transaction {
        let mut script = vec![0x01, height];
        script.extend_from_slice(&[0u8; 58]);
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::NULL, script)],
            outputs: vec![TxOut::new(payout, pay_to_pubkey_hash_script(&[7u8; 20]))],
            lock_time: 0,
        }
    }

    fn spending_tx(funding: OutPoint, value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(funding, vec![0u8; 70])],
            outputs: vec![TxOut::new(value, pay_to_pubkey_hash_script(&[8u8; 20]))],
            lock_time: 0,
        }
    }

    fn sealed_block(prev: Hash256, timestamp: i64, txs: Vec<Transaction>) -> Block {
        let header = BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: build_merkle_root(&txs),
            timestamp,
            bits: REGTEST_BITS,
            nonce: 0,
        };
        Block::new(header, txs)
    }

    struct MapUtxoCache(HashMap<OutPoint, UtxoEntry>);

    impl UtxoCache for MapUtxoCache {
        fn fetch_entry(&self, outpoint: &OutPoint) -> StateResult<Option<UtxoEntry>> {
            Ok(self.0.get(outpoint).cloned())
        }
    }

    /// A regtest chain with one registered genesis header and a funding
    /// utxo available through the cache.
    fn chain_at_height_one() -> (Chain, Block, OutPoint) {
        let params = ChainParams::regtest();
        let funding = OutPoint::new(sha256d(b"funding"), 0);
        let mut entries = HashMap::new();
        entries.insert(
            funding,
            UtxoEntry::new(5_000, pay_to_pubkey_hash_script(&[9u8; 20]), 0, false, false),
        );

        let store = Arc::new(crate::chain::test_util::MemoryBlockStore::default());
        let chain = Chain::new(
            params,
            ChainServices {
                time_source: Arc::new(SystemTimeSource),
                seal: Arc::new(FixedSeal(true)),
                scripts: Arc::new(NoopScriptExecutor),
                entangle: Arc::new(crate::chain::test_util::AcceptAllEntangles),
                entangle_cache: None,
                utxo_cache: Arc::new(MapUtxoCache(entries)),
                store,
            },
        );

        let genesis = sealed_block(Hash256::ZERO, BASE_TIME, vec![small_coinbase(0, 0)]);
        chain.register_header(&genesis.header);
        (chain, genesis, funding)
    }

    // ============ Coinbase Height Tests ============

    #[test]
    fn test_extract_coinbase_height_forms() {
        let mut tx = small_coinbase(7, 0);
        assert_eq!(extract_coinbase_height(&tx).unwrap(), 7);

        tx.inputs[0].signature_script = vec![OP_0];
        assert_eq!(extract_coinbase_height(&tx).unwrap(), 0);

        tx.inputs[0].signature_script = vec![OP_1 + 4];
        assert_eq!(extract_coinbase_height(&tx).unwrap(), 5);

        // Two-byte little-endian height.
        tx.inputs[0].signature_script = vec![0x02, 0x39, 0x05];
        assert_eq!(extract_coinbase_height(&tx).unwrap(), 0x0539);

        tx.inputs[0].signature_script = vec![0x04, 0x01];
        assert!(extract_coinbase_height(&tx).is_err());

        tx.inputs[0].signature_script = Vec::new();
        assert!(extract_coinbase_height(&tx).is_err());
    }

    #[test]
    fn test_check_serialized_height_mismatch() {
        let coinbase = small_coinbase(100, 0);
        assert!(check_serialized_height(&coinbase, 100).is_ok());
        let err = check_serialized_height(&coinbase, 101).unwrap_err();
        assert!(matches!(
            err,
            crate::ValidateError::Rule(RuleError::BadCoinbaseHeight { got: 100, want: 101 })
        ));
    }

    // ============ Transaction Sanity Tests ============

    fn sanity(tx: &Transaction) -> ConsensusResult<()> {
        check_transaction_sanity(tx, false, ScriptFlags::NONE, &ChainParams::regtest())
    }

    #[test]
    fn test_sanity_requires_inputs_and_outputs() {
        let mut tx = spending_tx(OutPoint::new(sha256d(b"x"), 0), 1);
        tx.inputs.clear();
        assert!(matches!(
            sanity(&tx),
            Err(crate::ValidateError::Rule(RuleError::NoTxInputs))
        ));

        let mut tx = spending_tx(OutPoint::new(sha256d(b"x"), 0), 1);
        tx.outputs.clear();
        assert!(matches!(
            sanity(&tx),
            Err(crate::ValidateError::Rule(RuleError::NoTxOutputs))
        ));
    }

    #[test]
    fn test_sanity_rejects_duplicate_inputs() {
        let outpoint = OutPoint::new(sha256d(b"dup"), 0);
        let mut tx = spending_tx(outpoint, 1);
        tx.inputs.push(TxIn::new(outpoint, vec![]));
        assert!(matches!(
            sanity(&tx),
            Err(crate::ValidateError::Rule(RuleError::DuplicateTxInputs))
        ));
    }

    #[test]
    fn test_sanity_rejects_out_of_range_values() {
        let params = ChainParams::regtest();
        let mut tx = spending_tx(OutPoint::new(sha256d(b"x"), 0), 1);
        tx.outputs[0].value = -1;
        assert!(sanity(&tx).is_err());

        tx.outputs[0].value = params.max_satoshi + 1;
        assert!(sanity(&tx).is_err());

        // Two outputs summing above the cap.
        tx.outputs[0].value = params.max_satoshi;
        tx.outputs.push(TxOut::new(1, vec![0x51]));
        assert!(sanity(&tx).is_err());
    }

    #[test]
    fn test_sanity_rejects_null_outpoint_on_non_coinbase() {
        let tx = spending_tx(OutPoint::NULL, 1);
        assert!(matches!(
            sanity(&tx),
            Err(crate::ValidateError::Rule(RuleError::BadTxInput(_)))
        ));
    }

    #[test]
    fn test_sanity_min_size_only_post_fork() {
        let params = ChainParams::regtest();
        let tx = spending_tx(OutPoint::new(sha256d(b"x"), 0), 1);
        assert!(check_transaction_sanity(&tx, false, ScriptFlags::NONE, &params).is_ok());

        let mut tiny = tx.clone();
        tiny.inputs[0].signature_script.clear();
        assert!(matches!(
            check_transaction_sanity(&tiny, true, ScriptFlags::NONE, &params),
            Err(crate::ValidateError::Rule(RuleError::TxTooSmall { .. }))
        ));
    }

    #[test]
    fn test_sanity_coinbase_script_length() {
        let params = ChainParams::regtest();
        let mut coinbase = small_coinbase(1, 0);
        let mut script = vec![0x01, 0x01];
        script.extend_from_slice(&[0u8; 99]);
        coinbase.inputs[0].signature_script = script;
        assert!(matches!(
            check_transaction_sanity(&coinbase, false, ScriptFlags::NONE, &params),
            Err(crate::ValidateError::Rule(
                RuleError::BadCoinbaseScriptLen { length: 101, .. }
            ))
        ));
    }

    // ============ Proof of Work Tests ============

    #[test]
    fn test_check_proof_of_work_rejects_high_hash() {
        let params = ChainParams::mainnet();
        let header = BlockHeader {
            version: 1,
            prev_block: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: BASE_TIME,
            bits: 0x1d00ffff,
            nonce: 12345,
        };
        let err =
            check_proof_of_work(&header, &params.pow_limit, BehaviorFlags::NONE, &FixedSeal(false))
                .unwrap_err();
        assert!(matches!(
            err,
            crate::ValidateError::Rule(RuleError::HighHash(_))
        ));

        // The template flag skips the seal entirely.
        check_proof_of_work(
            &header,
            &params.pow_limit,
            BehaviorFlags::NO_POW_CHECK,
            &FixedSeal(false),
        )
        .unwrap();
    }

    #[test]
    fn test_check_proof_of_work_target_range() {
        let params = ChainParams::mainnet();
        let mut header = BlockHeader {
            version: 1,
            prev_block: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: BASE_TIME,
            bits: 0,
            nonce: 0,
        };
        assert!(check_proof_of_work(&header, &params.pow_limit, BehaviorFlags::NONE, &FixedSeal(true)).is_err());

        // Easier than the limit.
        header.bits = 0x207fffff;
        assert!(check_proof_of_work(&header, &params.pow_limit, BehaviorFlags::NONE, &FixedSeal(true)).is_err());
    }

    // ============ Block Sanity Tests ============

    #[test]
    fn test_block_sanity_structure() {
        let (chain, genesis, funding) = chain_at_height_one();

        let empty = Block::new(genesis.header, Vec::new());
        assert!(matches!(
            chain.check_block_sanity(&empty, false),
            Err(crate::ValidateError::Rule(RuleError::NoTransactions))
        ));

        let headless = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![spending_tx(funding, 1)],
        );
        assert!(matches!(
            chain.check_block_sanity(&headless, false),
            Err(crate::ValidateError::Rule(RuleError::FirstTxNotCoinbase))
        ));

        let doubled = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), small_coinbase(1, 1)],
        );
        assert!(matches!(
            chain.check_block_sanity(&doubled, false),
            Err(crate::ValidateError::Rule(RuleError::MultipleCoinbases(1)))
        ));
    }

    #[test]
    fn test_block_sanity_merkle_and_duplicates() {
        let (chain, genesis, funding) = chain_at_height_one();

        let mut bad_root = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), spending_tx(funding, 1)],
        );
        bad_root.header.merkle_root = sha256d(b"wrong");
        assert!(matches!(
            chain.check_block_sanity(&bad_root, false),
            Err(crate::ValidateError::Rule(RuleError::BadMerkleRoot { .. }))
        ));

        let tx = spending_tx(funding, 1);
        let duplicated = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), tx.clone(), tx],
        );
        assert!(matches!(
            chain.check_block_sanity(&duplicated, false),
            Err(crate::ValidateError::Rule(RuleError::DuplicateTx(_)))
        ));
    }

    #[test]
    fn test_block_sanity_ctor_ordering() {
        let (chain, genesis, _) = chain_at_height_one();

        let tx_a = spending_tx(OutPoint::new(sha256d(b"a"), 0), 1);
        let tx_b = spending_tx(OutPoint::new(sha256d(b"b"), 0), 2);
        let (lo, hi) = if tx_a.hash() < tx_b.hash() {
            (tx_a, tx_b)
        } else {
            (tx_b, tx_a)
        };

        let unordered = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), hi.clone(), lo.clone()],
        );
        assert!(matches!(
            chain.check_block_sanity(&unordered, true),
            Err(crate::ValidateError::Rule(RuleError::InvalidTxOrder))
        ));

        // The same transactions sorted by hash pass the ordering rule.
        let ordered = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), lo, hi],
        );
        assert!(chain.check_block_sanity(&ordered, true).is_ok());

        // Without magnetic anomaly the order is not enforced.
        let header_time = BASE_TIME + 30;
        let tx_c = spending_tx(OutPoint::new(sha256d(b"c"), 0), 3);
        let tx_d = spending_tx(OutPoint::new(sha256d(b"d"), 0), 4);
        let (lo2, hi2) = if tx_c.hash() < tx_d.hash() {
            (tx_c, tx_d)
        } else {
            (tx_d, tx_c)
        };
        let legacy = sealed_block(
            genesis.block_hash(),
            header_time,
            vec![small_coinbase(1, 0), hi2, lo2],
        );
        assert!(chain.check_block_sanity(&legacy, false).is_ok());
    }

    #[test]
    fn test_header_sanity_time_bounds() {
        let (chain, genesis, _) = chain_at_height_one();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        let mut far_future = genesis.header;
        far_future.timestamp = now + 3 * 60 * 60;
        assert!(chain
            .check_block_header_sanity(&far_future, BehaviorFlags::NONE)
            .is_err());

        let mut slightly_future = genesis.header;
        slightly_future.timestamp = now + 60;
        assert!(matches!(
            chain.check_block_header_sanity(&slightly_future, BehaviorFlags::NONE),
            Err(crate::ValidateError::Rule(RuleError::InvalidTime(_)))
        ));
    }

    #[test]
    fn test_header_sanity_adjusted_time_bound() {
        // With a network-adjusted clock lagging the wall clock, the
        // two-hour bound fires on its own.
        let (chain, _store) = test_chain(ChainParams::regtest());
        let header = BlockHeader {
            version: 1,
            prev_block: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: BASE_TIME + MAX_TIME_OFFSET_SECONDS + 1,
            bits: REGTEST_BITS,
            nonce: 0,
        };
        assert!(matches!(
            chain.check_block_header_sanity(&header, BehaviorFlags::NONE),
            Err(crate::ValidateError::Rule(RuleError::TimeTooNew { .. }))
        ));
    }

    #[test]
    fn test_header_sanity_seq_requires_strictly_later_timestamp() {
        // Regtest's SEQ deployment is always active, so a header must carry
        // a timestamp strictly greater than its stored predecessor's.
        let (chain, store) = test_chain(ChainParams::regtest());
        let prev = sealed_block(Hash256::ZERO, BASE_TIME, vec![small_coinbase(0, 0)]);
        store.insert(&prev);

        let header_at = |timestamp: i64| BlockHeader {
            version: 1,
            prev_block: prev.block_hash(),
            merkle_root: Hash256::ZERO,
            timestamp,
            bits: REGTEST_BITS,
            nonce: 0,
        };

        // Equal and earlier timestamps are both rejected.
        for timestamp in [BASE_TIME, BASE_TIME - 1] {
            assert!(matches!(
                chain.check_block_header_sanity(&header_at(timestamp), BehaviorFlags::NONE),
                Err(crate::ValidateError::Rule(RuleError::InvalidTime(_)))
            ));
        }

        assert!(chain
            .check_block_header_sanity(&header_at(BASE_TIME + 1), BehaviorFlags::NONE)
            .is_ok());

        // A header whose parent is not in the store is not held to the rule.
        let mut orphan = header_at(BASE_TIME);
        orphan.prev_block = sha256d(b"unknown parent");
        assert!(chain
            .check_block_header_sanity(&orphan, BehaviorFlags::NONE)
            .is_ok());
    }

    // ============ Context Tests ============

    #[test]
    fn test_header_context_difficulty_and_time() {
        let (chain, genesis, _) = chain_at_height_one();
        let tip = chain.tip().unwrap();

        let mut header = genesis.header;
        header.prev_block = genesis.block_hash();
        header.timestamp = BASE_TIME + 30;
        header.bits = 0x1d00ffff;
        assert!(matches!(
            chain.header_context(&header, &tip, Some(tip.as_ref()), BehaviorFlags::NONE),
            Err(crate::ValidateError::Rule(RuleError::UnexpectedDifficulty(_)))
        ));

        header.bits = REGTEST_BITS;
        header.timestamp = BASE_TIME;
        assert!(matches!(
            chain.header_context(&header, &tip, Some(tip.as_ref()), BehaviorFlags::NONE),
            Err(crate::ValidateError::Rule(RuleError::TimeTooOld { .. }))
        ));

        header.timestamp = BASE_TIME + 30;
        assert!(chain
            .header_context(&header, &tip, Some(tip.as_ref()), BehaviorFlags::NONE)
            .is_ok());
    }

    #[test]
    fn test_header_context_checkpoints() {
        let (mut chain, genesis, _) = {
            let (chain, genesis, funding) = chain_at_height_one();
            (chain, genesis, funding)
        };
        chain.params.checkpoints = vec![Checkpoint {
            height: 1,
            hash: sha256d(b"not the block").to_string(),
        }];
        let tip = chain.tip().unwrap();

        let mut header = genesis.header;
        header.prev_block = genesis.block_hash();
        header.timestamp = BASE_TIME + 30;
        assert!(matches!(
            chain.header_context(&header, &tip, Some(tip.as_ref()), BehaviorFlags::NONE),
            Err(crate::ValidateError::Rule(RuleError::BadCheckpoint(1)))
        ));
    }

    #[test]
    fn test_block_context_coinbase_height_mismatch() {
        let (chain, genesis, _) = chain_at_height_one();
        let tip = chain.tip().unwrap();

        // Height 1 block whose coinbase claims height 100.
        let block = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(100, 0)],
        );
        assert!(matches!(
            chain.block_context(&block, &tip, Some(tip.as_ref()), BehaviorFlags::NONE),
            Err(crate::ValidateError::Rule(RuleError::BadCoinbaseHeight {
                got: 100,
                want: 1
            }))
        ));
    }

    #[test]
    fn test_block_context_unfinalized_tx() {
        let (chain, genesis, funding) = chain_at_height_one();
        let tip = chain.tip().unwrap();

        let mut tx = spending_tx(funding, 1);
        tx.lock_time = 10_000; // below the threshold: a height lock far ahead
        tx.inputs[0].sequence = 0;
        let block = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), tx],
        );
        assert!(matches!(
            chain.block_context(&block, &tip, Some(tip.as_ref()), BehaviorFlags::NONE),
            Err(crate::ValidateError::Rule(RuleError::UnfinalizedTx(_)))
        ));
    }

    // ============ Connect Tests ============

    #[test]
    fn test_connect_template_happy_path() {
        let (chain, genesis, funding) = chain_at_height_one();
        let fee = 1_000;
        let block = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![
                small_coinbase(1, BASE_SUBSIDY + fee),
                spending_tx(funding, 5_000 - fee),
            ],
        );
        chain
            .check_connect_block_template(&block, &CancelToken::new())
            .unwrap();
    }

    #[test]
    fn test_connect_template_rejects_subsidy_overpay() {
        let (chain, genesis, funding) = chain_at_height_one();
        let fee = 1_000;
        let block = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![
                small_coinbase(1, BASE_SUBSIDY + fee + 1),
                spending_tx(funding, 5_000 - fee),
            ],
        );
        let err = chain
            .check_connect_block_template(&block, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::ValidateError::Rule(RuleError::BadCoinbaseValue(_))
        ));
    }

    #[test]
    fn test_connect_template_requires_tip_parent() {
        let (chain, _genesis, _) = chain_at_height_one();
        let block = sealed_block(sha256d(b"elsewhere"), BASE_TIME + 30, vec![small_coinbase(1, 0)]);
        assert!(matches!(
            chain.check_connect_block_template(&block, &CancelToken::new()),
            Err(crate::ValidateError::Rule(RuleError::PrevBlockNotBest(_)))
        ));
    }

    #[test]
    fn test_connect_missing_input_fails_input_check() {
        // A spend of an unknown output fails input checking before the
        // connect pass even runs.
        let (chain, genesis, _) = chain_at_height_one();
        let block = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![
                small_coinbase(1, BASE_SUBSIDY),
                spending_tx(OutPoint::new(sha256d(b"unknown"), 0), 1),
            ],
        );
        assert!(matches!(
            chain.check_connect_block_template(&block, &CancelToken::new()),
            Err(crate::ValidateError::Rule(RuleError::MissingTxOut(_)))
        ));
    }

    #[test]
    fn test_connect_cancelled() {
        let (chain, genesis, funding) = chain_at_height_one();
        let block = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, BASE_SUBSIDY), spending_tx(funding, 4_000)],
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = chain
            .check_connect_block_template(&block, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_connect_rejects_immature_coinbase_spend() {
        let params = ChainParams::regtest();
        let coinbase_outpoint = OutPoint::new(sha256d(b"young coinbase"), 0);
        let mut view = UtxoView::new();
        view.add_entry(
            coinbase_outpoint,
            UtxoEntry::new(1_000, vec![0x51], 0, true, false),
        );

        let tx = spending_tx(coinbase_outpoint, 500);
        let err = check_transaction_inputs(&tx, 5, &view, &params).unwrap_err();
        assert!(matches!(
            err,
            crate::ValidateError::Rule(RuleError::ImmatureSpend(_))
        ));

        // Pool utxos are exempt from maturity.
        let pool_outpoint = OutPoint::new(sha256d(b"pool"), 1);
        view.add_entry(
            pool_outpoint,
            UtxoEntry::new(1_000, vec![0x51], 0, true, true),
        );
        let pool_spend = spending_tx(pool_outpoint, 500);
        assert_eq!(
            check_transaction_inputs(&pool_spend, 5, &view, &params).unwrap(),
            500
        );
    }

    // ============ Entangle Ordering Tests ============

    #[test]
    fn test_check_block_entangle_ordering() {
        use braid_cross::{EntangleTxInfo, ExpandedTxType};
        use braid_primitives::script::entangle_script;
        use num_bigint::BigInt;

        let (chain, genesis, _) = chain_at_height_one();

        let entangle_at = |height: u64| {
            let info = EntangleTxInfo {
                ex_type: ExpandedTxType::Doge,
                index: 0,
                height,
                amount: BigInt::from(100),
                ext_tx_hash: vec![height as u8],
            };
            Transaction {
                version: 1,
                inputs: vec![TxIn::new(OutPoint::new(sha256d(b"in"), height as u32), vec![])],
                outputs: vec![TxOut::new(0, entangle_script(&info.serialize()))],
                lock_time: 0,
            }
        };

        let ordered = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), entangle_at(100), entangle_at(200)],
        );
        chain
            .check_block_entangle(&ordered, &CancelToken::new())
            .unwrap();

        let unordered = sealed_block(
            genesis.block_hash(),
            BASE_TIME + 30,
            vec![small_coinbase(1, 0), entangle_at(200), entangle_at(100)],
        );
        assert!(matches!(
            chain.check_block_entangle(&unordered, &CancelToken::new()),
            Err(crate::ValidateError::Rule(RuleError::EntangleUnordered))
        ));
    }
}
