//! Block subsidy and pool accounting.
//!
//! After entanglement activates, the coinbase carries a pooled layout:
//! out[0] pays the miner, out[1] and out[2] roll the two pool balances
//! forward, out[3] carries the serialized keeped amount, and out[4..] mint
//! the braid credited to this block's entangle deposits. The checks here
//! reconcile those flows against the previous block and the minting curves.

use crate::chain_params::ChainParams;
use crate::error::{ConsensusResult, RuleError};
use crate::params::BASE_SUBSIDY;
use crate::validate::is_coinbase_tx;
use braid_cross::{
    is_entangle_tx, pre_calc_entangle_amount, verify_txs_sequence, EntangleItem, EntangleTxInfo,
    EtsInfo, KeepedAmount, KeepedItem,
};
use braid_primitives::script::pay_to_pubkey_hash_script;
use braid_primitives::{Block, Transaction};
use braid_state::{UtxoEntry, UtxoView};
use num_traits::ToPrimitive;
use std::collections::BTreeMap;

/// Pubkey hash of the first internal pool.
pub const COIN_POOL1: [u8; 20] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
/// Pubkey hash of the second internal pool.
pub const COIN_POOL2: [u8; 20] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

/// The subsidy a block at `height` awards.
///
/// The base subsidy is divided by the halving count, not by a power of two:
/// `base / (height / interval)`, floored at one base unit.
pub fn calc_block_subsidy(height: i32, params: &ChainParams) -> i64 {
    if params.subsidy_reduction_interval == 0 {
        return BASE_SUBSIDY;
    }

    let halvings = (height / params.subsidy_reduction_interval) as i64;
    if halvings == 0 {
        return BASE_SUBSIDY;
    }

    let subsidy = BASE_SUBSIDY / halvings;
    if subsidy == 0 {
        1
    } else {
        subsidy
    }
}

/// Running totals gathered over one block for the subsidy reconciliation.
#[derive(Debug, Default)]
pub struct KeepedInfoSummary {
    pub total_in: i64,
    pub total_out: i64,
    pub keeped_in_block: KeepedAmount,
    pub entangle_amount: i64,
    pub last_pool1: i64,
    pub last_pool2: i64,
    pub pool1: i64,
    pub pool2: i64,
}

/// Parse the keeped amount carried by the previous block's coinbase out[3].
fn keeped_amount_from_prev_block(block: &Block) -> ConsensusResult<KeepedAmount> {
    if let Some(coinbase) = block.transactions.first() {
        if coinbase.outputs.len() >= 4 {
            return Ok(KeepedAmount::from_script(&coinbase.outputs[3].pk_script)?);
        }
    }
    Ok(KeepedAmount::default())
}

/// Read the carried pool balances out of the previous block's coinbase.
fn pool_amounts_from_prev_block(
    block: &Block,
    summary: &mut KeepedInfoSummary,
) -> ConsensusResult<()> {
    let coinbase = block.transactions.first().ok_or_else(|| {
        RuleError::Assertion("previous block has no coinbase".to_string())
    })?;
    if coinbase.outputs.len() < 3 {
        return Err(RuleError::Assertion(
            "previous coinbase is missing the pool outputs".to_string(),
        )
        .into());
    }
    summary.last_pool1 = coinbase.outputs[1].value;
    summary.last_pool2 = coinbase.outputs[2].value;
    Ok(())
}

/// Fold one transaction's entangle deposits into the block summary, running
/// each through the minting curve against the carried reserves.
fn handle_summary_entangle(
    summary: &mut KeepedInfoSummary,
    keep_info: &mut KeepedAmount,
    infos: &BTreeMap<u32, EntangleTxInfo>,
) {
    for info in infos.values() {
        let mut item = EntangleItem {
            e_type: info.ex_type,
            value: info.amount.clone(),
        };
        summary.keeped_in_block.add(KeepedItem {
            ex_type: item.e_type,
            amount: item.value.clone(),
        });
        pre_calc_entangle_amount(&mut item, keep_info);
        summary.entangle_amount += item.value.to_i64().unwrap_or(i64::MAX);
    }
}

/// Sum the value flows of a block against the previous block's carried
/// state and verify the minted entangle outputs.
pub fn summary_of_txs_and_check(
    prev_block: &Block,
    block: &Block,
    view: &UtxoView,
    subsidy: i64,
    pool1_amount: i64,
    pool2_amount: i64,
) -> ConsensusResult<KeepedInfoSummary> {
    let mut summary = KeepedInfoSummary::default();
    let mut keep_info = keeped_amount_from_prev_block(prev_block)?;
    pool_amounts_from_prev_block(prev_block, &mut summary)?;

    let mut total_in =
        summary.last_pool1 + summary.last_pool2 + pool1_amount + pool2_amount + subsidy;
    let mut total_out = 0i64;
    let mut minted = 0i64;

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        if tx_index == 0 {
            for (i, txout) in tx.outputs.iter().enumerate() {
                if i > 3 {
                    minted += txout.value;
                }
                if i == 1 {
                    summary.pool1 = txout.value;
                }
                if i == 2 {
                    summary.pool2 = txout.value;
                }
                total_out += txout.value;
            }
        } else {
            if let Some(infos) = is_entangle_tx(tx) {
                handle_summary_entangle(&mut summary, &mut keep_info, &infos);
            }
            for txout in &tx.outputs {
                total_out += txout.value;
            }
            let tx_hash = tx.hash();
            for (input_index, txin) in tx.inputs.iter().enumerate() {
                let utxo = view.lookup_entry(&txin.previous_out_point).ok_or_else(|| {
                    RuleError::MissingTxOut(format!(
                        "output {} referenced from transaction {}:{} does not valid",
                        txin.previous_out_point, tx_hash, input_index
                    ))
                })?;
                total_in += utxo.amount();
            }
        }
    }

    if minted != summary.entangle_amount {
        return Err(RuleError::EntangleAmountMismatch {
            got: minted,
            expected: summary.entangle_amount,
        }
        .into());
    }
    summary.total_in = total_in;
    summary.total_out = total_out;
    Ok(summary)
}

/// Reconcile the pooled subsidy flows of a block against the previous block.
pub fn check_block_subsidy(
    block: &Block,
    prev_block: &Block,
    tx_height: i32,
    view: &UtxoView,
    amount_subsidy: i64,
    params: &ChainParams,
) -> ConsensusResult<()> {
    if tx_height <= params.entangle_height {
        return Ok(());
    }

    let mut origin_income1 = amount_subsidy * 19 / 100;
    let mut origin_income2 = amount_subsidy / 100;
    let origin_income3 = amount_subsidy - origin_income1 - origin_income2;
    if tx_height == params.entangle_height {
        origin_income1 *= (params.entangle_height - 1) as i64;
        origin_income2 *= (params.entangle_height - 1) as i64;
    }

    let summary = summary_of_txs_and_check(
        prev_block,
        block,
        view,
        origin_income3,
        origin_income1,
        origin_income2,
    )?;

    let expected_pool1 = summary.last_pool1 + origin_income1 - summary.entangle_amount;
    if summary.pool1 != expected_pool1 {
        return Err(RuleError::EntanglePoolMismatch {
            pool: 1,
            got: summary.pool1,
            expected: expected_pool1,
            height: tx_height,
        }
        .into());
    }
    if origin_income2 + summary.last_pool2 != summary.pool2 {
        return Err(RuleError::EntanglePoolMismatch {
            pool: 2,
            got: summary.pool2,
            expected: origin_income2 + summary.last_pool2,
            height: tx_height,
        }
        .into());
    }
    if summary.total_out > summary.total_in {
        return Err(RuleError::BadCoinbaseValue(format!(
            "the totalOut > totalIn, [totalOut:{}, totalIn:{}] height:{}",
            summary.total_out, summary.total_in, tx_height
        ))
        .into());
    }
    Ok(())
}

/// Check that a referenced utxo pays the expected internal pool.
pub fn match_pool_from_utxo(utxo: &UtxoEntry, index: usize) -> ConsensusResult<()> {
    let pool = match index {
        1 => &COIN_POOL1,
        2 => &COIN_POOL2,
        _ => {
            return Err(RuleError::Assertion("wrong index of pool address".to_string()).into());
        }
    };
    let expected = pay_to_pubkey_hash_script(pool);
    if utxo.pk_script() != expected.as_slice() {
        return Err(RuleError::BadTxInput(format!(
            "pool {} utxo does not pay the pool script",
            index
        ))
        .into());
    }
    Ok(())
}

/// Handle the post-entangle merge coinbase: a coinbase spending the two pool
/// utxos forward. Returns `Ok(true)` when the transaction was a coinbase and
/// input checking is complete (pool script mismatches are accepted), an
/// error when a referenced pool utxo is missing, spent, or predates the
/// activation layout, and `Ok(false)` for ordinary transactions.
pub fn check_merge_tx_in_coinbase(
    tx: &Transaction,
    tx_height: i32,
    view: &UtxoView,
    params: &ChainParams,
) -> ConsensusResult<bool> {
    if params.entangle_height >= tx_height {
        if is_coinbase_tx(tx, params) {
            return Ok(true);
        }
        return Ok(false);
    }

    if !is_coinbase_tx(tx, params) {
        return Ok(false);
    }

    let tx_hash = tx.hash();
    for (input_index, txin) in tx.inputs.iter().enumerate() {
        if input_index == 0 {
            continue;
        }
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
        let utxo_height = utxo.block_height();
        if utxo_height < params.entangle_height - 1 {
            return Err(RuleError::BadTxOutValue(format!(
                "output {} referenced from the wrong height [{}, {}]",
                txin.previous_out_point,
                utxo_height,
                params.entangle_height - 1
            ))
            .into());
        }
        if input_index <= 2 && match_pool_from_utxo(utxo, input_index).is_err() {
            return Ok(true);
        }
    }
    Ok(true)
}

/// Fee paid by a transaction: inputs minus outputs. Zero for the coinbase.
pub fn get_fee(tx: &Transaction, view: &UtxoView, params: &ChainParams) -> ConsensusResult<i64> {
    if is_coinbase_tx(tx, params) {
        return Ok(0);
    }

    let tx_hash = tx.hash();
    let mut total_in = 0i64;
    for (input_index, txin) in tx.inputs.iter().enumerate() {
        let utxo = view.lookup_entry(&txin.previous_out_point).ok_or_else(|| {
            RuleError::MissingTxOut(format!(
                "output {} referenced from transaction {}:{} does not exist",
                txin.previous_out_point, tx_hash, input_index
            ))
        })?;
        let amount = utxo.amount();
        if amount < 0 {
            return Err(
                RuleError::BadTxOutValue(format!("output has negative value of {}", amount)).into(),
            );
        }
        total_in += amount;
    }

    let total_out: i64 = tx.outputs.iter().map(|txout| txout.value).sum();
    if total_in < total_out {
        return Err(RuleError::SpendTooHigh(format!(
            "total value of all transaction inputs for transaction {} is {} which is less than the amount spent of {}",
            tx_hash, total_in, total_out
        ))
        .into());
    }
    Ok(total_in - total_out)
}

/// Build the fee-rate context of every block transaction for the entangle
/// sequence rule.
pub fn get_ets_info_in_block(
    block: &Block,
    view: &UtxoView,
    params: &ChainParams,
) -> ConsensusResult<Vec<EtsInfo>> {
    let mut infos = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let fee = get_fee(tx, view, params)?;
        infos.push(EtsInfo {
            fee_per_kb: fee * 1000 / tx.serialized_size() as i64,
            tx: tx.clone(),
        });
    }
    Ok(infos)
}

/// Entangle-bearing transactions must respect the fee-rate sequence rule
/// once entanglement is active.
pub fn check_tx_sequence(
    block: &Block,
    height: i32,
    view: &UtxoView,
    params: &ChainParams,
) -> ConsensusResult<()> {
    if params.entangle_height >= height {
        return Ok(());
    }
    let infos = get_ets_info_in_block(block, view, params)?;
    verify_txs_sequence(&infos)?;
    Ok(())
}
