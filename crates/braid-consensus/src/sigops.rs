//! Signature-operation counting over transactions.

use crate::error::{ConsensusResult, RuleError};
use braid_primitives::script::{get_precise_sig_op_count, get_sig_op_count, is_pay_to_script_hash};
use braid_primitives::{ScriptFlags, Transaction};
use braid_state::UtxoView;

/// Fast, imprecise signature-operation count over all of a transaction's
/// input and output scripts.
pub fn count_sig_ops(tx: &Transaction, flags: ScriptFlags) -> usize {
    let mut total = 0usize;
    for txin in &tx.inputs {
        total += get_sig_op_count(&txin.signature_script, false, flags);
    }
    for txout in &tx.outputs {
        total += get_sig_op_count(&txout.pk_script, false, flags);
    }
    total
}

/// Precise count of the pay-to-script-hash signature operations of a
/// transaction's inputs, which needs the referenced output scripts from the
/// view.
pub fn count_p2sh_sig_ops(
    tx: &Transaction,
    is_coinbase: bool,
    view: &UtxoView,
    flags: ScriptFlags,
) -> ConsensusResult<usize> {
    // Coinbase transactions have no interesting inputs.
    if is_coinbase {
        return Ok(0);
    }

    let tx_hash = tx.hash();
    let mut total = 0usize;
    for (input_index, txin) in tx.inputs.iter().enumerate() {
        let utxo = view
            .lookup_entry(&txin.previous_out_point)
            .ok_or_else(|| {
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

        let pk_script = utxo.pk_script();
        if !is_pay_to_script_hash(pk_script) {
            continue;
        }

        let sig_ops = get_precise_sig_op_count(&txin.signature_script, pk_script, flags);
        let last_total = total;
        total = total.wrapping_add(sig_ops);
        if total < last_total {
            return Err(RuleError::TooManySigOps(format!(
                "the public key script from output {} contains too many signature operations - overflow",
                txin.previous_out_point
            ))
            .into());
        }
    }
    Ok(total)
}

/// Unified signature-operation count respecting the active script flags.
/// The precise pay-to-script-hash count is added only under the BIP16 flag.
pub fn get_sig_ops(
    tx: &Transaction,
    is_coinbase: bool,
    view: &UtxoView,
    flags: ScriptFlags,
) -> ConsensusResult<usize> {
    let mut total = count_sig_ops(tx, flags);
    if flags.contains(ScriptFlags::BIP16) {
        // A failed precise pass yields a zero count rather than an error.
        match count_p2sh_sig_ops(tx, is_coinbase, view, flags) {
            Ok(p2sh_ops) => total += p2sh_ops,
            Err(_) => return Ok(0),
        }
    }
    Ok(total)
}
