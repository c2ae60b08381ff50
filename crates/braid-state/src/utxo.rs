//! The in-memory UTXO view.

use crate::{StateError, StateResult};
use braid_primitives::script::is_unspendable;
use braid_primitives::{Block, CancelToken, OutPoint, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

/// The persistent UTXO layer below the view.
///
/// Failures from the backing store are I/O errors, reported as
/// [`StateError::Cache`] and kept distinct from rule violations.
pub trait UtxoCache: Send + Sync {
    /// Fetch the unspent entry for an outpoint, or `None` when the output is
    /// unknown or already pruned as spent.
    fn fetch_entry(&self, outpoint: &OutPoint) -> StateResult<Option<UtxoEntry>>;
}

/// An unspent transaction output tracked by the view.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UtxoEntry {
    amount: i64,
    pk_script: Vec<u8>,
    block_height: i32,
    is_coinbase: bool,
    is_pool: bool,
    spent: bool,
}

impl UtxoEntry {
    pub fn new(
        amount: i64,
        pk_script: Vec<u8>,
        block_height: i32,
        is_coinbase: bool,
        is_pool: bool,
    ) -> Self {
        UtxoEntry {
            amount,
            pk_script,
            block_height,
            is_coinbase,
            is_pool,
            spent: false,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn pk_script(&self) -> &[u8] {
        &self.pk_script
    }

    pub fn block_height(&self) -> i32 {
        self.block_height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    /// Whether this output pays one of the internal pool addresses. Pool
    /// outputs are exempt from coinbase maturity.
    pub fn is_pool(&self) -> bool {
        self.is_pool
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }

    fn spend(&mut self) {
        self.spent = true;
    }

    fn unspend(&mut self) {
        self.spent = false;
    }
}

/// Journal entry for one spent output, in spend order. Carries everything
/// needed to resurrect the output on disconnect.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SpentTxOut {
    pub amount: i64,
    pub pk_script: Vec<u8>,
    pub height: i32,
    pub is_coinbase: bool,
    pub is_pool: bool,
}

impl SpentTxOut {
    fn from_entry(entry: &UtxoEntry) -> Self {
        SpentTxOut {
            amount: entry.amount,
            pk_script: entry.pk_script.clone(),
            height: entry.block_height,
            is_coinbase: entry.is_coinbase,
            is_pool: entry.is_pool,
        }
    }

    fn to_entry(&self) -> UtxoEntry {
        UtxoEntry::new(
            self.amount,
            self.pk_script.clone(),
            self.height,
            self.is_coinbase,
            self.is_pool,
        )
    }
}

/// Undo record for the current connect call, so a mid-block failure leaves
/// no observable mutation.
enum UndoAction {
    Spent(OutPoint),
    Added(OutPoint),
}

/// An in-memory mapping of outpoints to unspent entries, layered over a
/// persistent cache.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct UtxoView {
    entries: HashMap<OutPoint, UtxoEntry>,
}

impl UtxoView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry in the view.
    pub fn lookup_entry(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    /// Insert an entry directly. Used when seeding the view from the cache
    /// and by test fixtures.
    pub fn add_entry(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.entries.insert(outpoint, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pull every output referenced by the block's inputs up into the view.
    ///
    /// Outpoints created by earlier transactions within the same block are
    /// skipped; they materialize during connect. Unknown outpoints are left
    /// absent so the validator can report them precisely.
    #[instrument(skip_all, fields(txs = block.transactions.len()))]
    pub fn add_input_utxos(&mut self, cache: &dyn UtxoCache, block: &Block) -> StateResult<()> {
        let in_block: HashSet<_> = block.transactions.iter().map(Transaction::hash).collect();

        for tx in &block.transactions {
            for txin in &tx.inputs {
                let outpoint = txin.previous_out_point;
                if outpoint.is_null()
                    || in_block.contains(&outpoint.hash)
                    || self.entries.contains_key(&outpoint)
                {
                    continue;
                }
                if let Some(entry) = cache.fetch_entry(&outpoint)? {
                    self.entries.insert(outpoint, entry);
                }
            }
        }
        debug!(loaded = self.entries.len(), "input utxos loaded");
        Ok(())
    }

    /// Connect all of the block's transactions to the view.
    ///
    /// All-or-nothing: any failure (including cancellation) unwinds every
    /// mutation made by this call before returning. Each spent input appends
    /// one journal entry to `stxos` in spend order. With `stxos_only` the
    /// journal is populated but the view itself is left untouched.
    pub fn connect_transactions(
        &mut self,
        block: &Block,
        height: i32,
        mut stxos: Option<&mut Vec<SpentTxOut>>,
        stxos_only: bool,
        cancel: &CancelToken,
    ) -> StateResult<()> {
        let mut undo: Vec<UndoAction> = Vec::new();
        let mut journal_added = 0usize;
        let mut shadow_spent: HashSet<OutPoint> = HashSet::new();

        let result = (|| -> StateResult<()> {
            for (tx_index, tx) in block.transactions.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(StateError::Cancelled);
                }
                self.connect_transaction(
                    tx,
                    tx_index,
                    height,
                    &mut stxos,
                    stxos_only,
                    &mut undo,
                    &mut journal_added,
                    &mut shadow_spent,
                )?;
            }
            Ok(())
        })();

        if result.is_err() {
            // Roll back in reverse application order.
            for action in undo.into_iter().rev() {
                match action {
                    UndoAction::Spent(outpoint) => {
                        if let Some(entry) = self.entries.get_mut(&outpoint) {
                            entry.unspend();
                        }
                    }
                    UndoAction::Added(outpoint) => {
                        self.entries.remove(&outpoint);
                    }
                }
            }
            if let Some(stxos) = stxos {
                stxos.truncate(stxos.len() - journal_added);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_transaction(
        &mut self,
        tx: &Transaction,
        tx_index: usize,
        height: i32,
        stxos: &mut Option<&mut Vec<SpentTxOut>>,
        stxos_only: bool,
        undo: &mut Vec<UndoAction>,
        journal_added: &mut usize,
        shadow_spent: &mut HashSet<OutPoint>,
    ) -> StateResult<()> {
        let tx_hash = tx.hash();
        let is_coinbase = tx_index == 0;

        for (input_index, txin) in tx.inputs.iter().enumerate() {
            let outpoint = txin.previous_out_point;
            if outpoint.is_null() {
                continue;
            }
            let entry =
                self.entries
                    .get_mut(&outpoint)
                    .ok_or_else(|| StateError::MissingUtxo {
                        outpoint: outpoint.to_string(),
                        tx_hash: tx_hash.to_string(),
                        input_index,
                    })?;
            let already_spent = if stxos_only {
                shadow_spent.contains(&outpoint)
            } else {
                entry.is_spent()
            };
            if already_spent {
                return Err(StateError::SpentUtxo {
                    outpoint: outpoint.to_string(),
                    tx_hash: tx_hash.to_string(),
                    input_index,
                });
            }
            if let Some(stxos) = stxos.as_mut() {
                stxos.push(SpentTxOut::from_entry(entry));
                *journal_added += 1;
            }
            if stxos_only {
                shadow_spent.insert(outpoint);
            } else {
                entry.spend();
                undo.push(UndoAction::Spent(outpoint));
            }
        }

        if stxos_only {
            return Ok(());
        }

        for (output_index, txout) in tx.outputs.iter().enumerate() {
            if is_unspendable(&txout.pk_script) {
                continue;
            }
            let outpoint = OutPoint::new(tx_hash, output_index as u32);
            let is_pool =
                is_coinbase && tx.outputs.len() >= 4 && (output_index == 1 || output_index == 2);
            self.entries.insert(
                outpoint,
                UtxoEntry::new(
                    txout.value,
                    txout.pk_script.clone(),
                    height,
                    is_coinbase,
                    is_pool,
                ),
            );
            undo.push(UndoAction::Added(outpoint));
        }
        Ok(())
    }

    /// Disconnect a previously connected block, consuming the journal
    /// captured during connect. Restores the view to its exact prior state.
    #[instrument(skip_all, fields(height, stxos = stxos.len()))]
    pub fn disconnect_transactions(
        &mut self,
        block: &Block,
        height: i32,
        stxos: &[SpentTxOut],
    ) -> StateResult<()> {
        let mut stxo_index = stxos.len();

        for tx in block.transactions.iter().rev() {
            let tx_hash = tx.hash();

            for (output_index, txout) in tx.outputs.iter().enumerate() {
                if is_unspendable(&txout.pk_script) {
                    continue;
                }
                self.entries
                    .remove(&OutPoint::new(tx_hash, output_index as u32));
            }

            for txin in tx.inputs.iter().rev() {
                let outpoint = txin.previous_out_point;
                if outpoint.is_null() {
                    continue;
                }
                if stxo_index == 0 {
                    return Err(StateError::JournalMismatch(format!(
                        "ran out of journal entries at input {} of tx {}",
                        outpoint, tx_hash
                    )));
                }
                stxo_index -= 1;
                self.entries
                    .insert(outpoint, stxos[stxo_index].to_entry());
            }
        }

        if stxo_index != 0 {
            return Err(StateError::JournalMismatch(format!(
                "{} journal entries left over after disconnect",
                stxo_index
            )));
        }
        debug!(height, "block disconnected from view");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_primitives::{sha256d, BlockHeader, TxIn, TxOut};

    struct EmptyCache;

    impl UtxoCache for EmptyCache {
        fn fetch_entry(&self, _outpoint: &OutPoint) -> StateResult<Option<UtxoEntry>> {
            Ok(None)
        }
    }

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: sha256d(b"prev"),
            merkle_root: braid_primitives::Hash256::ZERO,
            timestamp: 1_600_000_000,
            bits: 0x1d00ffff,
            nonce: 0,
        }
    }

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::NULL, vec![0x01, 0x01])],
            outputs: vec![TxOut::new(1000, vec![0x51])],
            lock_time: 0,
        }
    }

    fn spend_tx(prev: OutPoint, value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(prev, vec![])],
            outputs: vec![TxOut::new(value, vec![0x52])],
            lock_time: 0,
        }
    }

    fn seeded_view(prev: OutPoint, amount: i64) -> UtxoView {
        let mut view = UtxoView::new();
        view.add_entry(prev, UtxoEntry::new(amount, vec![0x51], 5, false, false));
        view
    }

    // ============ Connect Tests ============

    #[test]
    fn test_connect_spends_and_creates() {
        let prev = OutPoint::new(sha256d(b"funding"), 0);
        let mut view = seeded_view(prev, 1000);

        let tx = spend_tx(prev, 900);
        let tx_hash = tx.hash();
        let block = Block::new(header(), vec![coinbase(), tx]);

        let mut stxos = Vec::new();
        view.connect_transactions(&block, 10, Some(&mut stxos), false, &CancelToken::new())
            .unwrap();

        assert!(view.lookup_entry(&prev).unwrap().is_spent());
        let created = view.lookup_entry(&OutPoint::new(tx_hash, 0)).unwrap();
        assert_eq!(created.amount(), 900);
        assert_eq!(created.block_height(), 10);
        assert!(!created.is_coinbase());
        assert_eq!(stxos.len(), 1);
        assert_eq!(stxos[0].amount, 1000);
    }

    #[test]
    fn test_connect_detects_double_spend_in_block() {
        let prev = OutPoint::new(sha256d(b"funding"), 0);
        let mut view = seeded_view(prev, 1000);
        let before = view.clone();

        let block = Block::new(
            header(),
            vec![coinbase(), spend_tx(prev, 400), spend_tx(prev, 500)],
        );

        let mut stxos = Vec::new();
        let err = view
            .connect_transactions(&block, 10, Some(&mut stxos), false, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StateError::SpentUtxo { .. }));

        // All-or-nothing: nothing observable changed.
        assert_eq!(view, before);
        assert!(stxos.is_empty());
    }

    #[test]
    fn test_connect_missing_input() {
        let mut view = UtxoView::new();
        let block = Block::new(
            header(),
            vec![
                coinbase(),
                spend_tx(OutPoint::new(sha256d(b"nowhere"), 3), 1),
            ],
        );
        let err = view
            .connect_transactions(&block, 10, None, false, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StateError::MissingUtxo { .. }));
        assert!(view.is_empty());
    }

    #[test]
    fn test_connect_skips_unspendable_outputs() {
        let mut view = UtxoView::new();
        let mut cb = coinbase();
        cb.outputs.push(TxOut::new(0, vec![0x6a, 0x01, 0xaa]));
        let cb_hash = cb.hash();
        let block = Block::new(header(), vec![cb]);

        view.connect_transactions(&block, 1, None, false, &CancelToken::new())
            .unwrap();
        assert!(view.lookup_entry(&OutPoint::new(cb_hash, 0)).is_some());
        assert!(view.lookup_entry(&OutPoint::new(cb_hash, 1)).is_none());
    }

    #[test]
    fn test_connect_marks_pool_outputs() {
        let mut cb = coinbase();
        cb.outputs = vec![
            TxOut::new(100, vec![0x51]),
            TxOut::new(200, vec![0x52]),
            TxOut::new(300, vec![0x53]),
            TxOut::new(0, vec![0x54]),
        ];
        let cb_hash = cb.hash();
        let block = Block::new(header(), vec![cb]);

        let mut view = UtxoView::new();
        view.connect_transactions(&block, 7, None, false, &CancelToken::new())
            .unwrap();

        assert!(!view.lookup_entry(&OutPoint::new(cb_hash, 0)).unwrap().is_pool());
        assert!(view.lookup_entry(&OutPoint::new(cb_hash, 1)).unwrap().is_pool());
        assert!(view.lookup_entry(&OutPoint::new(cb_hash, 2)).unwrap().is_pool());
        assert!(!view.lookup_entry(&OutPoint::new(cb_hash, 3)).unwrap().is_pool());
    }

    #[test]
    fn test_connect_cancelled() {
        let prev = OutPoint::new(sha256d(b"funding"), 0);
        let mut view = seeded_view(prev, 1000);
        let before = view.clone();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = view
            .connect_transactions(
                &Block::new(header(), vec![coinbase(), spend_tx(prev, 1)]),
                10,
                None,
                false,
                &cancel,
            )
            .unwrap_err();
        assert!(matches!(err, StateError::Cancelled));
        assert_eq!(view, before);
    }

    #[test]
    fn test_stxos_only_leaves_view_untouched() {
        let prev = OutPoint::new(sha256d(b"funding"), 0);
        let mut view = seeded_view(prev, 1000);
        let before = view.clone();

        let block = Block::new(header(), vec![coinbase(), spend_tx(prev, 900)]);
        let mut stxos = Vec::new();
        view.connect_transactions(&block, 10, Some(&mut stxos), true, &CancelToken::new())
            .unwrap();

        assert_eq!(view, before);
        assert_eq!(stxos.len(), 1);
    }

    // ============ Disconnect Tests ============

    #[test]
    fn test_connect_then_disconnect_roundtrip() {
        let prev = OutPoint::new(sha256d(b"funding"), 0);
        let mut view = seeded_view(prev, 1000);
        let before = view.clone();

        let block = Block::new(header(), vec![coinbase(), spend_tx(prev, 900)]);
        let mut stxos = Vec::new();
        view.connect_transactions(&block, 10, Some(&mut stxos), false, &CancelToken::new())
            .unwrap();
        assert_ne!(view, before);

        view.disconnect_transactions(&block, 10, &stxos).unwrap();
        assert_eq!(view, before);
    }

    #[test]
    fn test_disconnect_journal_mismatch() {
        let prev = OutPoint::new(sha256d(b"funding"), 0);
        let mut view = seeded_view(prev, 1000);
        let block = Block::new(header(), vec![coinbase(), spend_tx(prev, 900)]);

        let err = view.disconnect_transactions(&block, 10, &[]).unwrap_err();
        assert!(matches!(err, StateError::JournalMismatch(_)));
    }

    // ============ Cache Seeding Tests ============

    #[test]
    fn test_add_input_utxos_skips_in_block_refs() {
        struct PanickyCache;
        impl UtxoCache for PanickyCache {
            fn fetch_entry(&self, _outpoint: &OutPoint) -> StateResult<Option<UtxoEntry>> {
                panic!("cache should not be consulted for in-block outputs");
            }
        }

        let cb = coinbase();
        let child = spend_tx(OutPoint::new(cb.hash(), 0), 500);
        let block = Block::new(header(), vec![cb, child]);

        let mut view = UtxoView::new();
        view.add_input_utxos(&PanickyCache, &block).unwrap();
        assert!(view.is_empty());
    }

    #[test]
    fn test_add_input_utxos_tolerates_unknown_outputs() {
        let block = Block::new(
            header(),
            vec![coinbase(), spend_tx(OutPoint::new(sha256d(b"gone"), 0), 1)],
        );
        let mut view = UtxoView::new();
        view.add_input_utxos(&EmptyCache, &block).unwrap();
        assert!(view.is_empty());
    }
}
