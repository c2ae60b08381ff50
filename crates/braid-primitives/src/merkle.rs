//! Merkle root computation over block transactions.

use crate::hash::{sha256d, Hash256, HASH_SIZE};
use crate::transaction::Transaction;

/// Hash two merkle branches into their parent node.
fn hash_merkle_branches(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; HASH_SIZE * 2];
    buf[..HASH_SIZE].copy_from_slice(left.as_bytes());
    buf[HASH_SIZE..].copy_from_slice(right.as_bytes());
    sha256d(&buf)
}

/// Compute the merkle root of a list of transactions.
///
/// A level with an odd node count hashes its last node with itself, the rule
/// shared with the bitcoin lineage. An empty list yields the zero hash;
/// callers reject empty blocks before getting here.
pub fn build_merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return Hash256::ZERO;
    }

    let mut level: Vec<Hash256> = transactions.iter().map(Transaction::hash).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            next.push(hash_merkle_branches(&pair[0], right));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxIn, TxOut};

    fn tx_with_value(value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::NULL, vec![0x01, value as u8])],
            outputs: vec![TxOut::new(value, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn test_single_tx_root_is_tx_hash() {
        let tx = tx_with_value(1);
        assert_eq!(build_merkle_root(&[tx.clone()]), tx.hash());
    }

    #[test]
    fn test_root_depends_on_order() {
        let txs = vec![tx_with_value(1), tx_with_value(2)];
        let swapped = vec![txs[1].clone(), txs[0].clone()];
        assert_ne!(build_merkle_root(&txs), build_merkle_root(&swapped));
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let txs = vec![tx_with_value(1), tx_with_value(2), tx_with_value(3)];
        let left = hash_merkle_branches(&txs[0].hash(), &txs[1].hash());
        let right = hash_merkle_branches(&txs[2].hash(), &txs[2].hash());
        assert_eq!(build_merkle_root(&txs), hash_merkle_branches(&left, &right));
    }

    #[test]
    fn test_empty_is_zero() {
        assert!(build_merkle_root(&[]).is_zero());
    }
}
