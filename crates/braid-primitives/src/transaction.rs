//! Transactions, inputs, outputs and outpoints.

use crate::hash::{sha256d, Hash256};
use std::fmt;

/// Base units per coin.
pub const COIN: i64 = 100_000_000;

/// Maximum sequence number a transaction input can carry.
pub const MAX_TX_IN_SEQUENCE_NUM: u32 = u32::MAX;

/// A reference to a transaction output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint used by coinbase inputs: zero hash, max index.
    pub const NULL: OutPoint = OutPoint {
        hash: Hash256::ZERO,
        index: u32::MAX,
    };

    pub fn new(hash: Hash256, index: u32) -> Self {
        OutPoint { hash, index }
    }

    /// Whether this is the null outpoint.
    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash.is_zero()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.index)
    }
}

/// A transaction input.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxIn {
    pub previous_out_point: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(previous_out_point: OutPoint, signature_script: Vec<u8>) -> Self {
        TxIn {
            previous_out_point,
            signature_script,
            sequence: MAX_TX_IN_SEQUENCE_NUM,
        }
    }

    fn serialized_size(&self) -> usize {
        // outpoint (36) + script length prefix + script + sequence (4)
        40 + varint_size(self.signature_script.len() as u64) + self.signature_script.len()
    }
}

/// A transaction output.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOut {
    pub value: i64,
    pub pk_script: Vec<u8>,
}

impl TxOut {
    pub fn new(value: i64, pk_script: Vec<u8>) -> Self {
        TxOut { value, pk_script }
    }

    fn serialized_size(&self) -> usize {
        8 + varint_size(self.pk_script.len() as u64) + self.pk_script.len()
    }
}

/// A transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(version: i32) -> Self {
        Transaction {
            version,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }

    /// Canonical wire serialization.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.inputs.len() as u64);
        for txin in &self.inputs {
            buf.extend_from_slice(txin.previous_out_point.hash.as_bytes());
            buf.extend_from_slice(&txin.previous_out_point.index.to_le_bytes());
            write_varint(&mut buf, txin.signature_script.len() as u64);
            buf.extend_from_slice(&txin.signature_script);
            buf.extend_from_slice(&txin.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for txout in &self.outputs {
            buf.extend_from_slice(&txout.value.to_le_bytes());
            write_varint(&mut buf, txout.pk_script.len() as u64);
            buf.extend_from_slice(&txout.pk_script);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Serialized size in bytes without materializing the serialization.
    pub fn serialized_size(&self) -> usize {
        let mut size = 8; // version + lock_time
        size += varint_size(self.inputs.len() as u64);
        size += varint_size(self.outputs.len() as u64);
        for txin in &self.inputs {
            size += txin.serialized_size();
        }
        for txout in &self.outputs {
            size += txout.serialized_size();
        }
        size
    }

    /// The transaction hash: double-SHA256 of the canonical serialization.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }
}

/// Append a bitcoin-style variable length integer to `buf`.
pub(crate) fn write_varint(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

/// Serialized size of a variable length integer.
pub(crate) fn varint_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
