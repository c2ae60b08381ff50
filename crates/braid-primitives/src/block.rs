//! Block headers and blocks.

use crate::hash::{sha256d, Hash256};
use crate::transaction::{varint_size, write_varint, Transaction};

/// Serialized size of a block header in bytes.
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 8 + 4 + 8;

/// A block header.
///
/// Timestamps carry second precision as an `i64`; the nonce is 64 bits wide
/// to leave room for the memory-hard seal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: i64,
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    /// Canonical wire serialization.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.write_without_nonce(&mut buf);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    fn write_without_nonce(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.prev_block.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
    }

    /// The block hash: double-SHA256 over the full header.
    pub fn block_hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }

    /// Hash of the header with the nonce left out. This is the message the
    /// proof-of-work seal commits to.
    pub fn block_hash_no_nonce(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(HEADER_SIZE - 8);
        self.write_without_nonce(&mut buf);
        sha256d(&buf)
    }
}

/// A block: header plus ordered transactions, the first being the coinbase.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    /// Canonical wire serialization.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&self.header.serialize());
        write_varint(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.serialize());
        }
        buf
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + varint_size(self.transactions.len() as u64)
            + self
                .transactions
                .iter()
                .map(Transaction::serialized_size)
                .sum::<usize>()
    }

    pub fn block_hash(&self) -> Hash256 {
        self.header.block_hash()
    }
}
