//! Legacy base58check address derivation for foreign chains.

use crate::{CrossError, CrossResult};
use sha2::{Digest, Sha256};

fn checksum(data: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    [second[0], second[1], second[2], second[3]]
}

/// Derive the legacy script-hash address for a foreign chain: one version
/// byte, the 20-byte script hash, and a 4-byte double-SHA256 checksum,
/// base58 encoded.
pub fn legacy_script_hash_address(script_hash: &[u8], version: u8) -> String {
    let mut data = Vec::with_capacity(script_hash.len() + 5);
    data.push(version);
    data.extend_from_slice(script_hash);
    let check = checksum(&data);
    data.extend_from_slice(&check);
    bs58::encode(data).into_string()
}

/// Decode a base58check address into its version byte and payload.
pub fn decode_base58check(addr: &str) -> CrossResult<(u8, Vec<u8>)> {
    let data = bs58::decode(addr)
        .into_vec()
        .map_err(|e| CrossError::BadAddress(format!("{addr}: {e}")))?;
    if data.len() < 5 {
        return Err(CrossError::BadAddress(format!("{addr}: too short")));
    }
    let (body, check) = data.split_at(data.len() - 4);
    if checksum(body) != check {
        return Err(CrossError::BadAddress(format!("{addr}: bad checksum")));
    }
    Ok((body[0], body[1..].to_vec()))
}
