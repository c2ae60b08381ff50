//! Entangle transaction codec and minting curves.

use crate::{CrossError, CrossResult};
use braid_primitives::script::{entangle_payload, keeped_amount_payload};
use braid_primitives::Transaction;
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use std::collections::BTreeMap;

/// The foreign chain a deposit was made on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum ExpandedTxType {
    Doge = 240,
    Ltc = 241,
}

impl ExpandedTxType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            240 => Some(ExpandedTxType::Doge),
            241 => Some(ExpandedTxType::Ltc),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// One entangle request parsed from an output script.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntangleTxInfo {
    pub ex_type: ExpandedTxType,
    /// Output index of the deposit inside the foreign transaction.
    pub index: u32,
    /// Foreign chain height the deposit was confirmed at.
    pub height: u64,
    /// Deposit amount in the foreign chain's base units.
    pub amount: BigInt,
    /// Foreign transaction id, as the byte form of its textual id.
    pub ext_tx_hash: Vec<u8>,
}

impl EntangleTxInfo {
    /// Serialize with the fixed self-describing framing:
    /// `[ex_type:1][index:4 BE][height:8 BE][amount_len:1][amount]
    /// [ext_tx_hash_len:1][ext_tx_hash]`.
    pub fn serialize(&self) -> Vec<u8> {
        let amount = self.amount.magnitude().to_bytes_be();
        let mut buf = Vec::with_capacity(15 + amount.len() + self.ext_tx_hash.len());
        buf.push(self.ex_type.to_byte());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.push(amount.len() as u8);
        buf.extend_from_slice(&amount);
        buf.push(self.ext_tx_hash.len() as u8);
        buf.extend_from_slice(&self.ext_tx_hash);
        buf
    }

    /// Parse a serialized payload, rejecting inconsistent lengths.
    pub fn parse(payload: &[u8]) -> CrossResult<Self> {
        if payload.len() < 14 {
            return Err(CrossError::BadPayload("entangle info too short".into()));
        }
        let ex_type = ExpandedTxType::from_byte(payload[0])
            .ok_or_else(|| CrossError::BadPayload(format!("unknown ex type {}", payload[0])))?;
        let index = u32::from_be_bytes(payload[1..5].try_into().unwrap());
        let height = u64::from_be_bytes(payload[5..13].try_into().unwrap());

        let mut offset = 13;
        let amount_len = payload[offset] as usize;
        offset += 1;
        let amount_bytes = payload
            .get(offset..offset + amount_len)
            .ok_or_else(|| CrossError::BadPayload("amount truncated".into()))?;
        let amount = BigInt::from_bytes_be(num_bigint::Sign::Plus, amount_bytes);
        offset += amount_len;

        let hash_len = *payload
            .get(offset)
            .ok_or_else(|| CrossError::BadPayload("missing hash length".into()))?
            as usize;
        offset += 1;
        let ext_tx_hash = payload
            .get(offset..offset + hash_len)
            .ok_or_else(|| CrossError::BadPayload("hash truncated".into()))?
            .to_vec();
        offset += hash_len;
        if offset != payload.len() {
            return Err(CrossError::BadPayload("trailing bytes".into()));
        }

        Ok(EntangleTxInfo {
            ex_type,
            index,
            height,
            amount,
            ext_tx_hash,
        })
    }
}

/// One per-chain reserve entry.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KeepedItem {
    pub ex_type: ExpandedTxType,
    pub amount: BigInt,
}

/// The running per-chain reserves carried through the coinbase. Deposits fold
/// into the matching item; the reserves parameterize the minting curves.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct KeepedAmount {
    pub count: u8,
    pub items: Vec<KeepedItem>,
}

impl KeepedAmount {
    /// Merge an item into the reserves, creating its chain entry on first
    /// sight.
    pub fn add(&mut self, item: KeepedItem) {
        for existing in &mut self.items {
            if existing.ex_type == item.ex_type {
                existing.amount += item.amount;
                return;
            }
        }
        self.count += 1;
        self.items.push(item);
    }

    /// The reserve recorded for a chain, if any.
    pub fn value_of(&self, ex_type: ExpandedTxType) -> Option<&BigInt> {
        self.items
            .iter()
            .find(|item| item.ex_type == ex_type)
            .map(|item| &item.amount)
    }

    /// Serialize as `[count:1]` followed by `count` items of
    /// `[ex_type:1][amount_len:1][amount]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![self.count];
        for item in &self.items {
            let amount = item.amount.magnitude().to_bytes_be();
            buf.push(item.ex_type.to_byte());
            buf.push(amount.len() as u8);
            buf.extend_from_slice(&amount);
        }
        buf
    }

    /// Parse a serialized keeped amount, rejecting inconsistent lengths.
    pub fn parse(payload: &[u8]) -> CrossResult<Self> {
        let (&count, mut rest) = payload
            .split_first()
            .ok_or_else(|| CrossError::BadPayload("empty keeped amount".into()))?;

        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if rest.len() < 2 {
                return Err(CrossError::BadPayload("keeped item truncated".into()));
            }
            let ex_type = ExpandedTxType::from_byte(rest[0])
                .ok_or_else(|| CrossError::BadPayload(format!("unknown ex type {}", rest[0])))?;
            let amount_len = rest[1] as usize;
            let amount_bytes = rest
                .get(2..2 + amount_len)
                .ok_or_else(|| CrossError::BadPayload("keeped amount truncated".into()))?;
            items.push(KeepedItem {
                ex_type,
                amount: BigInt::from_bytes_be(num_bigint::Sign::Plus, amount_bytes),
            });
            rest = &rest[2 + amount_len..];
        }
        if !rest.is_empty() {
            return Err(CrossError::BadPayload("trailing bytes".into()));
        }
        Ok(KeepedAmount { count, items })
    }

    /// Parse the keeped amount out of a coinbase output script.
    pub fn from_script(pk_script: &[u8]) -> CrossResult<Self> {
        let payload = keeped_amount_payload(pk_script)
            .ok_or_else(|| CrossError::BadPayload("not a keeped amount script".into()))?;
        Self::parse(payload)
    }
}

/// A deposit being folded into the block summary. `pre_calc_entangle_amount`
/// replaces `value` with the minted credit.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntangleItem {
    pub e_type: ExpandedTxType,
    pub value: BigInt,
}

/// Scan a transaction's outputs for entangle payloads.
///
/// Returns the parsed infos keyed by output index, or `None` when the
/// transaction carries none. Outputs whose payload fails to parse are
/// treated as not entangle-bearing.
pub fn is_entangle_tx(tx: &Transaction) -> Option<BTreeMap<u32, EntangleTxInfo>> {
    let mut infos = BTreeMap::new();
    for (index, txout) in tx.outputs.iter().enumerate() {
        if let Some(payload) = entangle_payload(&txout.pk_script) {
            if let Ok(info) = EntangleTxInfo::parse(payload) {
                infos.insert(index as u32, info);
            }
        }
    }
    if infos.is_empty() {
        None
    } else {
        Some(infos)
    }
}

fn base_unit() -> BigInt {
    BigInt::from(100_000_000i64)
}

/// Tranche size of the doge reserve: 12,500,000 doge.
fn doge_tranche() -> BigInt {
    BigInt::from(12_500_000i64) * base_unit()
}

/// Tranche size of the ltc reserve: 150,000 ltc.
fn ltc_tranche() -> BigInt {
    BigInt::from(150_000i64) * base_unit()
}

/// Consume `amount` tranche by tranche above `reserve`, crediting each
/// portion through `credit`, which receives the tranche ordinal.
fn tiered_credit<F>(reserve: &BigInt, amount: &BigInt, tranche: &BigInt, credit: F) -> BigInt
where
    F: Fn(&BigInt, &BigInt) -> BigInt,
{
    if amount.sign() != num_bigint::Sign::Plus {
        return BigInt::zero();
    }

    let mut ordinal = reserve / tranche;
    let mut room = tranche - (reserve % tranche);
    let mut left = amount.clone();
    let mut total = BigInt::zero();

    while left.is_positive() {
        let portion = if left < room { left.clone() } else { room.clone() };
        total += credit(&ordinal, &portion);
        left -= &portion;
        ordinal += 1;
        room = tranche.clone();
    }
    total
}

/// Credit minted for a doge deposit of `amount` on top of `reserve`.
///
/// The rate starts at 25 doge per braid and worsens by one for every full
/// tranche already entangled, so consecutive deposits receive diminishing
/// returns.
pub fn to_doge(reserve: &BigInt, amount: &BigInt) -> BigInt {
    tiered_credit(reserve, amount, &doge_tranche(), |ordinal, portion| {
        portion / (BigInt::from(25) + ordinal)
    })
}

/// Credit minted for an ltc deposit of `amount` on top of `reserve`.
///
/// The base rate is 0.0008 ltc per braid (a 10000/8 multiplier); the divisor
/// grows by one per full tranche already entangled.
pub fn to_ltc(reserve: &BigInt, amount: &BigInt) -> BigInt {
    tiered_credit(reserve, amount, &ltc_tranche(), |ordinal, portion| {
        portion * BigInt::from(10_000) / (BigInt::from(8) + ordinal)
    })
}

/// Fold one deposit into the reserves and replace its value with the minted
/// credit. The reserve read happens before the fold, so the deposit itself
/// does not worsen its own rate.
pub fn pre_calc_entangle_amount(item: &mut EntangleItem, keep: &mut KeepedAmount) {
    let reserve = keep
        .value_of(item.e_type)
        .cloned()
        .unwrap_or_else(BigInt::zero);
    keep.add(KeepedItem {
        ex_type: item.e_type,
        amount: item.value.clone(),
    });
    item.value = match item.e_type {
        ExpandedTxType::Doge => to_doge(&reserve, &item.value),
        ExpandedTxType::Ltc => to_ltc(&reserve, &item.value),
    };
}

/// Fee context for one block transaction, used by the sequence rule.
#[derive(Clone, Debug)]
pub struct EtsInfo {
    pub fee_per_kb: i64,
    pub tx: Transaction,
}

/// Entangle-bearing transactions must appear in non-increasing fee-per-KB
/// order within a block.
pub fn verify_txs_sequence(infos: &[EtsInfo]) -> CrossResult<()> {
    let mut last: Option<i64> = None;
    for info in infos {
        if is_entangle_tx(&info.tx).is_none() {
            continue;
        }
        if let Some(prev) = last {
            if info.fee_per_kb > prev {
                return Err(CrossError::UnorderedSequence(format!(
                    "fee per kb {} after {}",
                    info.fee_per_kb, prev
                )));
            }
        }
        last = Some(info.fee_per_kb);
    }
    Ok(())
}
