//! Difficulty retargeting.
//!
//! Every block recomputes its required difficulty from its parent; there is
//! no retarget window boundary. The adjustment is a signed exponential step
//! bounded by [`DIFFICULTY_BOUND_DIVISOR`]: a block arriving on the
//! 30-second pace keeps the parent difficulty, faster blocks push it up, and
//! slower blocks pull it down, with the drop clamped at the −99 step.

use crate::chain::{BlockNode, Chain};
use crate::chain_params::ChainParams;
use crate::compact::{big_to_compact, calc_work};
use crate::error::{ConsensusResult, RuleError};
use num_bigint::{BigInt, Sign};
use num_traits::{One, Zero};

/// The bound divisor of the difficulty step.
pub const DIFFICULTY_BOUND_DIVISOR: i64 = 128;

/// Seconds per difficulty step: a block exactly this far after its parent
/// leaves the difficulty unchanged.
pub const DIFFICULTY_STEP_SECONDS: i64 = 30;

/// Window used by retarget variants that pick a suitable block out of the
/// last three candidates at n-144.
pub const DIFFICULTY_ADJUSTMENT_WINDOW: i32 = 144;

/// Division that rounds toward negative infinity, matching arbitrary
/// precision Euclidean division.
fn floor_div(numerator: &BigInt, denominator: &BigInt) -> BigInt {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if !remainder.is_zero() && (remainder.sign() == Sign::Minus) != (denominator.sign() == Sign::Minus)
    {
        quotient - BigInt::one()
    } else {
        quotient
    }
}

/// Calculate the required difficulty for the block after `last_node` with
/// the given timestamp.
pub fn calc_next_required_difficulty(
    last_node: Option<&BlockNode>,
    new_block_time: i64,
    params: &ChainParams,
) -> ConsensusResult<u32> {
    // Genesis block.
    let Some(last_node) = last_node else {
        return Ok(params.pow_limit_bits);
    };

    // Regtest and simnet style networks never adjust.
    if params.no_difficulty_adjustment {
        return Ok(last_node.bits);
    }

    // max(1 - (block_time - parent_time) // 30, -99)
    let elapsed = new_block_time - last_node.timestamp;
    let step = (1 - elapsed.div_euclid(DIFFICULTY_STEP_SECONDS)).max(-99);

    let difficulty: BigInt = if last_node.height != 0 {
        let parent = last_node.relative_ancestor(1).ok_or_else(|| {
            RuleError::Assertion("unable to obtain relative ancestor".to_string())
        })?;
        BigInt::from(&last_node.work_sum - &parent.work_sum)
    } else {
        BigInt::from(last_node.work_sum.clone())
    };

    // difficulty + (difficulty * step) // 128
    let scaled = &difficulty * BigInt::from(step);
    let new_difficulty = &difficulty + floor_div(&scaled, &BigInt::from(DIFFICULTY_BOUND_DIVISOR));
    if new_difficulty.sign() != Sign::Plus {
        return Ok(params.pow_limit_bits);
    }

    // target = (2^256 - difficulty) / difficulty
    let two_pow_256 = BigInt::one() << 256;
    let mut new_target = floor_div(&(two_pow_256 - &new_difficulty), &new_difficulty);

    // Clip if above the minimum-difficulty target.
    let pow_limit = BigInt::from(params.pow_limit.clone());
    if new_target > pow_limit {
        new_target = pow_limit;
    }
    Ok(big_to_compact(&new_target))
}

/// Of a node and its two parents, return the one with the median timestamp.
pub fn get_suitable_block(node: &BlockNode) -> ConsensusResult<&BlockNode> {
    let node1 = node
        .relative_ancestor(1)
        .ok_or_else(|| RuleError::Assertion("unable to obtain relative ancestor".to_string()))?;
    let node2 = node1
        .relative_ancestor(1)
        .ok_or_else(|| RuleError::Assertion("unable to obtain relative ancestor".to_string()))?;

    let mut blocks = [node2, node1, node];
    if blocks[0].timestamp > blocks[2].timestamp {
        blocks.swap(0, 2);
    }
    if blocks[0].timestamp > blocks[1].timestamp {
        blocks.swap(0, 1);
    }
    if blocks[1].timestamp > blocks[2].timestamp {
        blocks.swap(1, 2);
    }
    Ok(blocks[1])
}

/// Walk back over minimum-difficulty blocks to the difficulty of the last
/// block that did not use the testnet minimum-difficulty special rule.
pub fn find_prev_testnet_difficulty(start_node: &BlockNode, params: &ChainParams) -> u32 {
    let mut node = Some(start_node);
    while let Some(current) = node {
        if current.height % DIFFICULTY_ADJUSTMENT_WINDOW == 0
            || current.bits != params.pow_limit_bits
        {
            return current.bits;
        }
        node = current.parent.as_deref();
    }
    params.pow_limit_bits
}

impl Chain {
    /// Required difficulty for a block extending the current best chain at
    /// the given timestamp. Takes the chain lock.
    pub fn calc_next_required_difficulty(&self, timestamp: i64) -> ConsensusResult<u32> {
        let inner = self.inner.lock();
        calc_next_required_difficulty(inner.tip.as_deref(), timestamp, &self.params)
    }
}
