//! Chain parameters.
//!
//! Network-specific consensus parameters that do not change at runtime.
//! `ChainParams::mainnet()` and `ChainParams::regtest()` cover the built-in
//! networks; [`ChainConfig`] (serde) builds parameters for private networks
//! from configuration.

use crate::compact::compact_to_big;
use braid_primitives::Hash256;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Deployment id of the CSV (relative lock-time) soft fork.
pub const DEPLOYMENT_CSV: usize = 0;
/// Deployment id of the SEQ (monotone header timestamp) soft fork.
pub const DEPLOYMENT_SEQ: usize = 1;
/// Number of defined deployments.
pub const DEFINED_DEPLOYMENTS: usize = 2;

/// One consensus deployment window.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Deployment {
    /// Median-time-past at which the deployment starts applying. Zero means
    /// always active.
    pub start_time: i64,
    /// Median-time-past after which a non-activated deployment is failed.
    /// Zero means it never expires.
    pub expire_time: i64,
}

/// A known-good block hash pinned at a height.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: String,
}

/// Static network parameters.
#[derive(Clone, Debug)]
pub struct ChainParams {
    /// Human-readable network name.
    pub name: String,
    /// Highest (easiest) admissible proof-of-work target.
    pub pow_limit: BigUint,
    /// Compact form of `pow_limit`.
    pub pow_limit_bits: u32,
    /// Maximum amount of base units a single output or sum may carry.
    pub max_satoshi: i64,
    /// Blocks between subsidy reductions; zero disables reduction.
    pub subsidy_reduction_interval: i32,
    /// Confirmations before a non-pool coinbase output may be spent.
    pub coinbase_maturity: i32,
    /// Height at which entanglement activates and the coinbase switches to
    /// the pooled layout.
    pub entangle_height: i32,
    /// Regtest-style networks skip difficulty adjustment entirely.
    pub no_difficulty_adjustment: bool,
    /// Hash of the genesis block.
    pub genesis_hash: Hash256,
    /// Known-good checkpoints, ascending by height.
    pub checkpoints: Vec<Checkpoint>,
    /// Deployment windows, indexed by the `DEPLOYMENT_*` ids.
    pub deployments: [Deployment; DEFINED_DEPLOYMENTS],
    /// Maximum serialized block size in bytes.
    pub excessive_block_size: u32,
}

impl ChainParams {
    /// Mainnet parameters.
    pub fn mainnet() -> Self {
        ChainParams {
            name: "mainnet".to_string(),
            pow_limit: pow_limit_from_bits(0x1d00ffff),
            pow_limit_bits: 0x1d00ffff,
            max_satoshi: 2_100_000_000 * braid_primitives::COIN,
            subsidy_reduction_interval: 1_051_200,
            coinbase_maturity: 100,
            entangle_height: 5_000,
            no_difficulty_adjustment: false,
            genesis_hash: Hash256::from_hex(
                "000000008ea3cf107d1ccbbeae5f22a52e12abeb0e9e8f397ccb8f9d3af2b849",
            )
            .expect("valid genesis hash literal"),
            checkpoints: Vec::new(),
            deployments: [
                // CSV: active since launch.
                Deployment {
                    start_time: 0,
                    expire_time: 0,
                },
                // SEQ: monotone header timestamps.
                Deployment {
                    start_time: 1_577_836_800,
                    expire_time: 0,
                },
            ],
            excessive_block_size: 32 * 1_000_000,
        }
    }

    /// Regression-test parameters: trivial difficulty, fast maturity.
    pub fn regtest() -> Self {
        ChainParams {
            name: "regtest".to_string(),
            pow_limit: pow_limit_from_bits(0x207fffff),
            pow_limit_bits: 0x207fffff,
            max_satoshi: 2_100_000_000 * braid_primitives::COIN,
            subsidy_reduction_interval: 150,
            coinbase_maturity: 10,
            entangle_height: 10,
            no_difficulty_adjustment: true,
            genesis_hash: Hash256::ZERO,
            checkpoints: Vec::new(),
            deployments: [
                Deployment {
                    start_time: 0,
                    expire_time: 0,
                },
                Deployment {
                    start_time: 0,
                    expire_time: 0,
                },
            ],
            excessive_block_size: 32 * 1_000_000,
        }
    }

    /// Build parameters from a configuration file.
    pub fn from_config(config: &ChainConfig) -> Self {
        ChainParams {
            name: config.name.clone(),
            pow_limit: pow_limit_from_bits(config.pow_limit_bits),
            pow_limit_bits: config.pow_limit_bits,
            max_satoshi: config.max_satoshi,
            subsidy_reduction_interval: config.subsidy_reduction_interval,
            coinbase_maturity: config.coinbase_maturity,
            entangle_height: config.entangle_height,
            no_difficulty_adjustment: config.no_difficulty_adjustment,
            genesis_hash: Hash256::from_hex(&config.genesis_hash).unwrap_or(Hash256::ZERO),
            checkpoints: config.checkpoints.clone(),
            deployments: config.deployments,
            excessive_block_size: config.excessive_block_size,
        }
    }

    /// The latest configured checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// The checkpoint pinned at `height`, if any.
    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }
}

/// Configuration for custom networks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub pow_limit_bits: u32,
    pub max_satoshi: i64,
    pub subsidy_reduction_interval: i32,
    pub coinbase_maturity: i32,
    pub entangle_height: i32,
    #[serde(default)]
    pub no_difficulty_adjustment: bool,
    #[serde(default)]
    pub genesis_hash: String,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    pub deployments: [Deployment; DEFINED_DEPLOYMENTS],
    pub excessive_block_size: u32,
}

fn pow_limit_from_bits(bits: u32) -> BigUint {
    compact_to_big(bits)
        .to_biguint()
        .unwrap_or_else(BigUint::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_pow_limit_matches_bits() {
        let params = ChainParams::mainnet();
        assert_eq!(
            crate::compact::big_to_compact(&params.pow_limit.clone().into()),
            params.pow_limit_bits
        );
    }

    #[test]
    fn test_regtest_skips_difficulty_adjustment() {
        assert!(ChainParams::regtest().no_difficulty_adjustment);
        assert!(!ChainParams::mainnet().no_difficulty_adjustment);
    }

    #[test]
    fn test_from_config() {
        let config = ChainConfig {
            name: "testnet".into(),
            pow_limit_bits: 0x1e0fffff,
            max_satoshi: 21_000 * braid_primitives::COIN,
            subsidy_reduction_interval: 1000,
            coinbase_maturity: 20,
            entangle_height: 50,
            no_difficulty_adjustment: false,
            genesis_hash: String::new(),
            checkpoints: vec![Checkpoint {
                height: 100,
                hash: "00".repeat(32),
            }],
            deployments: [
                Deployment {
                    start_time: 0,
                    expire_time: 0,
                },
                Deployment {
                    start_time: 0,
                    expire_time: 0,
                },
            ],
            excessive_block_size: 2_000_000,
        };
        let params = ChainParams::from_config(&config);
        assert_eq!(params.name, "testnet");
        assert_eq!(params.coinbase_maturity, 20);
        assert_eq!(params.latest_checkpoint().unwrap().height, 100);
        assert!(params.checkpoint_at(99).is_none());
    }
}
