// Configuration
//
// Economic and consensus parameters for the ledger, plus the knobs of the
// demo simulation. Both have sensible defaults; the ledger parameters can be
// overridden from a JSON file and the simulation from environment variables.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::amount::Amount;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Who counts towards the majority when a block is put to a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Only the nodes that actually vote, i.e. everyone but the proposer
    ExcludeProposer,
    /// Every registered node, including the proposer who never votes
    AllNodes,
}

/// Ledger-wide economic and consensus parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Leading zero hex characters required of the first blocks
    pub initial_difficulty: u32,

    /// Coinbase reward before any halving
    pub initial_block_reward: Amount,

    /// Blocks between reward halvings
    pub halving_interval: u64,

    /// Blocks between difficulty adjustments
    pub difficulty_retarget_interval: u64,

    /// Desired average time between blocks, in milliseconds
    pub target_block_time_ms: u64,

    /// Maximum amount that can ever be minted
    pub total_supply: Amount,

    /// Byte budget of a block, coinbase included
    pub block_size_limit: usize,

    pub quorum: QuorumPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            initial_difficulty: 1,
            initial_block_reward: Amount::coins(50),
            halving_interval: 210_000,
            difficulty_retarget_interval: 2016,
            target_block_time_ms: 10_000,
            total_supply: Amount::coins(21_000_000),
            block_size_limit: 1_000_000,
            quorum: QuorumPolicy::ExcludeProposer,
        }
    }
}

impl LedgerConfig {
    /// Loads a config from a JSON file; missing fields keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn target_block_time(&self) -> Duration {
        Duration::from_millis(self.target_block_time_ms)
    }
}

/// Parameters of the demo run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of mining nodes, including the genesis miner
    pub miners: usize,

    /// How long the simulation runs before shutting down, in seconds
    pub run_seconds: u64,

    /// Delay before the extra miners join, in seconds
    pub late_join_seconds: u64,

    /// Multiplier applied to every node's inter-attempt delay
    pub delay_scale: f64,

    /// Payments the genesis wallet makes to a fresh wallet
    pub payments: u32,

    /// Optional JSON file with ledger overrides
    pub ledger_config_path: Option<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            miners: 3,
            run_seconds: 30,
            late_join_seconds: 5,
            delay_scale: 0.05,
            payments: 10,
            ledger_config_path: None,
        }
    }
}

impl SimulationConfig {
    /// Reads `POW_LEDGER_*` environment variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = SimulationConfig::default();

        if let Some(miners) = read_var("POW_LEDGER_MINERS")? {
            config.miners = miners;
        }
        if let Some(seconds) = read_var("POW_LEDGER_RUN_SECONDS")? {
            config.run_seconds = seconds;
        }
        if let Some(seconds) = read_var("POW_LEDGER_LATE_JOIN_SECONDS")? {
            config.late_join_seconds = seconds;
        }
        if let Some(scale) = read_var("POW_LEDGER_DELAY_SCALE")? {
            config.delay_scale = scale;
        }
        if let Some(payments) = read_var("POW_LEDGER_PAYMENTS")? {
            config.payments = payments;
        }
        if let Ok(path) = env::var("POW_LEDGER_CONFIG") {
            config.ledger_config_path = Some(path);
        }

        Ok(config)
    }

    /// The ledger config named by `ledger_config_path`, or the defaults
    pub fn ledger_config(&self) -> Result<LedgerConfig, ConfigError> {
        match &self.ledger_config_path {
            Some(path) => LedgerConfig::from_json_file(path),
            None => Ok(LedgerConfig::default()),
        }
    }
}

fn read_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.initial_block_reward, Amount::coins(50));
        assert_eq!(config.total_supply, Amount::coins(21_000_000));
        assert_eq!(config.quorum, QuorumPolicy::ExcludeProposer);
        assert_eq!(config.target_block_time(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = env::temp_dir().join(format!("pow_ledger_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ledger.json");
        std::fs::write(&path, r#"{ "halving_interval": 4, "quorum": "all_nodes" }"#).unwrap();

        let config = LedgerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.halving_interval, 4);
        assert_eq!(config.quorum, QuorumPolicy::AllNodes);
        assert_eq!(config.initial_difficulty, 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = LedgerConfig::from_json_file("/definitely/not/here.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_read_var_rejects_garbage() {
        env::set_var("POW_LEDGER_TEST_GARBAGE", "many");
        let result = read_var::<usize>("POW_LEDGER_TEST_GARBAGE");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        assert_eq!(read_var::<usize>("POW_LEDGER_TEST_UNSET").unwrap(), None);
    }
}
