//! Configuration for the Meridian node.
//!
//! Chain parameters (consensus-critical) and node parameters (local) are
//! separate sections. An optional `meridian.toml` in the data directory is
//! loaded first; CLI flags override file values. Missing file or sections
//! fall back to defaults.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::constants;

/// Consensus-critical chain parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Replay-protection chain id.
    pub chain_id: u64,
    /// Block issuance period in seconds.
    pub period: u64,
    /// Number of delegate producers in the schedule.
    pub delegate_count: u64,
    /// Bonus candidates beyond the deterministic set; one is drawn per
    /// schedule.
    pub bonus_delegate_count: u64,
    /// Consecutive slots each producer keeps the turn for.
    pub turn_block_count: u64,
    /// Initial token distribution in whole tokens.
    pub initial_distribution: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            chain_id: 101,
            period: constants::BLOCK_PERIOD,
            delegate_count: constants::DELEGATE_COUNT,
            bonus_delegate_count: constants::BONUS_DELEGATE_COUNT,
            turn_block_count: constants::TURN_BLOCK_COUNT,
            initial_distribution: constants::INITIAL_DISTRIBUTION,
        }
    }
}

impl ChainConfig {
    /// Normalize zero values the way the engine expects: a zero period
    /// falls back to the default, the rest stay as configured (and are
    /// warned about at use sites).
    pub fn normalized(mut self) -> Self {
        if self.period == 0 {
            self.period = constants::BLOCK_PERIOD;
        }
        if self.initial_distribution == 0 {
            self.initial_distribution = constants::INITIAL_DISTRIBUTION;
        }
        self
    }
}

/// Local node parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub data_dir: String,
    /// Producer signing key (hex). Absent means the node does not seal.
    pub signer_key: Option<String>,
    /// Bootstrap node URLs (`enode://HEX@HOST:PORT`).
    pub bootnodes: Vec<String>,
    /// Gas limit floor for produced blocks.
    pub gas_floor: u64,
    /// Gas limit ceiling for produced blocks.
    pub gas_ceil: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            rpc_host: "127.0.0.1".into(),
            rpc_port: 8545,
            data_dir: "./meridian-data".into(),
            signer_key: None,
            bootnodes: vec![],
            gas_floor: 8_000_000,
            gas_ceil: constants::GENESIS_GAS_LIMIT,
        }
    }
}

impl NodeConfig {
    pub fn rpc_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.rpc_host, self.rpc_port).parse()
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub chain: ChainConfig,
    pub node: NodeConfig,
}

impl MeridianConfig {
    /// Load `meridian.toml` from the data directory, or defaults if absent.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("meridian.toml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<MeridianConfig>(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config file");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Bad config file, using defaults");
                    MeridianConfig::default()
                }
            },
            Err(_) => MeridianConfig::default(),
        }
    }
}
