//! Sync settings.
use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{
    error::SyncError,
    trie::{ClaimtriePolicy, ConsensusParams},
};

/// Chain the node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// LBRY mainnet.
    #[default]
    Mainnet,
    /// LBRY testnet.
    Testnet,
    /// Local regression-test chain.
    Regtest,
}

impl Network {
    /// Message start written before every record in the block files.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xfa, 0xe4, 0xaa, 0xf1],
            Self::Testnet => [0xfa, 0xe4, 0xaa, 0xe1],
            Self::Regtest => [0xfa, 0xe4, 0xaa, 0xd1],
        }
    }

    /// Activation and expiration constants of this network.
    pub fn consensus_params(&self) -> ConsensusParams {
        match self {
            Self::Mainnet => ConsensusParams::MAINNET,
            Self::Testnet => ConsensusParams::TESTNET,
            Self::Regtest => ConsensusParams::REGTEST,
        }
    }
}

/// Settings for [`ClaimtrieSync`](crate::ClaimtrieSync).
///
/// ```toml
/// network = "regtest"
/// blocks_dir = "/var/lib/lbrycrd/regtest/blocks"
/// db_path = "claims.db"
/// read_progress_interval = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Chain whose rules and block-file magic apply.
    pub network: Network,
    /// Directory with the node's `blk*.dat` files.
    pub blocks_dir: Option<PathBuf>,
    /// SQLite database for the derived claim index.
    pub db_path: Option<PathBuf>,
    /// Blocks between `block.read` progress events.
    pub read_progress_interval: u64,
    /// Transactions between `block.save` progress events.
    pub save_progress_interval: u64,
    /// Rows between `claim.update` progress events.
    pub claim_progress_interval: u64,
    /// Events a subscriber may fall behind before it starts skipping.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            blocks_dir: None,
            db_path: None,
            read_progress_interval: 100,
            save_progress_interval: 100,
            claim_progress_interval: 500,
            event_capacity: 1024,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, SyncError> {
        let config: Self = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Set the network.
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Set the block-file directory.
    pub fn with_blocks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blocks_dir = Some(dir.into());
        self
    }

    /// Set the database path.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Set the read, save and claim-row progress intervals.
    pub fn with_progress_intervals(mut self, read: u64, save: u64, claims: u64) -> Self {
        self.read_progress_interval = read;
        self.save_progress_interval = save;
        self.claim_progress_interval = claims;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Consensus rules for the configured network.
    pub fn policy(&self) -> Arc<dyn ClaimtriePolicy> {
        Arc::new(self.network.consensus_params())
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.read_progress_interval == 0
            || self.save_progress_interval == 0
            || self.claim_progress_interval == 0
        {
            return Err(SyncError::Config("progress intervals must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            network = "regtest"
            blocks_dir = "/tmp/blocks"
            save_progress_interval = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.blocks_dir, Some(PathBuf::from("/tmp/blocks")));
        assert_eq!(config.save_progress_interval, 10);
        assert_eq!(config.read_progress_interval, 100);
        assert_eq!(config.network.consensus_params(), ConsensusParams::REGTEST);
    }

    #[test]
    fn rejects_unknown_keys_and_zero_intervals() {
        assert!(SyncConfig::from_toml_str("speed = 3").is_err());
        assert!(SyncConfig::from_toml_str("read_progress_interval = 0").is_err());
    }
}
