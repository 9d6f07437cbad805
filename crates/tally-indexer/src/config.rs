//! Indexer configuration.
//!
//! [`IndexerConfig::load`] layers built-in defaults, an optional TOML file,
//! and `TALLY__*` environment variables (`TALLY__BATCH_SIZE=1000`,
//! `TALLY__P2P__LISTEN_PORT=9000`, `TALLY__TRUSTED_PEERS=a,b`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tally_core::constants::{DEFAULT_BATCH_SIZE, DEFAULT_GENESIS_HEIGHT, DEFAULT_MAX_CONCURRENT_OPS};
use tally_core::records::ChainNetwork;
use tally_core::types::Hash256;
use tally_network::NetworkConfig;

use crate::error::IndexerError;

const ENV_PREFIX: &str = "TALLY";

/// Which block may be ingested without a known parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Hex block hash. When unset, any block with a zero `prev_hash` counts.
    pub hash: Option<String>,
    pub height: u64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            hash: None,
            height: DEFAULT_GENESIS_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Delay before a failed sync pass starts over.
    pub restart_delay_ms: u64,
    /// Log progress every this many ingested blocks.
    pub progress_interval: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            restart_delay_ms: 1_000,
            progress_interval: 100,
        }
    }
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub chain: String,
    pub network: String,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Trusted peer multiaddrs, merged into `p2p.trusted_peers`.
    pub trusted_peers: Vec<String>,
    /// Storage batches in flight per block.
    pub max_concurrent_ops: usize,
    /// Records per storage batch.
    pub batch_size: usize,
    /// Wallet tagging workers. Zero tags inline.
    pub pool_workers: usize,
    pub genesis: GenesisConfig,
    /// Drop a coin's script once it is spent.
    pub prune_spent_scripts: bool,
    pub sync: SyncSettings,
    pub pool_restart_delay_ms: u64,
    pub p2p: NetworkConfig,
    /// Log level filter string (e.g. "info", "tally_indexer=debug").
    pub log_level: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tally");

        Self {
            chain: "TALLY".to_string(),
            network: "mainnet".to_string(),
            data_dir,
            trusted_peers: Vec::new(),
            max_concurrent_ops: DEFAULT_MAX_CONCURRENT_OPS,
            batch_size: DEFAULT_BATCH_SIZE,
            pool_workers: 0,
            genesis: GenesisConfig::default(),
            prune_spent_scripts: false,
            sync: SyncSettings::default(),
            pool_restart_delay_ms: 5_000,
            p2p: NetworkConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl IndexerConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, IndexerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("trusted_peers")
                .with_list_parse_key("p2p.trusted_peers"),
        );

        let cfg: IndexerConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| IndexerError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the indexer cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.chain.trim().is_empty() {
            return Err(IndexerError::Config("chain must not be empty".into()));
        }
        if self.network.trim().is_empty() {
            return Err(IndexerError::Config("network must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be positive".into()));
        }
        if self.max_concurrent_ops == 0 {
            return Err(IndexerError::Config("max_concurrent_ops must be positive".into()));
        }
        self.genesis_hash()?;
        Ok(())
    }

    pub fn chain_network(&self) -> ChainNetwork {
        ChainNetwork::new(self.chain.clone(), self.network.clone())
    }

    /// Path to the RocksDB ledger for this chain and network.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir
            .join(&self.chain)
            .join(&self.network)
            .join("ledger")
    }

    pub fn sync_state_path(&self) -> PathBuf {
        self.data_dir.join("sync-state.json")
    }

    /// Parsed `genesis.hash`.
    pub fn genesis_hash(&self) -> Result<Option<Hash256>, IndexerError> {
        self.genesis
            .hash
            .as_deref()
            .map(|hex| {
                Hash256::from_hex(hex)
                    .map_err(|e| IndexerError::Config(format!("invalid genesis hash: {e}")))
            })
            .transpose()
    }

    /// Peer settings with the top-level trusted peers folded in.
    pub fn network_config(&self) -> NetworkConfig {
        let mut net = self.p2p.clone();
        for peer in &self.trusted_peers {
            if !net.trusted_peers.contains(peer) {
                net.trusted_peers.push(peer.clone());
            }
        }
        if net.node_key_path.is_none() {
            net.node_key_path = Some(self.data_dir.join("node.key"));
        }
        net
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.sync.restart_delay_ms)
    }

    pub fn pool_restart_delay(&self) -> Duration {
        Duration::from_millis(self.pool_restart_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = IndexerConfig::default();
        assert_eq!(cfg.chain, "TALLY");
        assert_eq!(cfg.network, "mainnet");
        assert_eq!(cfg.max_concurrent_ops, 10);
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.genesis.height, 1);
        assert_eq!(cfg.restart_delay(), Duration::from_secs(1));
        assert_eq!(cfg.pool_restart_delay(), Duration::from_secs(5));
        assert!(cfg.data_dir.ends_with("tally"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn paths() {
        let cfg = IndexerConfig {
            data_dir: PathBuf::from("/tmp/tally-test"),
            chain: "BTC".to_string(),
            network: "testnet".to_string(),
            ..IndexerConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/tally-test/BTC/testnet/ledger"));
        assert_eq!(cfg.sync_state_path(), PathBuf::from("/tmp/tally-test/sync-state.json"));
        assert_eq!(cfg.chain_network().to_string(), "BTC:testnet");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero_batch = IndexerConfig {
            batch_size: 0,
            ..IndexerConfig::default()
        };
        assert!(matches!(zero_batch.validate(), Err(IndexerError::Config(_))));

        let zero_ops = IndexerConfig {
            max_concurrent_ops: 0,
            ..IndexerConfig::default()
        };
        assert!(zero_ops.validate().is_err());

        let empty_chain = IndexerConfig {
            chain: " ".to_string(),
            ..IndexerConfig::default()
        };
        assert!(empty_chain.validate().is_err());

        let bad_genesis = IndexerConfig {
            genesis: GenesisConfig {
                hash: Some("zz".to_string()),
                height: 1,
            },
            ..IndexerConfig::default()
        };
        assert!(bad_genesis.validate().is_err());
    }

    #[test]
    fn genesis_hash_parses_hex() {
        let cfg = IndexerConfig {
            genesis: GenesisConfig {
                hash: Some("ab".repeat(32)),
                height: 0,
            },
            ..IndexerConfig::default()
        };
        assert_eq!(cfg.genesis_hash().unwrap(), Some(Hash256([0xAB; 32])));
        assert_eq!(IndexerConfig::default().genesis_hash().unwrap(), None);
    }

    #[test]
    fn network_config_merges_trusted_peers() {
        let mut cfg = IndexerConfig {
            data_dir: PathBuf::from("/tmp/t"),
            trusted_peers: vec!["/ip4/1.2.3.4/tcp/1".to_string()],
            ..IndexerConfig::default()
        };
        cfg.p2p.trusted_peers = vec![
            "/ip4/1.2.3.4/tcp/1".to_string(),
            "/ip4/5.6.7.8/tcp/2".to_string(),
        ];
        let net = cfg.network_config();
        assert_eq!(net.trusted_peers.len(), 2);
        assert_eq!(net.node_key_path, Some(PathBuf::from("/tmp/t/node.key")));
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(
            &path,
            r#"
chain = "BTC"
network = "regtest"
batch_size = 50
trusted_peers = ["/ip4/127.0.0.1/tcp/38444"]

[genesis]
height = 0

[sync]
progress_interval = 10

[p2p]
listen_port = 9000
"#,
        )
        .unwrap();

        let cfg = IndexerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.chain, "BTC");
        assert_eq!(cfg.network, "regtest");
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.max_concurrent_ops, 10);
        assert_eq!(cfg.genesis.height, 0);
        assert_eq!(cfg.sync.progress_interval, 10);
        assert_eq!(cfg.sync.restart_delay_ms, 1_000);
        assert_eq!(cfg.p2p.listen_port, 9000);
        assert_eq!(cfg.trusted_peers.len(), 1);
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = IndexerConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(IndexerError::Config(_))));
    }
}
