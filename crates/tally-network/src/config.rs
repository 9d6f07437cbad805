//! Network configuration for the Tally peer worker.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use tally_core::constants::{INV_BLOCK_CAPACITY, INV_TX_CAPACITY};

/// Default TCP port the peer worker listens on.
pub const DEFAULT_P2P_PORT: u16 = 18444;

/// Configuration for the peer network worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IP address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Multiaddresses of the trusted peers blocks are pulled from.
    pub trusted_peers: Vec<String>,
    /// How often disconnected trusted peers are re-dialed.
    pub reconnect_interval_ms: u64,
    /// How often an unanswered header/block request is resent.
    pub retry_interval_ms: u64,
    /// Give up on a request after this many sends. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Gossipsub heartbeat interval.
    pub gossipsub_heartbeat_ms: u64,
    /// Per-attempt timeout of the request-response protocol.
    pub request_timeout_ms: u64,
    /// Inventory cache capacity for block hashes.
    pub inv_block_capacity: usize,
    /// Inventory cache capacity for transaction hashes.
    pub inv_tx_capacity: usize,
    /// File holding the node's Ed25519 identity. A fresh key is used when unset.
    pub node_key_path: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_P2P_PORT,
            trusted_peers: Vec::new(),
            reconnect_interval_ms: 5_000,
            retry_interval_ms: 1_000,
            max_retries: None,
            gossipsub_heartbeat_ms: 1_000,
            request_timeout_ms: 30_000,
            inv_block_capacity: INV_BLOCK_CAPACITY,
            inv_tx_capacity: INV_TX_CAPACITY,
            node_key_path: None,
        }
    }
}

impl NetworkConfig {
    /// Mainnet preset: default port, unbounded retries.
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Testnet preset on its own port.
    pub fn testnet() -> Self {
        Self {
            listen_port: 28444,
            ..Self::default()
        }
    }

    /// Local regtest preset: loopback only, fast retries.
    pub fn regtest() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 38444,
            reconnect_interval_ms: 1_000,
            retry_interval_ms: 250,
            ..Self::default()
        }
    }

    /// Build the libp2p multiaddr string for the configured listen address and port.
    pub fn listen_multiaddr(&self) -> String {
        format!("/ip4/{}/tcp/{}", self.listen_addr, self.listen_port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn gossipsub_heartbeat(&self) -> Duration {
        Duration::from_millis(self.gossipsub_heartbeat_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
