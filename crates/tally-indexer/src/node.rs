//! Indexer composition.
//!
//! Wires storage, sync state, the peer worker, the optional worker pool,
//! the block ingester, and the sync coordinator for one `chain:network`.

use std::sync::Arc;

use tracing::{info, warn};

use tally_core::ledger::LedgerStore;
use tally_core::records::{WalletBalance, WalletId};
use tally_network::{Libp2pPool, PeerPool, PeerWorker, PeerWorkerConfig};

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::ingest::{ingest_tasks, BlockIngester, IngestConfig};
use crate::pool::WorkerPool;
use crate::state::SyncStateStore;
use crate::storage::RocksStore;
use crate::sync::{SyncConfig, SyncCoordinator, SyncStatus};

/// A running indexer for one chain and network.
pub struct Indexer {
    config: IndexerConfig,
    store: Arc<RocksStore>,
    worker: Arc<PeerWorker>,
    pool: Option<Arc<WorkerPool>>,
    coordinator: Arc<SyncCoordinator>,
    /// Set when the indexer owns a libp2p swarm.
    network: Option<Arc<Libp2pPool>>,
}

impl Indexer {
    /// Open storage and start the libp2p peer pool.
    pub async fn start(config: IndexerConfig) -> Result<Arc<Self>, IndexerError> {
        let network = Libp2pPool::start(config.network_config())
            .await
            .map(Arc::new)
            .map_err(|e| IndexerError::Startup(format!("failed to start network: {e}")))?;
        info!(peer_id = %network.local_peer_id(), "network started");
        let peers: Arc<dyn PeerPool> = network.clone();
        Self::build(config, peers, Some(network))
    }

    /// Build an indexer over an existing peer pool.
    pub fn with_peers(
        config: IndexerConfig,
        peers: Arc<dyn PeerPool>,
    ) -> Result<Arc<Self>, IndexerError> {
        Self::build(config, peers, None)
    }

    fn build(
        config: IndexerConfig,
        peers: Arc<dyn PeerPool>,
        network: Option<Arc<Libp2pPool>>,
    ) -> Result<Arc<Self>, IndexerError> {
        config.validate()?;
        let chain = config.chain_network();

        let store = Arc::new(RocksStore::open(config.db_path())?);
        let ledger: Arc<dyn LedgerStore> = store.clone();
        let state = Arc::new(SyncStateStore::load(config.sync_state_path())?);

        let worker = Arc::new(PeerWorker::new(
            peers,
            PeerWorkerConfig::from(&config.network_config()),
        ));

        let mut ingester = BlockIngester::new(
            Arc::clone(&ledger),
            IngestConfig::from_indexer(&config)?,
            chain.clone(),
        );
        let pool = if config.pool_workers > 0 {
            let pool = Arc::new(WorkerPool::start(
                config.pool_workers,
                ingest_tasks(Arc::clone(&ledger)),
                config.pool_restart_delay(),
            ));
            ingester = ingester.with_pool(Arc::clone(&pool));
            Some(pool)
        } else {
            None
        };

        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&worker),
            Arc::new(ingester),
            state,
            SyncConfig::from(&config),
        ));

        info!(
            %chain,
            db = %config.db_path().display(),
            pool_workers = config.pool_workers,
            "indexer ready"
        );

        Ok(Arc::new(Self {
            config,
            store,
            worker,
            pool,
            coordinator,
            network,
        }))
    }

    /// Connect to peers, then sync and follow the chain until shut down.
    pub async fn run(self: &Arc<Self>) -> Result<(), IndexerError> {
        self.worker.connect().await?;
        Arc::clone(&self.coordinator).run().await
    }

    /// Stop syncing, close peer connections and workers, flush storage.
    pub async fn shutdown(&self) -> Result<(), IndexerError> {
        self.coordinator.shutdown();
        if let Err(e) = self.worker.disconnect().await {
            warn!(error = %e, "peer disconnect failed");
        }
        self.worker.shutdown();
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        if let Some(network) = &self.network {
            network.shutdown();
        }
        self.store.flush()?;
        info!(chain = %self.config.chain_network(), "indexer stopped");
        Ok(())
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RocksStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn status(&self) -> SyncStatus {
        self.coordinator.status()
    }

    /// Watch `address` for `wallet`, tagging coins it already holds.
    pub fn register_wallet_address(
        &self,
        wallet: WalletId,
        address: &str,
    ) -> Result<usize, IndexerError> {
        Ok(self.store.register_wallet_address(wallet, address)?)
    }

    pub fn wallet_balance(&self, wallet: WalletId) -> Result<WalletBalance, IndexerError> {
        Ok(self.store.wallet_balance(wallet)?)
    }
}
