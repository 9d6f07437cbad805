//! Sync coordination.
//!
//! [`SyncCoordinator`] drives the `Idle -> Syncing -> Idle` cycle: it asks
//! peers for the headers after the local tip, fetches each block, hands it
//! to the [`BlockIngester`], and repeats until peers have nothing newer.
//! A failed pass is logged and restarted after `restart_delay`; a cancelled
//! one is not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tally_core::constants::LOCATOR_LENGTH;
use tally_core::error::NetworkError;
use tally_network::{InvKind, PeerEvent, PeerWorker};

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::ingest::{log_rollback, BlockIngester};
use crate::state::SyncStateStore;

/// Timing knobs for [`SyncCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub restart_delay: Duration,
    /// Log progress every this many blocks. Zero disables progress logs.
    pub progress_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            progress_interval: 100,
        }
    }
}

impl From<&IndexerConfig> for SyncConfig {
    fn from(cfg: &IndexerConfig) -> Self {
        Self {
            restart_delay: cfg.restart_delay(),
            progress_interval: cfg.sync.progress_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
}

/// Snapshot returned by [`SyncCoordinator::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub chain: String,
    pub phase: SyncPhase,
    pub initial_sync_complete: bool,
    pub local_height: Option<u64>,
    pub best_pool_height: u64,
    pub peer_count: usize,
    /// Sync passes completed since start.
    pub passes: u64,
}

/// Result of one [`SyncCoordinator::sync`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass was already running.
    AlreadySyncing,
    Completed { blocks: u64, height: Option<u64> },
}

/// Clears the syncing flag when a pass ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncCoordinator {
    worker: Arc<PeerWorker>,
    ingester: Arc<BlockIngester>,
    state: Arc<SyncStateStore>,
    config: SyncConfig,
    syncing: AtomicBool,
    done: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    /// Cancellation follows the worker's token.
    pub fn new(
        worker: Arc<PeerWorker>,
        ingester: Arc<BlockIngester>,
        state: Arc<SyncStateStore>,
        config: SyncConfig,
    ) -> Self {
        let cancel = worker.cancellation_token();
        let (done, _) = watch::channel(0);
        Self {
            worker,
            ingester,
            state,
            config,
            syncing: AtomicBool::new(false),
            done,
            cancel,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Completed pass counter; changes once per finished sync pass.
    pub fn subscribe_done(&self) -> watch::Receiver<u64> {
        self.done.subscribe()
    }

    /// Resolve once the first sync pass has completed.
    pub async fn sync_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|passes| *passes > 0).await;
    }

    pub fn status(&self) -> SyncStatus {
        let chain = self.ingester.chain();
        SyncStatus {
            chain: chain.to_string(),
            phase: if self.is_syncing() {
                SyncPhase::Syncing
            } else {
                SyncPhase::Idle
            },
            initial_sync_complete: self.state.is_complete(chain),
            local_height: self.local_height(),
            best_pool_height: self.worker.best_pool_height(),
            peer_count: self.worker.peer_count(),
            passes: *self.done.borrow(),
        }
    }

    /// Stop the event loop and abort any pass in progress.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn local_height(&self) -> Option<u64> {
        self.ingester
            .store()
            .local_tip()
            .ok()
            .flatten()
            .map(|tip| tip.height)
    }

    /// Bring the local chain up to the peers' tip.
    ///
    /// Returns immediately when a pass is already running. Errors other than
    /// cancellation restart the pass after `restart_delay`.
    pub async fn sync(&self) -> Result<SyncOutcome, IndexerError> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Ok(SyncOutcome::AlreadySyncing);
        }
        let guard = SyncingGuard(&self.syncing);
        let chain = self.ingester.chain();

        loop {
            match self.sync_pass().await {
                Ok(blocks) => {
                    let height = self.local_height();
                    if self.state.mark_complete(chain)? {
                        info!(%chain, ?height, "initial sync complete");
                    }
                    drop(guard);
                    self.done.send_modify(|passes| *passes += 1);
                    debug!(%chain, blocks, ?height, "sync pass finished");
                    return Ok(SyncOutcome::Completed { blocks, height });
                }
                Err(e) if e.is_cancelled() || self.cancel.is_cancelled() => {
                    info!(%chain, "sync cancelled");
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        %chain,
                        height = ?self.local_height(),
                        error = %e,
                        delay_ms = self.config.restart_delay.as_millis() as u64,
                        "sync failed, restarting"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(NetworkError::Cancelled.into());
                        }
                        _ = tokio::time::sleep(self.config.restart_delay) => {}
                    }
                }
            }
        }
    }

    /// One pass: cleanup, then fetch and ingest until headers run dry.
    async fn sync_pass(&self) -> Result<u64, IndexerError> {
        let chain = self.ingester.chain();
        let store = self.ingester.store();

        if self.state.is_complete(chain) {
            debug!(%chain, "catching up with peers");
        } else {
            info!(%chain, "starting initial sync");
        }

        let from = store.local_tip()?.map(|tip| tip.height + 1).unwrap_or(0);
        let removed = store.remove_above_tip()?;
        log_rollback(chain, from, &removed);

        let started = Instant::now();
        let mut ingested = 0u64;
        loop {
            let locator = store.locator_hashes(LOCATOR_LENGTH)?;
            let headers = self.worker.get_headers(locator).await?;
            if headers.is_empty() {
                break;
            }
            debug!(%chain, count = headers.len(), "fetching blocks");

            let mut progressed = false;
            for header in headers {
                let hash = header.hash();
                if store.get_block(&hash)?.is_some_and(|b| b.processed) {
                    continue;
                }
                progressed = true;
                let block = self.worker.get_block(hash).await?;
                let report = self.ingester.add_block(&block).await?;
                ingested += 1;

                if self.config.progress_interval > 0
                    && ingested % self.config.progress_interval == 0
                {
                    let minutes = started.elapsed().as_secs_f64() / 60.0;
                    let per_minute = if minutes > 0.0 {
                        ingested as f64 / minutes
                    } else {
                        0.0
                    };
                    info!(
                        %chain,
                        height = report.height,
                        blocks = ingested,
                        blocks_per_minute = per_minute.round() as u64,
                        peer_height = self.worker.best_pool_height(),
                        "sync progress"
                    );
                }
            }
            // Peers only sent blocks we already hold.
            if !progressed {
                break;
            }
        }
        Ok(ingested)
    }

    fn spawn_sync(self: &Arc<Self>) {
        if self.is_syncing() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.sync().await {
                if !e.is_cancelled() {
                    error!(chain = %this.ingester.chain(), error = %e, "sync stopped");
                }
            }
        });
    }

    /// Initial sync, then react to peer events until cancelled.
    ///
    /// New blocks (direct or announced) start a sync pass when idle; loose
    /// transactions are imported into the mempool.
    pub async fn run(self: Arc<Self>) -> Result<(), IndexerError> {
        let mut events = self.worker.subscribe();
        self.spawn_sync();

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(PeerEvent::Block { .. }) => self.spawn_sync(),
                Ok(PeerEvent::Inv(items)) if items.iter().any(|i| i.kind == InvKind::Block) => {
                    self.spawn_sync()
                }
                Ok(PeerEvent::Tx { hash, tx }) => {
                    match self.ingester.add_mempool_transaction(&tx).await {
                        Ok(true) => debug!(txid = %hash, "imported mempool transaction"),
                        Ok(false) => {}
                        Err(e) => warn!(txid = %hash, error = %e, "mempool import failed"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sync event loop lagged");
                    self.spawn_sync();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!(chain = %self.ingester.chain(), "sync coordinator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ledger::LedgerStore;
    use tally_core::memory::MemoryLedgerStore;
    use tally_core::records::ChainNetwork;
    use tally_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
    use tally_network::{PeerWorkerConfig, ScriptedPool};

    use crate::ingest::IngestConfig;

    fn coinbase(tag: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: tag.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 50,
                script: vec![0x51],
                address: Some(format!("addr{tag}")),
            }],
            lock_time: 0,
        }
    }

    fn chain_from(prev: Hash256, start: u64, n: u64) -> Vec<Block> {
        let mut prev = prev;
        (0..n)
            .map(|i| {
                let block = Block {
                    header: BlockHeader {
                        version: 1,
                        prev_hash: prev,
                        merkle_root: Hash256::ZERO,
                        time: 1_000 + start + i,
                        bits: 0,
                        nonce: start + i,
                    },
                    transactions: vec![coinbase(start + i)],
                };
                prev = block.hash();
                block
            })
            .collect()
    }

    struct Harness {
        pool: Arc<ScriptedPool>,
        store: Arc<MemoryLedgerStore>,
        coordinator: Arc<SyncCoordinator>,
        _dir: tempfile::TempDir,
    }

    async fn harness(chain: Vec<Block>, headers_per_batch: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(ScriptedPool::new(chain).with_headers_per_batch(headers_per_batch));
        let worker = Arc::new(PeerWorker::new(
            pool.clone(),
            PeerWorkerConfig {
                retry_interval: Duration::from_millis(20),
                max_retries: Some(5),
                reconnect_interval: Duration::from_secs(60),
                ..PeerWorkerConfig::default()
            },
        ));
        worker.connect().await.unwrap();

        let store = Arc::new(MemoryLedgerStore::new());
        let ingester = Arc::new(BlockIngester::new(
            store.clone(),
            IngestConfig::default(),
            ChainNetwork::new("TALLY", "regtest"),
        ));
        let state = Arc::new(SyncStateStore::load(dir.path().join("sync-state.json")).unwrap());
        let coordinator = Arc::new(SyncCoordinator::new(
            worker,
            ingester,
            state,
            SyncConfig {
                restart_delay: Duration::from_millis(20),
                progress_interval: 2,
            },
        ));
        Harness {
            pool,
            store,
            coordinator,
            _dir: dir,
        }
    }

    // ------------------------------------------------------------------
    // sync()
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn sync_ingests_whole_chain_in_batches() {
        let h = harness(chain_from(Hash256::ZERO, 0, 5), 2).await;
        let outcome = h.coordinator.sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                blocks: 5,
                height: Some(5)
            }
        );
        assert!(!h.coordinator.is_syncing());

        let status = h.coordinator.status();
        assert!(status.initial_sync_complete);
        assert_eq!(status.passes, 1);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(h.store.coin_count(), 5);
    }

    #[tokio::test]
    async fn second_pass_fetches_only_new_blocks() {
        let chain = chain_from(Hash256::ZERO, 0, 3);
        let tip = chain[2].hash();
        let h = harness(chain, 10).await;
        h.coordinator.sync().await.unwrap();

        for block in chain_from(tip, 3, 2) {
            h.pool.push_block(block);
        }
        let outcome = h.coordinator.sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                blocks: 2,
                height: Some(5)
            }
        );
    }

    #[tokio::test]
    async fn sync_follows_reorg() {
        let base = chain_from(Hash256::ZERO, 0, 3);
        let h = harness(base.clone(), 10).await;
        h.coordinator.sync().await.unwrap();

        let mut fork = base[..2].to_vec();
        fork.extend(chain_from(base[1].hash(), 100, 2));
        h.pool.set_chain(fork.clone());
        h.coordinator.sync().await.unwrap();

        let tip = h.store.local_tip().unwrap().unwrap();
        assert_eq!(tip.hash, fork[3].hash());
        assert_eq!(tip.height, 4);
        assert!(h.store.get_block(&base[2].hash()).unwrap().is_none());
        assert_eq!(h.store.coin_count(), 4);
    }

    #[tokio::test]
    async fn sync_done_resolves_after_first_pass() {
        let h = harness(chain_from(Hash256::ZERO, 0, 2), 10).await;
        let waiter = {
            let c = Arc::clone(&h.coordinator);
            tokio::spawn(async move { c.sync_done().await })
        };
        h.coordinator.sync().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_sync_is_skipped() {
        let h = harness(chain_from(Hash256::ZERO, 0, 2), 10).await;
        h.pool.set_silent(true);
        let c = Arc::clone(&h.coordinator);
        let running = tokio::spawn(async move { c.sync().await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(h.coordinator.is_syncing());
        assert_eq!(
            h.coordinator.sync().await.unwrap(),
            SyncOutcome::AlreadySyncing
        );
        h.pool.set_silent(false);
        assert!(matches!(
            running.await.unwrap().unwrap(),
            SyncOutcome::Completed { blocks: 2, .. }
        ));
    }

    #[tokio::test]
    async fn failed_pass_is_restarted() {
        let h = harness(chain_from(Hash256::ZERO, 0, 2), 10).await;
        // Exhausts the retry bound once, then answers.
        h.pool.drop_next(5);
        let outcome = tokio::time::timeout(Duration::from_secs(5), h.coordinator.sync())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                blocks: 2,
                height: Some(2)
            }
        );
    }

    #[tokio::test]
    async fn restarts_after_failing_block() {
        let genesis = chain_from(Hash256::ZERO, 0, 1).remove(0);
        let mut bad = chain_from(genesis.hash(), 1, 1).remove(0);
        bad.header.nonce = 999;
        bad.transactions.push(Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    txid: Hash256([0xAB; 32]),
                    index: 0,
                },
                script_sig: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![],
            lock_time: 0,
        });
        let good = chain_from(genesis.hash(), 1, 1).remove(0);

        let h = harness(vec![genesis.clone(), bad.clone()], 10).await;
        let c = Arc::clone(&h.coordinator);
        let running = tokio::spawn(async move { c.sync().await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.coordinator.is_syncing());

        h.pool.set_chain(vec![genesis, good.clone()]);
        let outcome = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed { height: Some(2), .. }));
        assert_eq!(h.store.local_tip().unwrap().unwrap().hash, good.hash());
        assert!(h.store.get_block(&bad.hash()).unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_sync() {
        let h = harness(chain_from(Hash256::ZERO, 0, 2), 10).await;
        h.pool.set_silent(true);
        let c = Arc::clone(&h.coordinator);
        let running = tokio::spawn(async move { c.sync().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.coordinator.shutdown();

        let err = running.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!h.coordinator.is_syncing());
        assert!(!h.coordinator.status().initial_sync_complete);
    }

    // ------------------------------------------------------------------
    // run()
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn run_syncs_on_announced_block_and_imports_txs() {
        let chain = chain_from(Hash256::ZERO, 0, 2);
        let tip = chain[1].hash();
        let h = harness(chain, 10).await;
        let mut done = h.coordinator.subscribe_done();
        let runner = tokio::spawn(Arc::clone(&h.coordinator).run());

        done.wait_for(|passes| *passes >= 1).await.unwrap();

        let next = chain_from(tip, 2, 1).remove(0);
        let next_hash = next.hash();
        h.pool.push_block(next);
        h.pool.emit(PeerEvent::Inv(vec![tally_network::InvItem::block(next_hash)]));
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if h.store.local_tip().unwrap().map(|t| t.hash) == Some(next_hash) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let loose = coinbase(999);
        let txid = loose.txid().unwrap();
        h.pool.emit(PeerEvent::Tx {
            hash: txid,
            tx: loose,
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.get_transaction(&txid).unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        h.coordinator.shutdown();
        runner.await.unwrap().unwrap();
    }
}
