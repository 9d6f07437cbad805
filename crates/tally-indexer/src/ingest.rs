//! Block ingestion.
//!
//! [`BlockIngester::add_block`] turns one decoded block into ledger writes:
//! reorg check and rollback, header upsert, coin mints, coin spends,
//! transaction records, then the processed flag. Writes go out in chunks of
//! `batch_size` with at most `max_concurrent_ops` chunks in flight.
//!
//! Wallet tagging happens inline while staging, or, when a [`WorkerPool`] is
//! attached, as one `tag-transaction-wallets` task per transaction after the
//! block's records are committed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tally_core::error::LedgerError;
use tally_core::ledger::{LedgerStore, RollbackSummary, WriteOutcome};
use tally_core::records::{
    BlockRecord, ChainNetwork, CoinRecord, SpendOp, SpentHeight, TransactionRecord, WalletId,
};
use tally_core::types::{Block, Hash256, OutPoint, Transaction};

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::pool::{TaskHandler, TaskRegistry, WorkerPool};

/// Pool task that tags a stored transaction and its coins with wallets.
pub const TAG_WALLETS_TASK: &str = "tag-transaction-wallets";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub max_concurrent_ops: usize,
    /// Block allowed without a parent. `None` accepts any zero `prev_hash`.
    pub genesis_hash: Option<Hash256>,
    pub genesis_height: u64,
    pub prune_spent_scripts: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: tally_core::constants::DEFAULT_BATCH_SIZE,
            max_concurrent_ops: tally_core::constants::DEFAULT_MAX_CONCURRENT_OPS,
            genesis_hash: None,
            genesis_height: tally_core::constants::DEFAULT_GENESIS_HEIGHT,
            prune_spent_scripts: false,
        }
    }
}

impl IngestConfig {
    pub fn from_indexer(config: &IndexerConfig) -> Result<Self, IndexerError> {
        Ok(Self {
            batch_size: config.batch_size,
            max_concurrent_ops: config.max_concurrent_ops,
            genesis_hash: config.genesis_hash()?,
            genesis_height: config.genesis.height,
            prune_spent_scripts: config.prune_spent_scripts,
        })
    }
}

/// What one `add_block` call wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub hash: Hash256,
    pub height: u64,
    /// Set when the block displaced part of the local chain.
    pub rollback: Option<RollbackSummary>,
    pub coins: WriteOutcome,
    pub spends: WriteOutcome,
    pub transactions: WriteOutcome,
}

/// Where staged records sit: a block, or the mempool.
#[derive(Clone, Copy)]
struct Placement {
    height: Option<u64>,
    hash: Option<Hash256>,
    time: u64,
    time_normalized: u64,
}

#[derive(Default)]
struct Staged {
    transactions: Vec<TransactionRecord>,
    coins: Vec<CoinRecord>,
    spends: Vec<SpendOp>,
}

fn ledger<E: Into<LedgerError>>(e: E) -> IndexerError {
    IndexerError::Ledger(e.into())
}

/// Sequential block ingestion into a [`LedgerStore`].
///
/// Blocks and mempool transactions are written one at a time: both paths
/// hold `writer` for their whole read-stage-commit cycle.
pub struct BlockIngester {
    store: Arc<dyn LedgerStore>,
    pool: Option<Arc<WorkerPool>>,
    config: IngestConfig,
    chain: ChainNetwork,
    writer: Mutex<()>,
}

impl BlockIngester {
    pub fn new(store: Arc<dyn LedgerStore>, config: IngestConfig, chain: ChainNetwork) -> Self {
        Self {
            store,
            pool: None,
            config,
            chain,
            writer: Mutex::new(()),
        }
    }

    /// Dispatch wallet tagging to `pool` instead of tagging inline.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn chain(&self) -> &ChainNetwork {
        &self.chain
    }

    fn is_genesis(&self, hash: &Hash256, prev_hash: &Hash256) -> bool {
        match &self.config.genesis_hash {
            Some(genesis) => genesis == hash,
            None => prev_hash.is_zero(),
        }
    }

    /// Ingest `block` on top of its parent, rolling back a competing branch
    /// first when needed.
    ///
    /// # Errors
    ///
    /// - [`IndexerError::OrphanBlock`] if the parent is unknown and the block
    ///   is not the genesis block
    /// - [`LedgerError::MissingUtxo`] if an input spends a coin found nowhere
    pub async fn add_block(&self, block: &Block) -> Result<IngestReport, IndexerError> {
        let _writer = self.writer.lock().await;
        let hash = block.hash();
        let prev_hash = block.header.prev_hash;

        let parent = self.store.get_block(&prev_hash)?;
        let height = match &parent {
            Some(parent) => parent.height + 1,
            None if self.is_genesis(&hash, &prev_hash) => self.config.genesis_height,
            None => return Err(IndexerError::OrphanBlock { hash, prev_hash }),
        };

        let rollback = match self.store.local_tip()? {
            Some(tip) if tip.hash != prev_hash && tip.hash != hash => {
                let summary = self.store.rollback(height)?;
                warn!(
                    chain = %self.chain,
                    tip_height = tip.height,
                    tip = %tip.hash,
                    height,
                    %hash,
                    blocks_removed = summary.blocks_removed,
                    "chain reorganization"
                );
                Some(summary)
            }
            _ => None,
        };

        let time = block.header.time;
        let time_normalized = parent
            .as_ref()
            .map(|p| time.max(p.time_normalized + 1))
            .unwrap_or(time);

        let record = BlockRecord {
            hash,
            height,
            previous_block_hash: prev_hash,
            next_block_hash: None,
            merkle_root: block.header.merkle_root,
            time,
            time_normalized,
            nonce: block.header.nonce,
            bits: block.header.bits,
            size: block.size().map_err(ledger)?,
            transaction_count: block.transactions.len() as u64,
            reward: block.reward().map_err(ledger)?,
            processed: false,
        };
        self.store.upsert_block(&record)?;
        if parent.is_some() {
            self.store.set_next_block_hash(&prev_hash, Some(hash))?;
        }

        let placement = Placement {
            height: Some(height),
            hash: Some(hash),
            time,
            time_normalized,
        };
        let tag_inline = self.pool.is_none();
        let staged = self.stage(&block.transactions, placement, tag_inline)?;
        let txids: Vec<Hash256> = staged.transactions.iter().map(|t| t.txid).collect();

        let coins = self
            .commit(staged.coins, |store, chunk| store.mint_coins(chunk))
            .await?;
        let spends = self
            .commit(staged.spends, |store, chunk| store.spend_coins(chunk))
            .await?;
        let transactions = self
            .commit(staged.transactions, |store, chunk| store.upsert_transactions(chunk))
            .await?;

        if let Some(pool) = &self.pool {
            self.tag_with_pool(pool, txids).await?;
        }

        self.store.mark_processed(&hash)?;
        debug!(
            chain = %self.chain,
            height,
            %hash,
            txs = block.transactions.len(),
            coins = coins.written,
            spends = spends.written,
            "block ingested"
        );

        Ok(IngestReport {
            hash,
            height,
            rollback,
            coins,
            spends,
            transactions,
        })
    }

    /// Import a loose transaction into the mempool.
    ///
    /// Outputs become pending coins and inputs that resolve are marked as
    /// spent by a mempool transaction. The confirming block overwrites both.
    /// Returns `false` when the transaction is already stored.
    pub async fn add_mempool_transaction(&self, tx: &Transaction) -> Result<bool, IndexerError> {
        let txid = tx.txid().map_err(ledger)?;
        let _writer = self.writer.lock().await;
        if self.store.get_transaction(&txid)?.is_some() {
            return Ok(false);
        }
        let placement = Placement {
            height: None,
            hash: None,
            time: 0,
            time_normalized: 0,
        };
        let staged = self.stage(std::slice::from_ref(tx), placement, true)?;
        self.commit(staged.coins, |store, chunk| store.mint_coins(chunk))
            .await?;
        let spends = self
            .commit(staged.spends, |store, chunk| store.spend_coins(chunk))
            .await?;
        self.commit(staged.transactions, |store, chunk| store.upsert_transactions(chunk))
            .await?;
        debug!(chain = %self.chain, %txid, spends = spends.written, "mempool transaction imported");
        Ok(true)
    }

    /// Build the records for `txs` without writing anything.
    fn stage(
        &self,
        txs: &[Transaction],
        placement: Placement,
        tag_inline: bool,
    ) -> Result<Staged, IndexerError> {
        let mut staged = Staged::default();
        let mut minted: HashMap<OutPoint, usize> = HashMap::new();
        let mut address_wallets: HashMap<String, BTreeSet<WalletId>> = HashMap::new();
        let confirmed = placement.height.is_some();

        // Mint pass.
        for tx in txs {
            let txid = tx.txid().map_err(ledger)?;
            let mut wallets = BTreeSet::new();
            for (index, output) in tx.outputs.iter().enumerate() {
                let coin_wallets = match (&output.address, tag_inline) {
                    (Some(address), true) => match address_wallets.get(address) {
                        Some(w) => w.clone(),
                        None => {
                            let w = self.store.wallets_for_address(address)?;
                            address_wallets.insert(address.clone(), w.clone());
                            w
                        }
                    },
                    _ => BTreeSet::new(),
                };
                wallets.extend(coin_wallets.iter().copied());
                let coin = CoinRecord {
                    mint_txid: txid,
                    mint_index: index as u64,
                    mint_height: placement.height,
                    coinbase: tx.is_coinbase(),
                    value: output.value,
                    address: output.address.clone(),
                    script: output.script.clone(),
                    spent_txid: None,
                    spent_height: if confirmed {
                        SpentHeight::Unspent
                    } else {
                        SpentHeight::Pending
                    },
                    wallets: coin_wallets,
                };
                minted.insert(coin.outpoint(), staged.coins.len());
                staged.coins.push(coin);
            }

            staged.transactions.push(TransactionRecord {
                txid,
                block_height: placement.height,
                block_hash: placement.hash,
                block_time: placement.time,
                block_time_normalized: placement.time_normalized,
                coinbase: tx.is_coinbase(),
                size: tx.size().map_err(ledger)?,
                locktime: tx.lock_time,
                input_count: tx.inputs.len() as u64,
                output_count: tx.outputs.len() as u64,
                value: tx.total_output_value().map_err(ledger)?,
                wallets,
            });
        }

        // Spend pass.
        for (position, tx) in txs.iter().enumerate() {
            if tx.is_coinbase() {
                continue;
            }
            let txid = staged.transactions[position].txid;
            for input in &tx.inputs {
                let outpoint = input.previous_output;
                if outpoint.is_null() {
                    continue;
                }
                let spent_wallets = match minted.get(&outpoint) {
                    Some(&i) => Some(staged.coins[i].wallets.clone()),
                    None => self.store.get_coin(&outpoint)?.map(|c| c.wallets),
                };
                let Some(spent_wallets) = spent_wallets else {
                    if confirmed {
                        return Err(LedgerError::MissingUtxo(outpoint).into());
                    }
                    continue;
                };
                if tag_inline {
                    staged.transactions[position]
                        .wallets
                        .extend(spent_wallets.iter().copied());
                }
                staged.spends.push(SpendOp {
                    outpoint,
                    spent_txid: txid,
                    spent_height: placement.height,
                    prune_script: self.config.prune_spent_scripts,
                });
            }
        }

        Ok(staged)
    }

    /// Write `items` in chunks with bounded concurrency.
    async fn commit<T, F>(&self, items: Vec<T>, write: F) -> Result<WriteOutcome, IndexerError>
    where
        T: Send + 'static,
        F: Fn(&dyn LedgerStore, &[T]) -> Result<WriteOutcome, LedgerError>
            + Copy
            + Send
            + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_ops.max(1)));
        let batch_size = self.config.batch_size.max(1);
        let mut tasks = JoinSet::new();
        let mut items = items.into_iter().peekable();

        while items.peek().is_some() {
            let chunk: Vec<T> = items.by_ref().take(batch_size).collect();
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| IndexerError::State(e.to_string()))?;
            let store = Arc::clone(&self.store);
            tasks.spawn_blocking(move || {
                let _permit = permit;
                write(store.as_ref(), &chunk)
            });
        }

        let mut outcome = WriteOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            let written =
                joined.map_err(|e| IndexerError::State(format!("storage task failed: {e}")))??;
            outcome.merge(written);
        }
        Ok(outcome)
    }

    async fn tag_with_pool(
        &self,
        pool: &Arc<WorkerPool>,
        txids: Vec<Hash256>,
    ) -> Result<(), IndexerError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_ops.max(1)));
        let mut tasks = JoinSet::new();
        for txid in txids {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| IndexerError::State(e.to_string()))?;
            let pool = Arc::clone(pool);
            tasks.spawn(async move {
                let _permit = permit;
                pool.send_task(TAG_WALLETS_TASK, json!({ "txid": txid.to_string() }))
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| IndexerError::State(format!("tagging task failed: {e}")))??;
        }
        Ok(())
    }
}

/// Handler for [`TAG_WALLETS_TASK`].
///
/// Tags each coin the transaction mints with the wallets registered for its
/// address, then sets the transaction's wallets to the union over its minted
/// and spent coins.
pub struct TagWalletsTask {
    store: Arc<dyn LedgerStore>,
}

impl TagWalletsTask {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    fn wallets_of(&self, coin: &CoinRecord) -> Result<BTreeSet<WalletId>, LedgerError> {
        let mut wallets = coin.wallets.clone();
        if let Some(address) = &coin.address {
            wallets.extend(self.store.wallets_for_address(address)?);
        }
        Ok(wallets)
    }

    fn tag(&self, txid: &Hash256) -> Result<(), LedgerError> {
        let mut tx_wallets = BTreeSet::new();
        for coin in self.store.coins_minted_by(txid)? {
            let wallets = self.wallets_of(&coin)?;
            if wallets != coin.wallets {
                self.store.tag_coin_wallets(&coin.outpoint(), &wallets)?;
            }
            tx_wallets.extend(wallets);
        }
        for coin in self.store.coins_spent_by(txid)? {
            tx_wallets.extend(self.wallets_of(&coin)?);
        }
        self.store.set_transaction_wallets(txid, &tx_wallets)
    }
}

impl TaskHandler for TagWalletsTask {
    fn handle(&self, argument: serde_json::Value) -> Result<(), String> {
        let txid = argument
            .get("txid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing txid".to_string())?;
        let txid = Hash256::from_hex(txid).map_err(|e| format!("invalid txid: {e}"))?;
        self.tag(&txid).map_err(|e| e.to_string())
    }
}

/// Registry with the tasks block ingestion dispatches.
pub fn ingest_tasks(store: Arc<dyn LedgerStore>) -> TaskRegistry {
    TaskRegistry::new().register(TAG_WALLETS_TASK, Arc::new(TagWalletsTask::new(store)))
}

/// Log what a cleanup rollback removed.
pub(crate) fn log_rollback(chain: &ChainNetwork, from_height: u64, summary: &RollbackSummary) {
    if summary.is_empty() {
        return;
    }
    info!(
        %chain,
        from_height,
        blocks = summary.blocks_removed,
        transactions = summary.transactions_removed,
        coins = summary.coins_removed,
        unspent = summary.coins_unspent,
        "removed rows above processed tip"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tally_core::memory::MemoryLedgerStore;
    use tally_core::types::{BlockHeader, TxInput, TxOutput};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn coinbase(value: u64, address: &str, height: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: height.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value,
                script: vec![0x51],
                address: Some(address.to_string()),
            }],
            lock_time: height,
        }
    }

    fn spend_tx(inputs: &[OutPoint], value: u64, address: &str) -> Transaction {
        Transaction {
            version: 1,
            inputs: inputs
                .iter()
                .map(|op| TxInput {
                    previous_output: *op,
                    script_sig: vec![],
                    sequence: u32::MAX,
                })
                .collect(),
            outputs: vec![TxOutput {
                value,
                script: vec![0x52],
                address: Some(address.to_string()),
            }],
            lock_time: 0,
        }
    }

    fn block(prev_hash: Hash256, time: u64, txs: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: Hash256::ZERO,
                time,
                bits: 0,
                nonce: time,
            },
            transactions: txs,
        }
    }

    fn outpoint(tx: &Transaction, index: u64) -> OutPoint {
        OutPoint {
            txid: tx.txid().unwrap(),
            index,
        }
    }

    fn ingester() -> (BlockIngester, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let ingester = BlockIngester::new(
            store.clone(),
            IngestConfig {
                batch_size: 2,
                max_concurrent_ops: 2,
                ..IngestConfig::default()
            },
            ChainNetwork::new("TALLY", "regtest"),
        );
        (ingester, store)
    }

    // ------------------------------------------------------------------
    // Headers and heights
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn genesis_gets_configured_height() {
        let (ingester, store) = ingester();
        let genesis = block(Hash256::ZERO, 100, vec![coinbase(50, "a", 1)]);
        let report = ingester.add_block(&genesis).await.unwrap();
        assert_eq!(report.height, 1);
        let tip = store.local_tip().unwrap().unwrap();
        assert_eq!(tip.hash, genesis.hash());
        assert!(tip.processed);
        assert_eq!(tip.reward, 50);
        assert_eq!(tip.transaction_count, 1);
    }

    #[tokio::test]
    async fn orphan_block_is_rejected() {
        let (ingester, store) = ingester();
        let orphan = block(Hash256([7; 32]), 100, vec![coinbase(50, "a", 1)]);
        let err = ingester.add_block(&orphan).await.unwrap_err();
        assert_eq!(
            err,
            IndexerError::OrphanBlock {
                hash: orphan.hash(),
                prev_hash: Hash256([7; 32]),
            }
        );
        assert!(store.local_tip().unwrap().is_none());
    }

    #[tokio::test]
    async fn configured_genesis_hash_is_required() {
        let store = Arc::new(MemoryLedgerStore::new());
        let genesis = block(Hash256::ZERO, 100, vec![coinbase(50, "a", 1)]);
        let ingester = BlockIngester::new(
            store,
            IngestConfig {
                genesis_hash: Some(Hash256([1; 32])),
                genesis_height: 0,
                ..IngestConfig::default()
            },
            ChainNetwork::new("TALLY", "regtest"),
        );
        assert!(matches!(
            ingester.add_block(&genesis).await,
            Err(IndexerError::OrphanBlock { .. })
        ));
    }

    #[tokio::test]
    async fn normalized_time_increases() {
        let (ingester, store) = ingester();
        let g = block(Hash256::ZERO, 100, vec![coinbase(50, "a", 1)]);
        let b2 = block(g.hash(), 90, vec![coinbase(50, "a", 2)]);
        ingester.add_block(&g).await.unwrap();
        ingester.add_block(&b2).await.unwrap();
        let rec = store.get_block(&b2.hash()).unwrap().unwrap();
        assert_eq!(rec.time, 90);
        assert_eq!(rec.time_normalized, 101);
        let parent = store.get_block(&g.hash()).unwrap().unwrap();
        assert_eq!(parent.next_block_hash, Some(b2.hash()));
    }

    // ------------------------------------------------------------------
    // Mints and spends
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn spend_within_same_block() {
        let (ingester, store) = ingester();
        let cb = coinbase(50, "a", 1);
        let child = spend_tx(&[outpoint(&cb, 0)], 40, "b");
        let g = block(Hash256::ZERO, 100, vec![cb.clone(), child.clone()]);
        ingester.add_block(&g).await.unwrap();

        let spent = store.get_coin(&outpoint(&cb, 0)).unwrap().unwrap();
        assert_eq!(spent.spent_txid, Some(child.txid().unwrap()));
        assert_eq!(spent.spent_height, SpentHeight::Spent(1));
        assert!(store.get_coin(&outpoint(&child, 0)).unwrap().unwrap().is_unspent());
    }

    #[tokio::test]
    async fn missing_utxo_is_fatal() {
        let (ingester, store) = ingester();
        let ghost = OutPoint {
            txid: Hash256([9; 32]),
            index: 0,
        };
        let g = block(
            Hash256::ZERO,
            100,
            vec![coinbase(50, "a", 1), spend_tx(&[ghost], 1, "b")],
        );
        let err = ingester.add_block(&g).await.unwrap_err();
        assert_eq!(err, IndexerError::Ledger(LedgerError::MissingUtxo(ghost)));
        assert!(store.local_tip().unwrap().is_none());
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let (ingester, store) = ingester();
        let g = block(Hash256::ZERO, 100, vec![coinbase(50, "a", 1)]);
        ingester.add_block(&g).await.unwrap();
        let again = ingester.add_block(&g).await.unwrap();
        assert!(again.rollback.is_none());
        assert_eq!(again.coins.duplicates, 1);
        assert_eq!(again.transactions.duplicates, 1);
        assert_eq!(store.coin_count(), 1);
    }

    #[tokio::test]
    async fn inline_tagging_unions_wallets() {
        let (ingester, store) = ingester();
        store.register_wallet_address(WalletId(1), "a").unwrap();
        store.register_wallet_address(WalletId(2), "b").unwrap();

        let cb = coinbase(50, "a", 1);
        let g = block(Hash256::ZERO, 100, vec![cb.clone()]);
        let pay = spend_tx(&[outpoint(&cb, 0)], 50, "b");
        let b2 = block(g.hash(), 200, vec![coinbase(50, "c", 2), pay.clone()]);
        ingester.add_block(&g).await.unwrap();
        ingester.add_block(&b2).await.unwrap();

        let tx = store.get_transaction(&pay.txid().unwrap()).unwrap().unwrap();
        assert_eq!(tx.wallets, BTreeSet::from([WalletId(1), WalletId(2)]));
        assert_eq!(store.coins_by_wallet(WalletId(2)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pool_tagging_matches_inline() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.register_wallet_address(WalletId(1), "a").unwrap();
        store.register_wallet_address(WalletId(2), "b").unwrap();
        let pool = Arc::new(WorkerPool::start(
            2,
            ingest_tasks(store.clone()),
            Duration::from_millis(10),
        ));
        let ingester = BlockIngester::new(
            store.clone(),
            IngestConfig::default(),
            ChainNetwork::new("TALLY", "regtest"),
        )
        .with_pool(pool);

        let cb = coinbase(50, "a", 1);
        let g = block(Hash256::ZERO, 100, vec![cb.clone()]);
        let pay = spend_tx(&[outpoint(&cb, 0)], 50, "b");
        let b2 = block(g.hash(), 200, vec![coinbase(50, "c", 2), pay.clone()]);
        ingester.add_block(&g).await.unwrap();
        ingester.add_block(&b2).await.unwrap();

        let tx = store.get_transaction(&pay.txid().unwrap()).unwrap().unwrap();
        assert_eq!(tx.wallets, BTreeSet::from([WalletId(1), WalletId(2)]));
        assert_eq!(store.coins_by_wallet(WalletId(1)).unwrap().len(), 1);
        assert_eq!(store.coins_by_wallet(WalletId(2)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_spent_scripts() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ingester = BlockIngester::new(
            store.clone(),
            IngestConfig {
                prune_spent_scripts: true,
                ..IngestConfig::default()
            },
            ChainNetwork::new("TALLY", "regtest"),
        );
        let cb = coinbase(50, "a", 1);
        let g = block(Hash256::ZERO, 100, vec![cb.clone()]);
        let b2 = block(
            g.hash(),
            200,
            vec![coinbase(50, "a", 2), spend_tx(&[outpoint(&cb, 0)], 50, "b")],
        );
        ingester.add_block(&g).await.unwrap();
        ingester.add_block(&b2).await.unwrap();
        assert!(store.get_coin(&outpoint(&cb, 0)).unwrap().unwrap().script.is_empty());
    }

    // ------------------------------------------------------------------
    // Reorg
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn competing_block_rolls_back_tip() {
        let (ingester, store) = ingester();
        let g = block(Hash256::ZERO, 100, vec![coinbase(50, "a", 1)]);
        let a = block(g.hash(), 200, vec![coinbase(50, "a", 2)]);
        let b = block(a.hash(), 300, vec![coinbase(50, "a", 3)]);
        let b_alt = block(a.hash(), 301, vec![coinbase(60, "z", 3)]);
        for blk in [&g, &a, &b] {
            ingester.add_block(blk).await.unwrap();
        }

        let report = ingester.add_block(&b_alt).await.unwrap();
        assert_eq!(report.height, 3);
        let rollback = report.rollback.unwrap();
        assert_eq!(rollback.blocks_removed, 1);
        assert_eq!(rollback.coins_removed, 1);

        assert!(store.get_block(&b.hash()).unwrap().is_none());
        assert_eq!(store.local_tip().unwrap().unwrap().hash, b_alt.hash());
        assert_eq!(
            store.get_block(&a.hash()).unwrap().unwrap().next_block_hash,
            Some(b_alt.hash())
        );
        let total: u64 = store.unspent_coins().unwrap().iter().map(|c| c.value).sum();
        assert_eq!(total, 160);
    }

    // ------------------------------------------------------------------
    // Mempool
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn mempool_tx_mints_pending_coins() {
        let (ingester, store) = ingester();
        let cb = coinbase(50, "a", 1);
        ingester
            .add_block(&block(Hash256::ZERO, 100, vec![cb.clone()]))
            .await
            .unwrap();

        let loose = spend_tx(&[outpoint(&cb, 0)], 45, "b");
        assert!(ingester.add_mempool_transaction(&loose).await.unwrap());
        assert!(!ingester.add_mempool_transaction(&loose).await.unwrap());

        let pending = store.get_coin(&outpoint(&loose, 0)).unwrap().unwrap();
        assert_eq!(pending.spent_height, SpentHeight::Pending);
        assert_eq!(pending.mint_height, None);
        // The input keeps its confirmed state but records the mempool spender.
        let input = store.get_coin(&outpoint(&cb, 0)).unwrap().unwrap();
        assert_eq!(input.spent_height, SpentHeight::Unspent);
        assert_eq!(input.pending_spender(), Some(loose.txid().unwrap()));
        let record = store.get_transaction(&loose.txid().unwrap()).unwrap().unwrap();
        assert_eq!(record.block_height, None);
    }

    #[tokio::test]
    async fn confirmation_promotes_mempool_coins() {
        let (ingester, store) = ingester();
        let cb = coinbase(50, "a", 1);
        let g = block(Hash256::ZERO, 100, vec![cb.clone()]);
        ingester.add_block(&g).await.unwrap();
        let loose = spend_tx(&[outpoint(&cb, 0)], 45, "b");
        ingester.add_mempool_transaction(&loose).await.unwrap();

        let b2 = block(g.hash(), 200, vec![coinbase(50, "a", 2), loose.clone()]);
        ingester.add_block(&b2).await.unwrap();

        let coin = store.get_coin(&outpoint(&loose, 0)).unwrap().unwrap();
        assert_eq!(coin.spent_height, SpentHeight::Unspent);
        assert_eq!(coin.mint_height, Some(2));
        let spent = store.get_coin(&outpoint(&cb, 0)).unwrap().unwrap();
        assert_eq!(spent.spent_height, SpentHeight::Spent(2));
        let record = store.get_transaction(&loose.txid().unwrap()).unwrap().unwrap();
        assert_eq!(record.block_height, Some(2));
    }

    #[tokio::test]
    async fn mempool_spend_is_not_double_counted() {
        use tally_core::records::WalletBalance;

        let (ingester, store) = ingester();
        store.register_wallet_address(WalletId(1), "a").unwrap();
        let cb = coinbase(50, "a", 1);
        let g = block(Hash256::ZERO, 100, vec![cb.clone()]);
        ingester.add_block(&g).await.unwrap();
        let balance = |confirmed, unconfirmed| WalletBalance {
            confirmed,
            unconfirmed,
            balance: confirmed + unconfirmed,
        };
        assert_eq!(store.wallet_balance(WalletId(1)).unwrap(), balance(50, 0));

        let to_self = spend_tx(&[outpoint(&cb, 0)], 45, "a");
        ingester.add_mempool_transaction(&to_self).await.unwrap();
        assert_eq!(store.wallet_balance(WalletId(1)).unwrap(), balance(0, 45));
        assert_eq!(store.address_balance("a").unwrap(), balance(0, 45));

        let b2 = block(g.hash(), 200, vec![coinbase(50, "z", 2), to_self.clone()]);
        ingester.add_block(&b2).await.unwrap();
        assert_eq!(store.wallet_balance(WalletId(1)).unwrap(), balance(45, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mempool_import_racing_its_block_keeps_confirmation() {
        for round in 0..50 {
            let (ingester, store) = ingester();
            let ingester = Arc::new(ingester);
            let cb = coinbase(50, "a", 1);
            let g = block(Hash256::ZERO, 100, vec![cb.clone()]);
            ingester.add_block(&g).await.unwrap();
            let loose = spend_tx(&[outpoint(&cb, 0)], 45, "b");
            let b2 = block(g.hash(), 200, vec![coinbase(50, "a", 2), loose.clone()]);

            let confirm = tokio::spawn({
                let ingester = Arc::clone(&ingester);
                async move { ingester.add_block(&b2).await }
            });
            let import = tokio::spawn({
                let ingester = Arc::clone(&ingester);
                let loose = loose.clone();
                async move { ingester.add_mempool_transaction(&loose).await }
            });
            confirm.await.unwrap().unwrap();
            import.await.unwrap().unwrap();

            let record = store.get_transaction(&loose.txid().unwrap()).unwrap().unwrap();
            assert_eq!(record.block_height, Some(2), "round {round}");
            assert_eq!(store.transactions_at_height(2).unwrap().len(), 2, "round {round}");
            let minted = store.get_coin(&outpoint(&loose, 0)).unwrap().unwrap();
            assert_eq!(minted.spent_height, SpentHeight::Unspent, "round {round}");
            assert_eq!(minted.mint_height, Some(2), "round {round}");
            let spent = store.get_coin(&outpoint(&cb, 0)).unwrap().unwrap();
            assert_eq!(spent.spent_height, SpentHeight::Spent(2), "round {round}");
        }
    }
}
