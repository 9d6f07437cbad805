//! In-memory [`LedgerStore`] for tests.
//!
//! Everything lives in maps behind one `RwLock`. No persistence, and every
//! secondary query is a full scan.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::LedgerError;
use crate::ledger::{LedgerStore, RollbackSummary, WalletAddressIndex, WriteOutcome};
use crate::records::{
    BlockRecord, CoinRecord, SpendChange, SpendOp, SpentHeight, TransactionRecord, WalletId,
};
use crate::types::{Hash256, OutPoint};

#[derive(Default)]
struct Inner {
    blocks: HashMap<Hash256, BlockRecord>,
    heights: BTreeMap<u64, Hash256>,
    transactions: HashMap<Hash256, TransactionRecord>,
    coins: BTreeMap<OutPoint, CoinRecord>,
    wallet_addresses: HashMap<String, BTreeSet<WalletId>>,
}

/// In-memory ledger storage.
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: RwLock<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored coins, spent or not.
    pub fn coin_count(&self) -> usize {
        self.inner.read().coins.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.read().transactions.len()
    }
}

impl WalletAddressIndex for MemoryLedgerStore {
    fn wallets_for_address(&self, address: &str) -> Result<BTreeSet<WalletId>, LedgerError> {
        Ok(self
            .inner
            .read()
            .wallet_addresses
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn local_tip(&self) -> Result<Option<BlockRecord>, LedgerError> {
        let inner = self.inner.read();
        Ok(inner
            .heights
            .values()
            .rev()
            .filter_map(|hash| inner.blocks.get(hash))
            .find(|b| b.processed)
            .cloned())
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<BlockRecord>, LedgerError> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn block_at_height(&self, height: u64) -> Result<Option<BlockRecord>, LedgerError> {
        let inner = self.inner.read();
        Ok(inner
            .heights
            .get(&height)
            .and_then(|hash| inner.blocks.get(hash))
            .cloned())
    }

    fn locator_hashes(&self, max: usize) -> Result<Vec<Hash256>, LedgerError> {
        let inner = self.inner.read();
        let hashes: Vec<Hash256> = inner
            .heights
            .values()
            .rev()
            .filter(|hash| inner.blocks.get(*hash).is_some_and(|b| b.processed))
            .take(max)
            .copied()
            .collect();
        if hashes.len() < 2 {
            return Ok(vec![Hash256::ZERO]);
        }
        Ok(hashes)
    }

    fn upsert_block(&self, block: &BlockRecord) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        inner.heights.insert(block.height, block.hash);
        inner.blocks.insert(block.hash, block.clone());
        Ok(())
    }

    fn set_next_block_hash(
        &self,
        hash: &Hash256,
        next: Option<Hash256>,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        let block = inner
            .blocks
            .get_mut(hash)
            .ok_or(LedgerError::BlockNotFound(*hash))?;
        block.next_block_hash = next;
        Ok(())
    }

    fn mark_processed(&self, hash: &Hash256) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        let block = inner
            .blocks
            .get_mut(hash)
            .ok_or(LedgerError::BlockNotFound(*hash))?;
        block.processed = true;
        Ok(())
    }

    fn upsert_transactions(
        &self,
        txs: &[TransactionRecord],
    ) -> Result<WriteOutcome, LedgerError> {
        let mut inner = self.inner.write();
        let mut outcome = WriteOutcome::default();
        for tx in txs {
            match inner.transactions.get(&tx.txid) {
                Some(existing) if !tx.replaces(existing) => outcome.duplicates += 1,
                _ => {
                    inner.transactions.insert(tx.txid, tx.clone());
                    outcome.written += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn get_transaction(&self, txid: &Hash256) -> Result<Option<TransactionRecord>, LedgerError> {
        Ok(self.inner.read().transactions.get(txid).cloned())
    }

    fn set_transaction_wallets(
        &self,
        txid: &Hash256,
        wallets: &BTreeSet<WalletId>,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        let tx = inner
            .transactions
            .get_mut(txid)
            .ok_or(LedgerError::TransactionNotFound(*txid))?;
        tx.wallets = wallets.clone();
        Ok(())
    }

    fn transactions_at_height(&self, height: u64) -> Result<Vec<TransactionRecord>, LedgerError> {
        let inner = self.inner.read();
        let mut txs: Vec<_> = inner
            .transactions
            .values()
            .filter(|tx| tx.block_height == Some(height))
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.txid);
        Ok(txs)
    }

    fn mint_coins(&self, coins: &[CoinRecord]) -> Result<WriteOutcome, LedgerError> {
        let mut inner = self.inner.write();
        let mut outcome = WriteOutcome::default();
        for coin in coins {
            let write = match inner.coins.get(&coin.outpoint()) {
                None => Some(coin.clone()),
                Some(existing) => existing.merge_mint(coin),
            };
            match write {
                Some(record) => {
                    inner.coins.insert(record.outpoint(), record);
                    outcome.written += 1;
                }
                None => outcome.duplicates += 1,
            }
        }
        Ok(outcome)
    }

    fn spend_coins(&self, spends: &[SpendOp]) -> Result<WriteOutcome, LedgerError> {
        let mut inner = self.inner.write();
        if let Some(missing) = spends.iter().find(|op| !inner.coins.contains_key(&op.outpoint)) {
            return Err(LedgerError::MissingUtxo(missing.outpoint));
        }
        let mut outcome = WriteOutcome::default();
        for op in spends {
            let Some(coin) = inner.coins.get_mut(&op.outpoint) else {
                continue;
            };
            match coin.apply_spend(op) {
                SpendChange::Unchanged => outcome.duplicates += 1,
                SpendChange::Applied => outcome.written += 1,
                SpendChange::Replaced(previous) => {
                    warn!(
                        outpoint = %op.outpoint,
                        %previous,
                        spender = %op.spent_txid,
                        "coin spent by a different transaction, overwriting"
                    );
                    outcome.written += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<CoinRecord>, LedgerError> {
        Ok(self.inner.read().coins.get(outpoint).cloned())
    }

    fn coins_minted_by(&self, txid: &Hash256) -> Result<Vec<CoinRecord>, LedgerError> {
        Ok(self
            .inner
            .read()
            .coins
            .values()
            .filter(|c| c.mint_txid == *txid)
            .cloned()
            .collect())
    }

    fn coins_spent_by(&self, txid: &Hash256) -> Result<Vec<CoinRecord>, LedgerError> {
        Ok(self
            .inner
            .read()
            .coins
            .values()
            .filter(|c| c.spent_txid == Some(*txid))
            .cloned()
            .collect())
    }

    fn unspent_coins(&self) -> Result<Vec<CoinRecord>, LedgerError> {
        Ok(self
            .inner
            .read()
            .coins
            .values()
            .filter(|c| c.is_unspent())
            .cloned()
            .collect())
    }

    fn coins_by_address(&self, address: &str) -> Result<Vec<CoinRecord>, LedgerError> {
        Ok(self
            .inner
            .read()
            .coins
            .values()
            .filter(|c| c.address.as_deref() == Some(address))
            .cloned()
            .collect())
    }

    fn coins_by_wallet(&self, wallet: WalletId) -> Result<Vec<CoinRecord>, LedgerError> {
        Ok(self
            .inner
            .read()
            .coins
            .values()
            .filter(|c| c.wallets.contains(&wallet))
            .cloned()
            .collect())
    }

    fn tag_coin_wallets(
        &self,
        outpoint: &OutPoint,
        wallets: &BTreeSet<WalletId>,
    ) -> Result<bool, LedgerError> {
        let mut inner = self.inner.write();
        let coin = inner
            .coins
            .get_mut(outpoint)
            .ok_or(LedgerError::MissingUtxo(*outpoint))?;
        let before = coin.wallets.len();
        coin.wallets.extend(wallets.iter().copied());
        Ok(coin.wallets.len() != before)
    }

    fn register_wallet_address(
        &self,
        wallet: WalletId,
        address: &str,
    ) -> Result<usize, LedgerError> {
        let mut inner = self.inner.write();
        inner
            .wallet_addresses
            .entry(address.to_string())
            .or_default()
            .insert(wallet);
        let mut tagged = 0;
        for coin in inner.coins.values_mut() {
            if coin.address.as_deref() == Some(address) && coin.wallets.insert(wallet) {
                tagged += 1;
            }
        }
        Ok(tagged)
    }

    fn rollback(&self, from_height: u64) -> Result<RollbackSummary, LedgerError> {
        let mut inner = self.inner.write();
        let mut summary = RollbackSummary::default();

        let doomed: Vec<u64> = inner.heights.range(from_height..).map(|(h, _)| *h).collect();
        for height in doomed {
            if let Some(hash) = inner.heights.remove(&height) {
                inner.blocks.remove(&hash);
                summary.blocks_removed += 1;
            }
        }

        let before = inner.transactions.len();
        inner
            .transactions
            .retain(|_, tx| tx.block_height.is_none_or(|h| h < from_height));
        summary.transactions_removed = before - inner.transactions.len();

        let before = inner.coins.len();
        inner
            .coins
            .retain(|_, c| c.mint_height.is_none_or(|h| h < from_height));
        summary.coins_removed = before - inner.coins.len();

        for coin in inner.coins.values_mut() {
            if let SpentHeight::Spent(h) = coin.spent_height {
                if h >= from_height {
                    coin.clear_spend();
                    summary.coins_unspent += 1;
                }
            }
        }

        if let Some(below) = from_height.checked_sub(1) {
            if let Some(hash) = inner.heights.get(&below).copied() {
                if let Some(block) = inner.blocks.get_mut(&hash) {
                    block.next_block_hash = None;
                }
            }
        }

        Ok(summary)
    }
}
