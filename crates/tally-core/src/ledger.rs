//! Ledger store interface.
//!
//! Provides the [`LedgerStore`] trait consumed by the block ingester and the
//! sync coordinator. The production indexer uses RocksDB (tally-indexer);
//! [`MemoryLedgerStore`](crate::memory::MemoryLedgerStore) is for tests.
//!
//! All methods take `&self`: implementations serialize their own
//! read-modify-write sections so callers can share a store across tasks.
//! Writes that touch a unique key (block hash, coin outpoint, txid) are
//! insert-or-update primitives; replaying them is harmless.

use std::collections::BTreeSet;

use crate::error::LedgerError;
use crate::records::{
    BlockRecord, CoinRecord, SpendOp, TransactionRecord, WalletBalance, WalletId,
};
use crate::types::{Hash256, OutPoint};

/// Outcome of a bulk write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Records inserted or changed.
    pub written: usize,
    /// Records that were already present and left as they were.
    pub duplicates: usize,
}

impl WriteOutcome {
    pub fn merge(&mut self, other: WriteOutcome) {
        self.written += other.written;
        self.duplicates += other.duplicates;
    }
}

/// What a rollback removed or restored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub blocks_removed: usize,
    pub transactions_removed: usize,
    pub coins_removed: usize,
    /// Coins whose spend was undone.
    pub coins_unspent: usize,
}

impl RollbackSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Address to wallet lookup used while minting coins.
pub trait WalletAddressIndex: Send + Sync {
    /// Wallets that registered `address`. Empty when none did.
    fn wallets_for_address(&self, address: &str) -> Result<BTreeSet<WalletId>, LedgerError>;
}

/// Persistent block, transaction, and coin collections for one chain/network.
pub trait LedgerStore: WalletAddressIndex {
    // --- Blocks ---

    /// Highest block with `processed == true`, if any.
    fn local_tip(&self) -> Result<Option<BlockRecord>, LedgerError>;

    fn get_block(&self, hash: &Hash256) -> Result<Option<BlockRecord>, LedgerError>;

    fn block_at_height(&self, height: u64) -> Result<Option<BlockRecord>, LedgerError>;

    /// Up to `max` processed block hashes, highest first.
    ///
    /// Returns `[Hash256::ZERO]` when fewer than two processed blocks exist,
    /// which asks a peer for headers from the start of its chain.
    fn locator_hashes(&self, max: usize) -> Result<Vec<Hash256>, LedgerError>;

    /// Insert or replace the block keyed by its hash.
    fn upsert_block(&self, block: &BlockRecord) -> Result<(), LedgerError>;

    fn set_next_block_hash(
        &self,
        hash: &Hash256,
        next: Option<Hash256>,
    ) -> Result<(), LedgerError>;

    /// # Errors
    ///
    /// - [`LedgerError::BlockNotFound`] if no block has this hash
    fn mark_processed(&self, hash: &Hash256) -> Result<(), LedgerError>;

    // --- Transactions ---

    fn upsert_transactions(
        &self,
        txs: &[TransactionRecord],
    ) -> Result<WriteOutcome, LedgerError>;

    fn get_transaction(&self, txid: &Hash256) -> Result<Option<TransactionRecord>, LedgerError>;

    /// Replace the wallet set of a stored transaction.
    fn set_transaction_wallets(
        &self,
        txid: &Hash256,
        wallets: &BTreeSet<WalletId>,
    ) -> Result<(), LedgerError>;

    fn transactions_at_height(&self, height: u64) -> Result<Vec<TransactionRecord>, LedgerError>;

    // --- Coins ---

    /// Insert coins, tolerating ones that already exist.
    ///
    /// An existing spent coin is never touched. An existing pending coin is
    /// promoted when the incoming record is confirmed. Anything else counts
    /// as a duplicate.
    fn mint_coins(&self, coins: &[CoinRecord]) -> Result<WriteOutcome, LedgerError>;

    /// Apply spends to existing coins.
    ///
    /// Re-applying a spend by the same transaction is a duplicate.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MissingUtxo`] if a referenced coin does not exist
    fn spend_coins(&self, spends: &[SpendOp]) -> Result<WriteOutcome, LedgerError>;

    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<CoinRecord>, LedgerError>;

    fn coins_minted_by(&self, txid: &Hash256) -> Result<Vec<CoinRecord>, LedgerError>;

    fn coins_spent_by(&self, txid: &Hash256) -> Result<Vec<CoinRecord>, LedgerError>;

    /// All coins whose spent state is pending or unspent.
    fn unspent_coins(&self) -> Result<Vec<CoinRecord>, LedgerError>;

    fn coins_by_address(&self, address: &str) -> Result<Vec<CoinRecord>, LedgerError>;

    fn coins_by_wallet(&self, wallet: WalletId) -> Result<Vec<CoinRecord>, LedgerError>;

    /// Add `wallets` to a stored coin's wallet set. Returns whether it changed.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MissingUtxo`] if the coin does not exist
    fn tag_coin_wallets(
        &self,
        outpoint: &OutPoint,
        wallets: &BTreeSet<WalletId>,
    ) -> Result<bool, LedgerError>;

    fn wallet_balance(&self, wallet: WalletId) -> Result<WalletBalance, LedgerError> {
        Ok(WalletBalance::from_coins(&self.coins_by_wallet(wallet)?))
    }

    fn address_balance(&self, address: &str) -> Result<WalletBalance, LedgerError> {
        Ok(WalletBalance::from_coins(&self.coins_by_address(address)?))
    }

    // --- Wallets ---

    /// Register `address` for `wallet` and tag every coin already paying it.
    ///
    /// Returns the number of coins newly tagged.
    fn register_wallet_address(
        &self,
        wallet: WalletId,
        address: &str,
    ) -> Result<usize, LedgerError>;

    // --- Reorg ---

    /// Remove everything at or above `from_height`.
    ///
    /// Deletes blocks and transactions with `height >= from_height`, coins
    /// minted at or above it, and resets coins spent at or above it to
    /// unspent. Clears `next_block_hash` on the block just below.
    fn rollback(&self, from_height: u64) -> Result<RollbackSummary, LedgerError>;

    /// Drop rows left above the processed tip by an interrupted ingestion.
    fn remove_above_tip(&self) -> Result<RollbackSummary, LedgerError> {
        let from = match self.local_tip()? {
            Some(tip) => tip.height + 1,
            None => 0,
        };
        self.rollback(from)
    }
}
