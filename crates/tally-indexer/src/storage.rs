//! RocksDB-backed ledger storage.
//!
//! Implements [`LedgerStore`] using one column family per collection plus
//! secondary index families whose keys carry the indexed value followed by
//! the outpoint or txid, with empty values:
//!
//! | family | key |
//! |--------|-----|
//! | `blocks` | block hash |
//! | `height_index` | height (BE) |
//! | `transactions` | txid |
//! | `tx_height` | height (BE) ‖ txid |
//! | `coins` | txid ‖ index (BE) |
//! | `coin_mint_height` | height (BE) ‖ outpoint |
//! | `coin_spent_height` | height (BE) ‖ outpoint |
//! | `spent_by` | spender txid ‖ outpoint |
//! | `address_index` | blake3(address) ‖ outpoint |
//! | `wallet_index` | wallet id (BE) ‖ outpoint |
//! | `wallet_addresses` | address |
//!
//! Every mutation is a single [`WriteBatch`] built under a write lock, so a
//! record and its index entries always change together and a rollback either
//! lands completely or not at all.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{
    ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, SliceTransform, WriteBatch,
};
use tracing::{debug, info, warn};

use tally_core::error::LedgerError;
use tally_core::ledger::{LedgerStore, RollbackSummary, WalletAddressIndex, WriteOutcome};
use tally_core::records::{
    BlockRecord, CoinRecord, SpendChange, SpendOp, TransactionRecord, WalletId,
};
use tally_core::types::{Hash256, OutPoint};

// --- Column family names ---

const CF_BLOCKS: &str = "blocks";
const CF_HEIGHT_INDEX: &str = "height_index";
const CF_TRANSACTIONS: &str = "transactions";
const CF_TX_HEIGHT: &str = "tx_height";
const CF_COINS: &str = "coins";
const CF_COIN_MINT_HEIGHT: &str = "coin_mint_height";
const CF_COIN_SPENT_HEIGHT: &str = "coin_spent_height";
const CF_SPENT_BY: &str = "spent_by";
const CF_ADDRESS_INDEX: &str = "address_index";
const CF_WALLET_INDEX: &str = "wallet_index";
const CF_WALLET_ADDRESSES: &str = "wallet_addresses";

const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_HEIGHT_INDEX,
    CF_TRANSACTIONS,
    CF_TX_HEIGHT,
    CF_COINS,
    CF_COIN_MINT_HEIGHT,
    CF_COIN_SPENT_HEIGHT,
    CF_SPENT_BY,
    CF_ADDRESS_INDEX,
    CF_WALLET_INDEX,
    CF_WALLET_ADDRESSES,
];

const OUTPOINT_KEY_LEN: usize = 40;

fn storage_err(e: rocksdb::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, LedgerError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| LedgerError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, LedgerError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| LedgerError::Codec(e.to_string()))
}

// --- Key encoding ---

fn outpoint_key(outpoint: &OutPoint) -> [u8; OUTPOINT_KEY_LEN] {
    let mut key = [0u8; OUTPOINT_KEY_LEN];
    key[..32].copy_from_slice(outpoint.txid.as_bytes());
    key[32..].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

fn outpoint_from_key(bytes: &[u8]) -> Result<OutPoint, LedgerError> {
    if bytes.len() != OUTPOINT_KEY_LEN {
        return Err(LedgerError::Codec(format!(
            "outpoint key has {} bytes",
            bytes.len()
        )));
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&bytes[..32]);
    let mut index = [0u8; 8];
    index.copy_from_slice(&bytes[32..]);
    Ok(OutPoint {
        txid: Hash256(txid),
        index: u64::from_be_bytes(index),
    })
}

fn hash_from_bytes(bytes: &[u8]) -> Result<Hash256, LedgerError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| LedgerError::Codec(format!("hash has {} bytes", bytes.len())))?;
    Ok(Hash256(raw))
}

/// `prefix ‖ suffix` as one key.
fn join_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

fn address_prefix(address: &str) -> [u8; 32] {
    *blake3::hash(address.as_bytes()).as_bytes()
}

/// RocksDB-backed ledger storage for one chain/network.
pub struct RocksStore {
    db: DB,
    /// Serializes read-modify-write sections.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a ledger database at `path`.
    ///
    /// Creates missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(path.as_ref())
            .map_err(|e| LedgerError::Storage(format!("failed to create db dir: {e}")))?;
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                match *name {
                    CF_ADDRESS_INDEX | CF_SPENT_BY => {
                        opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(32));
                    }
                    CF_WALLET_INDEX => {
                        opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(8));
                    }
                    _ => {}
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(storage_err)?;
        info!(path = %path.as_ref().display(), "opened ledger database");

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), LedgerError> {
        self.db.flush().map_err(storage_err)
    }

    /// Number of stored coins, spent or not.
    pub fn coin_count(&self) -> Result<usize, LedgerError> {
        let cf = self.cf_handle(CF_COINS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(storage_err)?;
            count += 1;
        }
        Ok(count)
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LedgerError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::Storage(format!("missing column family: {name}")))
    }

    fn get_decoded<T: bincode::Decode<()>>(
        &self,
        cf: &str,
        key: &[u8],
    ) -> Result<Option<T>, LedgerError> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keys of `cf` that start with `prefix`, in key order.
    fn keys_with_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LedgerError> {
        let handle = self.cf_handle(cf)?;
        let mut keys = Vec::new();
        for item in self.db.prefix_iterator_cf(handle, prefix) {
            let (key, _) = item.map_err(storage_err)?;
            // prefix_iterator may overshoot
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Keys of `cf` at or after `start`.
    fn keys_from(&self, cf: &str, start: &[u8]) -> Result<Vec<Vec<u8>>, LedgerError> {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(start, Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(storage_err)?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Outpoints stored after a fixed-width prefix in an index family.
    fn indexed_outpoints(&self, cf: &str, prefix: &[u8]) -> Result<Vec<OutPoint>, LedgerError> {
        self.keys_with_prefix(cf, prefix)?
            .iter()
            .map(|key| outpoint_from_key(&key[prefix.len()..]))
            .collect()
    }

    fn coins_at(&self, outpoints: &[OutPoint]) -> Result<Vec<CoinRecord>, LedgerError> {
        let mut coins = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            match self.get_coin(outpoint)? {
                Some(coin) => coins.push(coin),
                None => warn!(%outpoint, "index entry without coin"),
            }
        }
        Ok(coins)
    }

    // --- Batch staging ---

    /// Stage the replacement of `old` by `new` for one coin, keeping every
    /// index family in step. `new == None` deletes the coin.
    fn stage_coin(
        &self,
        batch: &mut WriteBatch,
        old: Option<&CoinRecord>,
        new: Option<&CoinRecord>,
    ) -> Result<(), LedgerError> {
        let cf_coins = self.cf_handle(CF_COINS)?;
        let cf_mint = self.cf_handle(CF_COIN_MINT_HEIGHT)?;
        let cf_spent = self.cf_handle(CF_COIN_SPENT_HEIGHT)?;
        let cf_spent_by = self.cf_handle(CF_SPENT_BY)?;
        let cf_addr = self.cf_handle(CF_ADDRESS_INDEX)?;
        let cf_wallet = self.cf_handle(CF_WALLET_INDEX)?;

        if let Some(coin) = old {
            let key = outpoint_key(&coin.outpoint());
            batch.delete_cf(cf_coins, key);
            if let Some(h) = coin.mint_height {
                batch.delete_cf(cf_mint, join_key(&h.to_be_bytes(), &key));
            }
            if let Some(h) = coin.spent_height.spent_at() {
                batch.delete_cf(cf_spent, join_key(&h.to_be_bytes(), &key));
            }
            if let Some(spender) = coin.spent_txid {
                batch.delete_cf(cf_spent_by, join_key(spender.as_bytes(), &key));
            }
            if let Some(address) = &coin.address {
                batch.delete_cf(cf_addr, join_key(&address_prefix(address), &key));
            }
            for wallet in &coin.wallets {
                batch.delete_cf(cf_wallet, join_key(&wallet.0.to_be_bytes(), &key));
            }
        }

        if let Some(coin) = new {
            let key = outpoint_key(&coin.outpoint());
            batch.put_cf(cf_coins, key, encode(coin)?);
            if let Some(h) = coin.mint_height {
                batch.put_cf(cf_mint, join_key(&h.to_be_bytes(), &key), []);
            }
            if let Some(h) = coin.spent_height.spent_at() {
                batch.put_cf(cf_spent, join_key(&h.to_be_bytes(), &key), []);
            }
            if let Some(spender) = coin.spent_txid {
                batch.put_cf(cf_spent_by, join_key(spender.as_bytes(), &key), []);
            }
            if let Some(address) = &coin.address {
                batch.put_cf(cf_addr, join_key(&address_prefix(address), &key), []);
            }
            for wallet in &coin.wallets {
                batch.put_cf(cf_wallet, join_key(&wallet.0.to_be_bytes(), &key), []);
            }
        }
        Ok(())
    }

    fn stage_transaction(
        &self,
        batch: &mut WriteBatch,
        old: Option<&TransactionRecord>,
        new: Option<&TransactionRecord>,
    ) -> Result<(), LedgerError> {
        let cf_txs = self.cf_handle(CF_TRANSACTIONS)?;
        let cf_height = self.cf_handle(CF_TX_HEIGHT)?;

        if let Some(tx) = old {
            batch.delete_cf(cf_txs, tx.txid.as_bytes());
            if let Some(h) = tx.block_height {
                batch.delete_cf(cf_height, join_key(&h.to_be_bytes(), tx.txid.as_bytes()));
            }
        }
        if let Some(tx) = new {
            batch.put_cf(cf_txs, tx.txid.as_bytes(), encode(tx)?);
            if let Some(h) = tx.block_height {
                batch.put_cf(cf_height, join_key(&h.to_be_bytes(), tx.txid.as_bytes()), []);
            }
        }
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), LedgerError> {
        self.db.write(batch).map_err(storage_err)
    }

    /// Processed block hashes from the highest height down.
    fn processed_hashes_desc(&self, limit: usize) -> Result<Vec<BlockRecord>, LedgerError> {
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf_height, IteratorMode::End) {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(storage_err)?;
            let hash = hash_from_bytes(&value)?;
            if let Some(block) = self.get_block(&hash)? {
                if block.processed {
                    out.push(block);
                }
            }
        }
        Ok(out)
    }
}

impl WalletAddressIndex for RocksStore {
    fn wallets_for_address(&self, address: &str) -> Result<BTreeSet<WalletId>, LedgerError> {
        Ok(self
            .get_decoded(CF_WALLET_ADDRESSES, address.as_bytes())?
            .unwrap_or_default())
    }
}

impl LedgerStore for RocksStore {
    fn local_tip(&self) -> Result<Option<BlockRecord>, LedgerError> {
        Ok(self.processed_hashes_desc(1)?.into_iter().next())
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<BlockRecord>, LedgerError> {
        self.get_decoded(CF_BLOCKS, hash.as_bytes())
    }

    fn block_at_height(&self, height: u64) -> Result<Option<BlockRecord>, LedgerError> {
        let cf = self.cf_handle(CF_HEIGHT_INDEX)?;
        match self.db.get_cf(cf, height.to_be_bytes()).map_err(storage_err)? {
            Some(bytes) => self.get_block(&hash_from_bytes(&bytes)?),
            None => Ok(None),
        }
    }

    fn locator_hashes(&self, max: usize) -> Result<Vec<Hash256>, LedgerError> {
        let hashes: Vec<Hash256> = self
            .processed_hashes_desc(max)?
            .into_iter()
            .map(|b| b.hash)
            .collect();
        if hashes.len() < 2 {
            return Ok(vec![Hash256::ZERO]);
        }
        Ok(hashes)
    }

    fn upsert_block(&self, block: &BlockRecord) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        let cf_blocks = self.cf_handle(CF_BLOCKS)?;
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let mut batch = WriteBatch::default();

        // A different block indexed at this height is superseded.
        let indexed = self
            .db
            .get_cf(cf_height, block.height.to_be_bytes())
            .map_err(storage_err)?;
        if let Some(existing) = indexed {
            let existing = hash_from_bytes(&existing)?;
            if existing != block.hash {
                debug!(
                    height = block.height,
                    old = %existing,
                    new = %block.hash,
                    "replacing block at height"
                );
                batch.delete_cf(cf_blocks, existing.as_bytes());
            }
        }
        batch.put_cf(cf_blocks, block.hash.as_bytes(), encode(block)?);
        batch.put_cf(cf_height, block.height.to_be_bytes(), block.hash.as_bytes());
        self.write(batch)
    }

    fn set_next_block_hash(
        &self,
        hash: &Hash256,
        next: Option<Hash256>,
    ) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        let mut block = self.get_block(hash)?.ok_or(LedgerError::BlockNotFound(*hash))?;
        block.next_block_hash = next;
        let cf = self.cf_handle(CF_BLOCKS)?;
        self.db
            .put_cf(cf, hash.as_bytes(), encode(&block)?)
            .map_err(storage_err)
    }

    fn mark_processed(&self, hash: &Hash256) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        let mut block = self.get_block(hash)?.ok_or(LedgerError::BlockNotFound(*hash))?;
        block.processed = true;
        let cf = self.cf_handle(CF_BLOCKS)?;
        self.db
            .put_cf(cf, hash.as_bytes(), encode(&block)?)
            .map_err(storage_err)
    }

    fn upsert_transactions(
        &self,
        txs: &[TransactionRecord],
    ) -> Result<WriteOutcome, LedgerError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut outcome = WriteOutcome::default();
        let mut staged: HashMap<Hash256, TransactionRecord> = HashMap::new();

        for tx in txs {
            let existing = match staged.get(&tx.txid) {
                Some(t) => Some(t.clone()),
                None => self.get_transaction(&tx.txid)?,
            };
            if existing.as_ref().is_some_and(|stored| !tx.replaces(stored)) {
                outcome.duplicates += 1;
                continue;
            }
            self.stage_transaction(&mut batch, existing.as_ref(), Some(tx))?;
            staged.insert(tx.txid, tx.clone());
            outcome.written += 1;
        }

        self.write(batch)?;
        Ok(outcome)
    }

    fn get_transaction(&self, txid: &Hash256) -> Result<Option<TransactionRecord>, LedgerError> {
        self.get_decoded(CF_TRANSACTIONS, txid.as_bytes())
    }

    fn set_transaction_wallets(
        &self,
        txid: &Hash256,
        wallets: &BTreeSet<WalletId>,
    ) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        let mut tx = self
            .get_transaction(txid)?
            .ok_or(LedgerError::TransactionNotFound(*txid))?;
        tx.wallets = wallets.clone();
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        self.db
            .put_cf(cf, txid.as_bytes(), encode(&tx)?)
            .map_err(storage_err)
    }

    fn transactions_at_height(&self, height: u64) -> Result<Vec<TransactionRecord>, LedgerError> {
        let mut txs = Vec::new();
        for key in self.keys_with_prefix(CF_TX_HEIGHT, &height.to_be_bytes())? {
            let txid = hash_from_bytes(&key[8..])?;
            if let Some(tx) = self.get_transaction(&txid)? {
                txs.push(tx);
            }
        }
        Ok(txs)
    }

    fn mint_coins(&self, coins: &[CoinRecord]) -> Result<WriteOutcome, LedgerError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut outcome = WriteOutcome::default();
        let mut staged: HashMap<OutPoint, CoinRecord> = HashMap::new();

        for coin in coins {
            let outpoint = coin.outpoint();
            let existing = match staged.get(&outpoint) {
                Some(c) => Some(c.clone()),
                None => self.get_coin(&outpoint)?,
            };
            let write = match &existing {
                None => Some(coin.clone()),
                Some(stored) => stored.merge_mint(coin),
            };
            match write {
                Some(record) => {
                    self.stage_coin(&mut batch, existing.as_ref(), Some(&record))?;
                    staged.insert(outpoint, record);
                    outcome.written += 1;
                }
                None => outcome.duplicates += 1,
            }
        }

        self.write(batch)?;
        Ok(outcome)
    }

    fn spend_coins(&self, spends: &[SpendOp]) -> Result<WriteOutcome, LedgerError> {
        let _guard = self.write_lock.lock();
        let mut staged: HashMap<OutPoint, (CoinRecord, CoinRecord)> = HashMap::new();
        let mut outcome = WriteOutcome::default();

        for op in spends {
            let (original, mut current) = match staged.remove(&op.outpoint) {
                Some(pair) => pair,
                None => {
                    let coin = self
                        .get_coin(&op.outpoint)?
                        .ok_or(LedgerError::MissingUtxo(op.outpoint))?;
                    (coin.clone(), coin)
                }
            };
            match current.apply_spend(op) {
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
            staged.insert(op.outpoint, (original, current));
        }

        let mut batch = WriteBatch::default();
        for (original, current) in staged.values() {
            if original != current {
                self.stage_coin(&mut batch, Some(original), Some(current))?;
            }
        }
        self.write(batch)?;
        Ok(outcome)
    }

    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<CoinRecord>, LedgerError> {
        self.get_decoded(CF_COINS, &outpoint_key(outpoint))
    }

    fn coins_minted_by(&self, txid: &Hash256) -> Result<Vec<CoinRecord>, LedgerError> {
        let cf = self.cf_handle(CF_COINS)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(txid.as_bytes(), Direction::Forward));
        let mut coins = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(txid.as_bytes()) {
                break;
            }
            coins.push(decode(&value)?);
        }
        Ok(coins)
    }

    fn coins_spent_by(&self, txid: &Hash256) -> Result<Vec<CoinRecord>, LedgerError> {
        let outpoints = self.indexed_outpoints(CF_SPENT_BY, txid.as_bytes())?;
        self.coins_at(&outpoints)
    }

    fn unspent_coins(&self) -> Result<Vec<CoinRecord>, LedgerError> {
        let cf = self.cf_handle(CF_COINS)?;
        let mut coins = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(storage_err)?;
            let coin: CoinRecord = decode(&value)?;
            if coin.is_unspent() {
                coins.push(coin);
            }
        }
        Ok(coins)
    }

    fn coins_by_address(&self, address: &str) -> Result<Vec<CoinRecord>, LedgerError> {
        let outpoints = self.indexed_outpoints(CF_ADDRESS_INDEX, &address_prefix(address))?;
        Ok(self
            .coins_at(&outpoints)?
            .into_iter()
            .filter(|c| c.address.as_deref() == Some(address))
            .collect())
    }

    fn coins_by_wallet(&self, wallet: WalletId) -> Result<Vec<CoinRecord>, LedgerError> {
        let outpoints = self.indexed_outpoints(CF_WALLET_INDEX, &wallet.0.to_be_bytes())?;
        self.coins_at(&outpoints)
    }

    fn tag_coin_wallets(
        &self,
        outpoint: &OutPoint,
        wallets: &BTreeSet<WalletId>,
    ) -> Result<bool, LedgerError> {
        let _guard = self.write_lock.lock();
        let coin = self
            .get_coin(outpoint)?
            .ok_or(LedgerError::MissingUtxo(*outpoint))?;
        let mut updated = coin.clone();
        updated.wallets.extend(wallets.iter().copied());
        if updated.wallets == coin.wallets {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        self.stage_coin(&mut batch, Some(&coin), Some(&updated))?;
        self.write(batch)?;
        Ok(true)
    }

    fn register_wallet_address(
        &self,
        wallet: WalletId,
        address: &str,
    ) -> Result<usize, LedgerError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();

        let mut wallets = self.wallets_for_address(address)?;
        wallets.insert(wallet);
        let cf_wa = self.cf_handle(CF_WALLET_ADDRESSES)?;
        batch.put_cf(cf_wa, address.as_bytes(), encode(&wallets)?);

        let mut tagged = 0;
        let outpoints = self.indexed_outpoints(CF_ADDRESS_INDEX, &address_prefix(address))?;
        for coin in self.coins_at(&outpoints)? {
            if coin.address.as_deref() != Some(address) || coin.wallets.contains(&wallet) {
                continue;
            }
            let mut updated = coin.clone();
            updated.wallets.insert(wallet);
            self.stage_coin(&mut batch, Some(&coin), Some(&updated))?;
            tagged += 1;
        }

        self.write(batch)?;
        debug!(%wallet, address, tagged, "registered wallet address");
        Ok(tagged)
    }

    fn rollback(&self, from_height: u64) -> Result<RollbackSummary, LedgerError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut summary = RollbackSummary::default();
        let start = from_height.to_be_bytes();

        // Blocks.
        let cf_blocks = self.cf_handle(CF_BLOCKS)?;
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        for item in self
            .db
            .iterator_cf(cf_height, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(storage_err)?;
            batch.delete_cf(cf_blocks, &value);
            batch.delete_cf(cf_height, &key);
            summary.blocks_removed += 1;
        }

        // Confirmed transactions. Mempool entries have no height and stay.
        for key in self.keys_from(CF_TX_HEIGHT, &start)? {
            let txid = hash_from_bytes(&key[8..])?;
            let tx = self.get_transaction(&txid)?;
            match tx {
                Some(tx) => self.stage_transaction(&mut batch, Some(&tx), None)?,
                None => batch.delete_cf(self.cf_handle(CF_TX_HEIGHT)?, &key),
            }
            summary.transactions_removed += 1;
        }

        // Coins minted at or above the cut.
        let mut removed: HashSet<OutPoint> = HashSet::new();
        for key in self.keys_from(CF_COIN_MINT_HEIGHT, &start)? {
            let outpoint = outpoint_from_key(&key[8..])?;
            if let Some(coin) = self.get_coin(&outpoint)? {
                self.stage_coin(&mut batch, Some(&coin), None)?;
                summary.coins_removed += 1;
            }
            removed.insert(outpoint);
        }

        // Spends at or above the cut on surviving coins.
        for key in self.keys_from(CF_COIN_SPENT_HEIGHT, &start)? {
            let outpoint = outpoint_from_key(&key[8..])?;
            if removed.contains(&outpoint) {
                continue;
            }
            if let Some(coin) = self.get_coin(&outpoint)? {
                let mut restored = coin.clone();
                restored.clear_spend();
                self.stage_coin(&mut batch, Some(&coin), Some(&restored))?;
                summary.coins_unspent += 1;
            }
        }

        // The block just below becomes the top of the chain.
        if let Some(below) = from_height.checked_sub(1) {
            if let Some(mut block) = self.block_at_height(below)? {
                if block.next_block_hash.is_some() {
                    block.next_block_hash = None;
                    batch.put_cf(cf_blocks, block.hash.as_bytes(), encode(&block)?);
                }
            }
        }

        self.write(batch)?;
        if !summary.is_empty() {
            info!(
                from_height,
                blocks = summary.blocks_removed,
                transactions = summary.transactions_removed,
                coins_removed = summary.coins_removed,
                coins_unspent = summary.coins_unspent,
                "rolled back ledger"
            );
        }
        Ok(summary)
    }
}
