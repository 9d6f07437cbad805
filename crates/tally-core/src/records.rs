//! Persisted ledger records: blocks, transactions, coins.
//!
//! Every record carries the invariants the store enforces:
//! - one [`BlockRecord`] per hash, one [`CoinRecord`] per outpoint,
//! - a coin's spent fields are only set by the transaction consuming it,
//! - rollback clears them back to [`SpentHeight::Unspent`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::constants::{SPENT_HEIGHT_PENDING, SPENT_HEIGHT_UNSPENT};
use crate::types::{Hash256, OutPoint};

/// Identifier of a wallet registered with the address index.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct WalletId(pub u64);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wallet-{}", self.0)
    }
}

/// A chain identifier paired with a network name, e.g. `BTC:mainnet`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainNetwork {
    pub chain: String,
    pub network: String,
}

impl ChainNetwork {
    pub fn new(chain: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            network: network.into(),
        }
    }
}

impl fmt::Display for ChainNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.network)
    }
}

/// Spent state of a coin.
///
/// Serialized as the signed sentinel used by downstream queries:
/// `-2` pending (mempool mint), `-1` unspent, `h >= 0` spent at height `h`.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
#[serde(into = "i64", try_from = "i64")]
pub enum SpentHeight {
    /// Minted by an unconfirmed transaction.
    Pending,
    /// Confirmed and unspent.
    Unspent,
    /// Spent by a transaction confirmed at this height.
    Spent(u64),
}

impl SpentHeight {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Pending => SPENT_HEIGHT_PENDING,
            Self::Unspent => SPENT_HEIGHT_UNSPENT,
            Self::Spent(h) => h as i64,
        }
    }

    /// Decode a sentinel. Returns `None` for values below `-2`.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            SPENT_HEIGHT_PENDING => Some(Self::Pending),
            SPENT_HEIGHT_UNSPENT => Some(Self::Unspent),
            h if h >= 0 => Some(Self::Spent(h as u64)),
            _ => None,
        }
    }

    /// True for both pending and confirmed-unspent coins.
    pub fn is_unspent(self) -> bool {
        !matches!(self, Self::Spent(_))
    }

    pub fn spent_at(self) -> Option<u64> {
        match self {
            Self::Spent(h) => Some(h),
            _ => None,
        }
    }
}

impl From<SpentHeight> for i64 {
    fn from(value: SpentHeight) -> Self {
        value.as_i64()
    }
}

impl TryFrom<i64> for SpentHeight {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_i64(value).ok_or_else(|| format!("invalid spent height sentinel: {value}"))
    }
}

/// Indexed block header.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockRecord {
    pub hash: Hash256,
    pub height: u64,
    pub previous_block_hash: Hash256,
    pub next_block_hash: Option<Hash256>,
    pub merkle_root: Hash256,
    pub time: u64,
    /// Declared time clamped to be strictly after the parent's normalized time.
    pub time_normalized: u64,
    pub nonce: u64,
    pub bits: u32,
    pub size: u64,
    pub transaction_count: u64,
    /// Total value of the coinbase outputs.
    pub reward: u64,
    /// Set once every transaction and coin write for the block has landed.
    pub processed: bool,
}

/// Indexed transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TransactionRecord {
    pub txid: Hash256,
    /// `None` while the transaction sits in the mempool.
    pub block_height: Option<u64>,
    pub block_hash: Option<Hash256>,
    pub block_time: u64,
    pub block_time_normalized: u64,
    pub coinbase: bool,
    pub size: u64,
    pub locktime: u64,
    pub input_count: u64,
    pub output_count: u64,
    /// Sum of output values.
    pub value: u64,
    pub wallets: BTreeSet<WalletId>,
}

impl TransactionRecord {
    /// Whether writing `self` over `existing` changes the stored record.
    ///
    /// A mempool record never replaces a confirmed one.
    pub fn replaces(&self, existing: &TransactionRecord) -> bool {
        self != existing && !(self.block_height.is_none() && existing.block_height.is_some())
    }
}

/// Indexed transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct CoinRecord {
    pub mint_txid: Hash256,
    pub mint_index: u64,
    /// `None` for coins minted by a mempool transaction.
    pub mint_height: Option<u64>,
    pub coinbase: bool,
    pub value: u64,
    pub address: Option<String>,
    pub script: Vec<u8>,
    pub spent_txid: Option<Hash256>,
    pub spent_height: SpentHeight,
    pub wallets: BTreeSet<WalletId>,
}

impl CoinRecord {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.mint_txid,
            index: self.mint_index,
        }
    }

    pub fn is_unspent(&self) -> bool {
        self.spent_height.is_unspent()
    }

    /// Spender of this coin while that spender is still in the mempool.
    pub fn pending_spender(&self) -> Option<Hash256> {
        match self.spent_height {
            SpentHeight::Spent(_) => None,
            _ => self.spent_txid,
        }
    }

    /// Combine an incoming mint of the same outpoint with this stored coin.
    ///
    /// Returns the record to write, or `None` when the stored coin already
    /// covers the incoming one. A pending coin is promoted by a confirmed
    /// mint and keeps its mempool spender; a spent coin is never reset by a
    /// mint.
    pub fn merge_mint(&self, incoming: &CoinRecord) -> Option<CoinRecord> {
        match (self.spent_height, incoming.spent_height) {
            (SpentHeight::Pending, SpentHeight::Unspent) => {
                let mut promoted = incoming.clone();
                promoted.wallets.extend(self.wallets.iter().copied());
                promoted.spent_txid = self.spent_txid.or(incoming.spent_txid);
                Some(promoted)
            }
            _ => None,
        }
    }

    /// Record `op` as the spender of this coin.
    ///
    /// A mempool spend (`spent_height == None`) only sets `spent_txid`; it
    /// never overrides a confirmed spend.
    pub fn apply_spend(&mut self, op: &SpendOp) -> SpendChange {
        let target = match op.spent_height {
            Some(height) => SpentHeight::Spent(height),
            None if matches!(self.spent_height, SpentHeight::Spent(_)) => {
                return SpendChange::Unchanged;
            }
            None => self.spent_height,
        };
        if self.spent_txid == Some(op.spent_txid) && self.spent_height == target {
            return SpendChange::Unchanged;
        }
        let previous = self.spent_txid;
        self.spent_txid = Some(op.spent_txid);
        self.spent_height = target;
        if op.prune_script && op.spent_height.is_some() {
            self.script.clear();
        }
        match previous {
            Some(prev) if prev != op.spent_txid => SpendChange::Replaced(prev),
            _ => SpendChange::Applied,
        }
    }

    /// Undo a spend, returning the coin to the state its mint left it in.
    pub fn clear_spend(&mut self) {
        self.spent_txid = None;
        self.spent_height = match self.mint_height {
            Some(_) => SpentHeight::Unspent,
            None => SpentHeight::Pending,
        };
    }
}

/// Effect of [`CoinRecord::apply_spend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpendChange {
    Applied,
    /// Already spent by the same transaction at the same height.
    Unchanged,
    /// Was spent by a different transaction, now overwritten.
    Replaced(Hash256),
}

/// A staged spend of one coin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendOp {
    pub outpoint: OutPoint,
    pub spent_txid: Hash256,
    /// `None` for a spend by a mempool transaction.
    pub spent_height: Option<u64>,
    /// Drop the coin's script once the spend confirms.
    pub prune_script: bool,
}

/// Aggregated value held by a wallet or address.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalletBalance {
    /// Unspent value minted by confirmed transactions. Coins a mempool
    /// transaction already spends are left out.
    pub confirmed: u64,
    /// Unspent value minted by mempool transactions.
    pub unconfirmed: u64,
    pub balance: u64,
}

impl WalletBalance {
    /// Sum the unspent coins in `coins`.
    pub fn from_coins<'a>(coins: impl IntoIterator<Item = &'a CoinRecord>) -> Self {
        let mut out = Self::default();
        for coin in coins {
            if coin.spent_txid.is_some() {
                continue;
            }
            match coin.spent_height {
                SpentHeight::Unspent => out.confirmed = out.confirmed.saturating_add(coin.value),
                SpentHeight::Pending => {
                    out.unconfirmed = out.unconfirmed.saturating_add(coin.value)
                }
                SpentHeight::Spent(_) => continue,
            }
        }
        out.balance = out.confirmed.saturating_add(out.unconfirmed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn coin(value: u64, spent_height: SpentHeight) -> CoinRecord {
        CoinRecord {
            mint_txid: Hash256([1; 32]),
            mint_index: 0,
            mint_height: Some(1),
            coinbase: false,
            value,
            address: None,
            script: vec![],
            spent_txid: None,
            spent_height,
            wallets: BTreeSet::new(),
        }
    }

    #[test]
    fn sentinels_match_wire_values() {
        assert_eq!(SpentHeight::Pending.as_i64(), -2);
        assert_eq!(SpentHeight::Unspent.as_i64(), -1);
        assert_eq!(SpentHeight::Spent(0).as_i64(), 0);
        assert_eq!(SpentHeight::from_i64(-3), None);
    }

    #[test]
    fn spent_height_serializes_as_sentinel() {
        let json = serde_json::to_string(&SpentHeight::Unspent).unwrap();
        assert_eq!(json, "-1");
        let back: SpentHeight = serde_json::from_str("7").unwrap();
        assert_eq!(back, SpentHeight::Spent(7));
        assert!(serde_json::from_str::<SpentHeight>("-9").is_err());
    }

    #[test]
    fn merge_mint_promotes_pending() {
        let mut stored = coin(5, SpentHeight::Pending);
        stored.mint_height = None;
        stored.wallets.insert(WalletId(9));
        let incoming = coin(5, SpentHeight::Unspent);
        let merged = stored.merge_mint(&incoming).unwrap();
        assert_eq!(merged.spent_height, SpentHeight::Unspent);
        assert_eq!(merged.mint_height, Some(1));
        assert!(merged.wallets.contains(&WalletId(9)));
    }

    #[test]
    fn merge_mint_never_resets_spent_coin() {
        let stored = coin(5, SpentHeight::Spent(4));
        assert!(stored.merge_mint(&coin(5, SpentHeight::Unspent)).is_none());
        let unspent = coin(5, SpentHeight::Unspent);
        assert!(unspent.merge_mint(&coin(5, SpentHeight::Unspent)).is_none());
    }

    #[test]
    fn apply_spend_reports_changes() {
        let mut c = coin(5, SpentHeight::Unspent);
        c.script = vec![1, 2];
        let op = SpendOp {
            outpoint: c.outpoint(),
            spent_txid: Hash256([7; 32]),
            spent_height: Some(3),
            prune_script: true,
        };
        assert_eq!(c.apply_spend(&op), SpendChange::Applied);
        assert!(c.script.is_empty());
        assert_eq!(c.apply_spend(&op), SpendChange::Unchanged);

        let other = SpendOp {
            spent_txid: Hash256([8; 32]),
            ..op.clone()
        };
        assert_eq!(c.apply_spend(&other), SpendChange::Replaced(Hash256([7; 32])));

        c.clear_spend();
        assert_eq!(c.spent_height, SpentHeight::Unspent);
        assert!(c.spent_txid.is_none());
    }

    #[test]
    fn mempool_spend_marks_spender_only() {
        let mut c = coin(5, SpentHeight::Unspent);
        c.script = vec![1, 2];
        let pending = SpendOp {
            outpoint: c.outpoint(),
            spent_txid: Hash256([7; 32]),
            spent_height: None,
            prune_script: true,
        };
        assert_eq!(c.apply_spend(&pending), SpendChange::Applied);
        assert_eq!(c.spent_height, SpentHeight::Unspent);
        assert_eq!(c.pending_spender(), Some(Hash256([7; 32])));
        assert_eq!(c.script, vec![1, 2]);
        assert_eq!(c.apply_spend(&pending), SpendChange::Unchanged);

        // Confirmation overwrites the pending spend.
        let confirmed = SpendOp {
            spent_height: Some(4),
            ..pending.clone()
        };
        assert_eq!(c.apply_spend(&confirmed), SpendChange::Applied);
        assert_eq!(c.spent_height, SpentHeight::Spent(4));
        assert!(c.pending_spender().is_none());

        // A late mempool announcement never demotes a confirmed spend.
        let late = SpendOp {
            spent_txid: Hash256([8; 32]),
            ..pending
        };
        assert_eq!(c.apply_spend(&late), SpendChange::Unchanged);
        assert_eq!(c.spent_txid, Some(Hash256([7; 32])));
    }

    #[test]
    fn promotion_keeps_mempool_spender() {
        let mut stored = coin(5, SpentHeight::Pending);
        stored.mint_height = None;
        stored.spent_txid = Some(Hash256([3; 32]));
        let merged = stored.merge_mint(&coin(5, SpentHeight::Unspent)).unwrap();
        assert_eq!(merged.spent_height, SpentHeight::Unspent);
        assert_eq!(merged.pending_spender(), Some(Hash256([3; 32])));
    }

    #[test]
    fn clear_spend_restores_pending_mint() {
        let mut c = coin(5, SpentHeight::Pending);
        c.mint_height = None;
        c.spent_txid = Some(Hash256([3; 32]));
        c.clear_spend();
        assert_eq!(c.spent_height, SpentHeight::Pending);
        assert!(c.spent_txid.is_none());
    }

    #[test]
    fn mempool_record_never_replaces_confirmed() {
        let confirmed = TransactionRecord {
            txid: Hash256([2; 32]),
            block_height: Some(5),
            block_hash: Some(Hash256([5; 32])),
            block_time: 1_300,
            block_time_normalized: 1_300,
            coinbase: false,
            size: 120,
            locktime: 0,
            input_count: 1,
            output_count: 1,
            value: 45,
            wallets: BTreeSet::new(),
        };
        let mempool = TransactionRecord {
            block_height: None,
            block_hash: None,
            block_time: 0,
            block_time_normalized: 0,
            ..confirmed.clone()
        };
        assert!(!mempool.replaces(&confirmed));
        assert!(confirmed.replaces(&mempool));
        assert!(!confirmed.replaces(&confirmed));
    }

    #[test]
    fn chain_network_display() {
        assert_eq!(ChainNetwork::new("BTC", "regtest").to_string(), "BTC:regtest");
    }

    #[test]
    fn balance_splits_confirmed_and_pending() {
        let coins = vec![
            coin(10, SpentHeight::Unspent),
            coin(5, SpentHeight::Pending),
            coin(100, SpentHeight::Spent(3)),
            CoinRecord {
                spent_txid: Some(Hash256([4; 32])),
                ..coin(40, SpentHeight::Unspent)
            },
        ];
        let bal = WalletBalance::from_coins(&coins);
        assert_eq!(bal.confirmed, 10);
        assert_eq!(bal.unconfirmed, 5);
        assert_eq!(bal.balance, 15);
    }

    proptest! {
        #[test]
        fn sentinel_roundtrip(v in -2i64..i64::MAX) {
            let decoded = SpentHeight::from_i64(v).unwrap();
            prop_assert_eq!(decoded.as_i64(), v);
            prop_assert_eq!(decoded.is_unspent(), v < 0);
        }
    }
}
