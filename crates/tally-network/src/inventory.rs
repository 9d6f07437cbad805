//! Bounded FIFO cache of recently seen block and transaction hashes.
//!
//! Used to drop duplicate `inv` announcements and repeated gossip before any
//! request is made. A miss only costs a redundant fetch, so the cache never
//! needs to be exact.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tally_core::constants::{INV_BLOCK_CAPACITY, INV_TX_CAPACITY};
use tally_core::types::Hash256;

/// Kind of object an inventory entry refers to.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum InvKind {
    Block,
    Tx,
}

/// One announced object.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl InvItem {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }
}

/// Insertion-ordered set with a hard capacity.
struct Ring {
    order: VecDeque<Hash256>,
    members: HashSet<Hash256>,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns `true` if the hash was not present.
    fn insert(&mut self, hash: Hash256) -> bool {
        if self.capacity == 0 || !self.members.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

/// Per-kind FIFO inventory cache.
pub struct InventoryCache {
    blocks: Mutex<Ring>,
    txs: Mutex<Ring>,
}

impl Default for InventoryCache {
    fn default() -> Self {
        Self::new(INV_BLOCK_CAPACITY, INV_TX_CAPACITY)
    }
}

impl InventoryCache {
    pub fn new(block_capacity: usize, tx_capacity: usize) -> Self {
        Self {
            blocks: Mutex::new(Ring::new(block_capacity)),
            txs: Mutex::new(Ring::new(tx_capacity)),
        }
    }

    fn ring(&self, kind: InvKind) -> &Mutex<Ring> {
        match kind {
            InvKind::Block => &self.blocks,
            InvKind::Tx => &self.txs,
        }
    }

    /// Record `hash`. Returns `true` when it was not already cached.
    pub fn cache(&self, kind: InvKind, hash: Hash256) -> bool {
        self.ring(kind).lock().insert(hash)
    }

    pub fn is_cached(&self, kind: InvKind, hash: &Hash256) -> bool {
        self.ring(kind).lock().members.contains(hash)
    }

    pub fn len(&self, kind: InvKind) -> usize {
        self.ring(kind).lock().order.len()
    }

    pub fn is_empty(&self, kind: InvKind) -> bool {
        self.len(kind) == 0
    }

    /// Items from `items` that are not cached yet, in announcement order.
    pub fn filter_unseen(&self, items: &[InvItem]) -> Vec<InvItem> {
        items
            .iter()
            .filter(|item| !self.is_cached(item.kind, &item.hash))
            .copied()
            .collect()
    }
}
