//! Shared builders for end-to-end tests.

use std::sync::Arc;

use tally_core::memory::MemoryLedgerStore;
use tally_core::records::ChainNetwork;
use tally_core::types::*;
use tally_indexer::{BlockIngester, IngestConfig};

/// Address string from a seed byte.
pub fn addr(seed: u8) -> String {
    format!("addr-{seed:02x}")
}

/// Coinbase paying `value` to `address`.
///
/// `lock_time` and the script carry `height`, so every coinbase has a
/// distinct txid.
pub fn make_coinbase(value: u64, address: &str, height: u64) -> Transaction {
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

/// Spend `inputs` into `outputs`.
pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<(u64, String)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|op| TxInput {
                previous_output: op,
                script_sig: vec![0; 64],
                sequence: u32::MAX,
            })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, address)| TxOutput {
                value,
                script: vec![0x51],
                address: Some(address),
            })
            .collect(),
        lock_time: 0,
    }
}

/// XOR of all txids; stands in for a merkle root so the header commits to
/// the block's transactions.
pub fn txid_digest(txs: &[Transaction]) -> Hash256 {
    let mut out = [0u8; 32];
    for tx in txs {
        for (o, b) in out.iter_mut().zip(tx.txid().unwrap().0) {
            *o ^= b;
        }
    }
    Hash256(out)
}

pub fn make_block(prev_hash: Hash256, time: u64, txs: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: txid_digest(&txs),
            time,
            bits: 0x207fffff,
            nonce: 0,
        },
        transactions: txs,
    }
}

/// Outpoint of output `index` of `tx`.
pub fn outpoint(tx: &Transaction, index: u64) -> OutPoint {
    OutPoint {
        txid: tx.txid().unwrap(),
        index,
    }
}

/// Builds a chain of blocks, one coinbase each plus any extra transactions.
pub struct ChainBuilder {
    blocks: Vec<Block>,
    reward: u64,
    /// Height the first block will be ingested at.
    first_height: u64,
}

impl ChainBuilder {
    pub fn new(reward: u64) -> Self {
        Self {
            blocks: Vec::new(),
            reward,
            first_height: 1,
        }
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.blocks.last().map(Block::hash).unwrap_or(Hash256::ZERO)
    }

    pub fn next_height(&self) -> u64 {
        self.first_height + self.blocks.len() as u64
    }

    /// Append a block paying its coinbase to `miner`.
    pub fn push(&mut self, miner: &str, extra: Vec<Transaction>) -> &Block {
        let height = self.next_height();
        let mut txs = vec![make_coinbase(self.reward, miner, height)];
        txs.extend(extra);
        let block = make_block(self.tip_hash(), 1_000 + height * 60, txs);
        self.blocks.push(block);
        self.blocks.last().unwrap()
    }

    /// Append `n` coinbase-only blocks with a distinct miner each.
    pub fn extend(&mut self, n: usize) -> &mut Self {
        for _ in 0..n {
            let miner = addr(self.next_height() as u8);
            self.push(&miner, Vec::new());
        }
        self
    }

    /// A copy of the first `len` blocks, to grow a competing branch from.
    pub fn fork_at(&self, len: usize) -> Self {
        Self {
            blocks: self.blocks[..len].to_vec(),
            reward: self.reward,
            first_height: self.first_height,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> &Block {
        &self.blocks[index]
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }
}

/// Ingester over a fresh in-memory ledger.
pub fn memory_ingester() -> (BlockIngester, Arc<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    let ingester = BlockIngester::new(
        store.clone(),
        IngestConfig::default(),
        ChainNetwork::new("TALLY", "regtest"),
    );
    (ingester, store)
}
