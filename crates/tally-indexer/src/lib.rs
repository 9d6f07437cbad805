//! # tally-indexer: ledger storage, block ingestion, and sync.
//!
//! Composes the Tally indexer:
//! - [`storage::RocksStore`]: RocksDB-backed [`LedgerStore`](tally_core::ledger::LedgerStore)
//! - [`ingest::BlockIngester`]: reorg-aware block ingestion
//! - [`sync::SyncCoordinator`]: header-first sync against trusted peers
//! - [`pool::WorkerPool`]: supervised task workers for wallet tagging
//! - [`node::Indexer`]: everything above, wired from an [`IndexerConfig`]

pub mod config;
pub mod error;
pub mod ingest;
pub mod node;
pub mod pool;
pub mod state;
pub mod storage;
pub mod sync;

pub use config::IndexerConfig;
pub use error::{IndexerError, PoolError};
pub use ingest::{BlockIngester, IngestConfig, IngestReport};
pub use node::Indexer;
pub use pool::{TaskHandler, TaskRegistry, WorkerPool};
pub use state::{SyncState, SyncStateStore};
pub use storage::RocksStore;
pub use sync::{SyncConfig, SyncCoordinator, SyncOutcome, SyncStatus};
