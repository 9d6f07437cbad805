use tally_core::error::{LedgerError, NetworkError};
use tally_core::types::Hash256;
use thiserror::Error;

/// Errors from the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool has no workers")]
    NoWorkers,
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("worker {worker} crashed while handling request {id}")]
    WorkerCrashed { worker: usize, id: u64 },
    #[error("task failed: {0}")]
    Task(String),
    #[error("worker pool is shut down")]
    Closed,
}

/// Top-level indexer error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("block {hash} has unknown parent {prev_hash}")]
    OrphanBlock { hash: Hash256, prev_hash: Hash256 },
    #[error("sync state: {0}")]
    State(String),
    #[error("config: {0}")]
    Config(String),
    #[error("startup: {0}")]
    Startup(String),
}

impl IndexerError {
    /// Whether the error means the sync pass was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IndexerError::Network(NetworkError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::types::OutPoint;

    #[test]
    fn ledger_errors_are_transparent() {
        let outpoint = OutPoint {
            txid: Hash256([1; 32]),
            index: 3,
        };
        let err: IndexerError = LedgerError::MissingUtxo(outpoint).into();
        assert_eq!(err.to_string(), LedgerError::MissingUtxo(outpoint).to_string());
    }

    #[test]
    fn cancellation_is_detected() {
        assert!(IndexerError::from(NetworkError::Cancelled).is_cancelled());
        assert!(!IndexerError::from(NetworkError::NoPeers).is_cancelled());
        assert!(!IndexerError::State("x".into()).is_cancelled());
    }

    #[test]
    fn pool_error_messages() {
        let err = PoolError::WorkerCrashed { worker: 2, id: 7 };
        assert_eq!(err.to_string(), "worker 2 crashed while handling request 7");
        assert_eq!(PoolError::UnknownTask("x".into()).to_string(), "unknown task: x");
    }
}
