//! Error types shared across the Tally crates.
use thiserror::Error;

use crate::types::{Hash256, OutPoint};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
    #[error("value overflow")] ValueOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error("message too large: {size}")] MessageTooLarge { size: usize },
    #[error("encode: {0}")] Encode(String),
    #[error("no connected peers")] NoPeers,
    #[error("request cancelled")] Cancelled,
    #[error("no response after {attempts} attempts")] RetriesExhausted { attempts: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("missing UTXO: {0}")] MissingUtxo(OutPoint),
    #[error("block not found: {0}")] BlockNotFound(Hash256),
    #[error("transaction not found: {0}")] TransactionNotFound(Hash256),
    #[error("storage: {0}")] Storage(String),
    #[error("codec: {0}")] Codec(String),
    #[error(transparent)] Transaction(#[from] TransactionError),
}
