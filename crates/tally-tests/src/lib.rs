//! End-to-end test suite for the Tally indexer.
//!
//! Tests in `tests/` drive block ingestion and sync against in-memory and
//! RocksDB ledgers using the chain builders in [`helpers`].

pub mod helpers;
