//! # tally-core
//! Foundation types, ledger records, and store traits for the Tally indexer.

pub mod constants;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod records;
pub mod types;
