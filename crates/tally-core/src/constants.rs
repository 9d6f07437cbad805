//! Protocol and indexing constants.

/// Four-byte prefix on every gossiped wire message.
pub const MAGIC_BYTES: [u8; 4] = *b"TALY";

/// Largest block the wire codec will carry, in bytes.
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Number of recent processed block hashes sent as a header locator.
pub const LOCATOR_LENGTH: usize = 30;

/// Upper bound on locator entries accepted from the wire.
pub const MAX_LOCATOR_SIZE: usize = 64;

/// Most headers a peer returns for one `GetHeaders` request.
pub const MAX_HEADERS_PER_RESPONSE: usize = 2000;

/// Inventory cache capacity for block hashes.
pub const INV_BLOCK_CAPACITY: usize = 100;

/// Inventory cache capacity for transaction hashes.
pub const INV_TX_CAPACITY: usize = 100_000;

/// Staged writes committed per storage batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Storage batches allowed in flight at once during ingestion.
pub const DEFAULT_MAX_CONCURRENT_OPS: usize = 10;

/// Height assigned to the configured genesis block.
pub const DEFAULT_GENESIS_HEIGHT: u64 = 1;

/// Sentinel stored in `spent_height` for a coin minted by a mempool transaction.
pub const SPENT_HEIGHT_PENDING: i64 = -2;

/// Sentinel stored in `spent_height` for a confirmed, unspent coin.
pub const SPENT_HEIGHT_UNSPENT: i64 = -1;
