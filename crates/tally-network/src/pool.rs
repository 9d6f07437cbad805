//! Peer pool abstraction.
//!
//! The [`PeerPool`] trait is the seam between the peer worker and whatever
//! transport talks to peers. [`crate::service::Libp2pPool`] is the
//! production implementation; [`ScriptedPool`] replays a fixed chain in
//! memory for tests.

use async_trait::async_trait;
use tokio::sync::broadcast;

use tally_core::error::NetworkError;
use tally_core::types::{Block, BlockHeader, Hash256, Transaction};

use crate::inventory::InvItem;

/// A connected peer as seen by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub address: Option<String>,
    /// Best block height the peer reported, zero until known.
    pub best_height: u64,
}

/// Typed events surfaced by a pool.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    PeerReady(PeerInfo),
    PeerDisconnect(PeerInfo),
    Block { hash: Hash256, block: Block },
    Tx { hash: Hash256, tx: Transaction },
    Headers(Vec<BlockHeader>),
    Inv(Vec<InvItem>),
}

/// Outbound requests a pool forwards to its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    GetHeaders(Vec<Hash256>),
    GetData(Vec<InvItem>),
}

/// Connection manager for a fixed set of trusted peers.
#[async_trait]
pub trait PeerPool: Send + Sync {
    /// Dial every configured peer that is not connected. Safe to call repeatedly.
    async fn connect(&self) -> Result<(), NetworkError>;

    /// Close all peer connections.
    async fn disconnect(&self) -> Result<(), NetworkError>;

    /// Send `message` to the connected peers.
    ///
    /// Responses arrive later as [`PeerEvent`]s.
    async fn send(&self, message: PeerMessage) -> Result<(), NetworkError>;

    /// Receive every event emitted from now on.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    /// Highest best height reported by any connected peer.
    fn best_height(&self) -> u64;

    fn peer_count(&self) -> usize;
}

#[cfg(any(test, feature = "testing"))]
pub use scripted::ScriptedPool;

#[cfg(any(test, feature = "testing"))]
mod scripted {
    use super::*;
    use crate::inventory::InvKind;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tally_core::constants::MAX_HEADERS_PER_RESPONSE;

    /// In-memory pool serving a scripted chain.
    ///
    /// `GetHeaders` answers with the headers after the first locator hash
    /// found in the chain (or from the start). `GetData` answers with the
    /// requested blocks. Requests can be dropped to exercise retry paths.
    pub struct ScriptedPool {
        chain: Mutex<Vec<Block>>,
        mempool: Mutex<Vec<Transaction>>,
        events: broadcast::Sender<PeerEvent>,
        sent: Mutex<Vec<PeerMessage>>,
        drop_next: AtomicUsize,
        silent: AtomicBool,
        connected: AtomicBool,
        headers_per_batch: usize,
    }

    impl ScriptedPool {
        pub fn new(chain: Vec<Block>) -> Self {
            let (events, _) = broadcast::channel(1024);
            Self {
                chain: Mutex::new(chain),
                mempool: Mutex::new(Vec::new()),
                events,
                sent: Mutex::new(Vec::new()),
                drop_next: AtomicUsize::new(0),
                silent: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                headers_per_batch: MAX_HEADERS_PER_RESPONSE,
            }
        }

        /// Cap the number of headers returned per request.
        pub fn with_headers_per_batch(mut self, n: usize) -> Self {
            self.headers_per_batch = n.max(1);
            self
        }

        /// Replace the served chain (e.g. to simulate a reorg).
        pub fn set_chain(&self, chain: Vec<Block>) {
            *self.chain.lock() = chain;
        }

        pub fn push_block(&self, block: Block) {
            self.chain.lock().push(block);
        }

        /// Serve `tx` to `GetData` requests.
        pub fn add_mempool_tx(&self, tx: Transaction) {
            self.mempool.lock().push(tx);
        }

        /// Ignore the next `n` requests.
        pub fn drop_next(&self, n: usize) {
            self.drop_next.store(n, Ordering::SeqCst);
        }

        /// Ignore every request while set.
        pub fn set_silent(&self, silent: bool) {
            self.silent.store(silent, Ordering::SeqCst);
        }

        /// Every message passed to [`PeerPool::send`], dropped ones included.
        pub fn sent(&self) -> Vec<PeerMessage> {
            self.sent.lock().clone()
        }

        /// Inject an event as if a peer had produced it.
        pub fn emit(&self, event: PeerEvent) {
            let _ = self.events.send(event);
        }

        fn peer(&self) -> PeerInfo {
            PeerInfo {
                id: "scripted".to_string(),
                address: None,
                best_height: self.chain.lock().len() as u64,
            }
        }

        fn headers_after(&self, locator: &[Hash256]) -> Vec<BlockHeader> {
            let chain = self.chain.lock();
            let start = locator
                .iter()
                .find_map(|hash| chain.iter().position(|b| b.hash() == *hash))
                .map(|pos| pos + 1)
                .unwrap_or(0);
            chain
                .iter()
                .skip(start)
                .take(self.headers_per_batch)
                .map(|b| b.header.clone())
                .collect()
        }

        fn answer(&self, message: PeerMessage) {
            match message {
                PeerMessage::GetHeaders(locator) => {
                    let headers = self.headers_after(&locator);
                    let _ = self.events.send(PeerEvent::Headers(headers));
                }
                PeerMessage::GetData(items) => {
                    for item in items {
                        match item.kind {
                            InvKind::Block => {
                                let block = self
                                    .chain
                                    .lock()
                                    .iter()
                                    .find(|b| b.hash() == item.hash)
                                    .cloned();
                                if let Some(block) = block {
                                    let _ = self.events.send(PeerEvent::Block {
                                        hash: item.hash,
                                        block,
                                    });
                                }
                            }
                            InvKind::Tx => {
                                let tx = self
                                    .mempool
                                    .lock()
                                    .iter()
                                    .find(|tx| tx.txid().ok() == Some(item.hash))
                                    .cloned();
                                if let Some(tx) = tx {
                                    let _ = self.events.send(PeerEvent::Tx { hash: item.hash, tx });
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[async_trait]
    impl PeerPool for ScriptedPool {
        async fn connect(&self) -> Result<(), NetworkError> {
            if !self.connected.swap(true, Ordering::SeqCst) {
                let _ = self.events.send(PeerEvent::PeerReady(self.peer()));
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), NetworkError> {
            if self.connected.swap(false, Ordering::SeqCst) {
                let _ = self.events.send(PeerEvent::PeerDisconnect(self.peer()));
            }
            Ok(())
        }

        async fn send(&self, message: PeerMessage) -> Result<(), NetworkError> {
            self.sent.lock().push(message.clone());
            if self.silent.load(Ordering::SeqCst) {
                return Ok(());
            }
            let dropped = self
                .drop_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !dropped {
                self.answer(message);
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
            self.events.subscribe()
        }

        fn best_height(&self) -> u64 {
            self.peer().best_height
        }

        fn peer_count(&self) -> usize {
            usize::from(self.connected.load(Ordering::SeqCst))
        }
    }
}
