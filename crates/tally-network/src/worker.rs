//! Peer network worker.
//!
//! Wraps a [`PeerPool`] with the request/response operations the sync
//! coordinator needs. A request registers a one-shot waiter, then resends on
//! a fixed interval until a matching event arrives, the retry bound is hit,
//! or the worker's cancellation token fires. With no retry bound a silent
//! peer set stalls the request indefinitely.
//!
//! A background listener filters pool events through the
//! [`InventoryCache`] and re-emits them to subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_core::error::NetworkError;
use tally_core::types::{Block, BlockHeader, Hash256};

use crate::config::NetworkConfig;
use crate::inventory::{InvItem, InvKind, InventoryCache};
use crate::pool::{PeerEvent, PeerMessage, PeerPool};

/// Retry and reconnect timing for [`PeerWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerWorkerConfig {
    pub retry_interval: Duration,
    /// `None` resends forever.
    pub max_retries: Option<u32>,
    pub reconnect_interval: Duration,
    pub inv_block_capacity: usize,
    pub inv_tx_capacity: usize,
}

impl From<&NetworkConfig> for PeerWorkerConfig {
    fn from(cfg: &NetworkConfig) -> Self {
        Self {
            retry_interval: cfg.retry_interval(),
            max_retries: cfg.max_retries,
            reconnect_interval: cfg.reconnect_interval(),
            inv_block_capacity: cfg.inv_block_capacity,
            inv_tx_capacity: cfg.inv_tx_capacity,
        }
    }
}

impl Default for PeerWorkerConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

/// Pending one-shot waiters keyed by what they wait for.
#[derive(Default)]
struct Waiters {
    headers: Mutex<Vec<oneshot::Sender<Vec<BlockHeader>>>>,
    blocks: Mutex<HashMap<Hash256, Vec<oneshot::Sender<Block>>>>,
}

impl Waiters {
    fn complete_headers(&self, headers: &[BlockHeader]) {
        for waiter in self.headers.lock().drain(..) {
            let _ = waiter.send(headers.to_vec());
        }
    }

    fn complete_block(&self, hash: &Hash256, block: &Block) {
        if let Some(waiters) = self.blocks.lock().remove(hash) {
            for waiter in waiters {
                let _ = waiter.send(block.clone());
            }
        }
    }
}

/// Request/response front end over a [`PeerPool`].
pub struct PeerWorker {
    pool: Arc<dyn PeerPool>,
    inventory: Arc<InventoryCache>,
    waiters: Arc<Waiters>,
    events: broadcast::Sender<PeerEvent>,
    config: PeerWorkerConfig,
    cancel: CancellationToken,
    reconnect: Mutex<Option<CancellationToken>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerWorker")
            .field("peer_count", &self.pool.peer_count())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl PeerWorker {
    /// Create the worker and start its event listener.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(pool: Arc<dyn PeerPool>, config: PeerWorkerConfig) -> Self {
        let inventory = Arc::new(InventoryCache::new(
            config.inv_block_capacity,
            config.inv_tx_capacity,
        ));
        let waiters = Arc::new(Waiters::default());
        let (events, _) = broadcast::channel(1024);
        let cancel = CancellationToken::new();

        let listener = tokio::spawn(listen(
            Arc::clone(&pool),
            pool.subscribe(),
            Arc::clone(&inventory),
            Arc::clone(&waiters),
            events.clone(),
            cancel.clone(),
        ));

        Self {
            pool,
            inventory,
            waiters,
            events,
            config,
            cancel,
            reconnect: Mutex::new(None),
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Events after inventory filtering.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn inventory(&self) -> &InventoryCache {
        &self.inventory
    }

    /// Token that aborts every in-flight and future request when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Highest height reported by any connected peer.
    pub fn best_pool_height(&self) -> u64 {
        self.pool.best_height()
    }

    pub fn peer_count(&self) -> usize {
        self.pool.peer_count()
    }

    /// Connect to the trusted peers and resolve once one is ready.
    ///
    /// Starts a background loop that re-dials every `reconnect_interval`
    /// while no peer is connected.
    pub async fn connect(&self) -> Result<(), NetworkError> {
        let mut events = self.events.subscribe();
        self.pool.connect().await?;
        self.start_reconnect_loop();

        if self.pool.peer_count() > 0 {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(NetworkError::Cancelled),
                event = events.recv() => match event {
                    Ok(PeerEvent::PeerReady(_)) => return Ok(()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(NetworkError::PeerDisconnected("peer worker stopped".into()));
                    }
                },
            }
        }
    }

    /// Stop reconnecting and close all peer connections.
    pub async fn disconnect(&self) -> Result<(), NetworkError> {
        if let Some(token) = self.reconnect.lock().take() {
            token.cancel();
        }
        self.pool.disconnect().await
    }

    /// Cancel pending requests and stop the listener.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(token) = self.reconnect.lock().take() {
            token.cancel();
        }
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Fetch the headers following the first known hash in `locator`.
    pub async fn get_headers(
        &self,
        locator: Vec<Hash256>,
    ) -> Result<Vec<BlockHeader>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.headers.lock().push(tx);
        self.request(PeerMessage::GetHeaders(locator), rx).await
    }

    /// Fetch one block by hash.
    pub async fn get_block(&self, hash: Hash256) -> Result<Block, NetworkError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut blocks = self.waiters.blocks.lock();
            blocks.retain(|_, senders| {
                senders.retain(|s| !s.is_closed());
                !senders.is_empty()
            });
            blocks.entry(hash).or_default().push(tx);
        }
        self.request(PeerMessage::GetData(vec![InvItem::block(hash)]), rx).await
    }

    async fn request<T>(
        &self,
        message: PeerMessage,
        mut response: oneshot::Receiver<T>,
    ) -> Result<T, NetworkError> {
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(NetworkError::Cancelled),
                result = &mut response => {
                    return result.map_err(|_| {
                        NetworkError::PeerDisconnected("peer worker stopped".into())
                    });
                }
                _ = ticker.tick() => {
                    if self.config.max_retries.is_some_and(|max| attempts >= max) {
                        warn!(attempts, ?message, "giving up on unanswered request");
                        return Err(NetworkError::RetriesExhausted { attempts });
                    }
                    attempts += 1;
                    if attempts > 1 {
                        debug!(attempts, "resending unanswered request");
                    }
                    if let Err(e) = self.pool.send(message.clone()).await {
                        debug!(%e, attempts, "request send failed, will retry");
                    }
                }
            }
        }
    }

    fn start_reconnect_loop(&self) {
        let mut slot = self.reconnect.lock();
        if slot.is_some() {
            return;
        }
        let token = self.cancel.child_token();
        *slot = Some(token.clone());

        let pool = Arc::clone(&self.pool);
        let every = self.config.reconnect_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if pool.peer_count() == 0 {
                            debug!("no peers connected, reconnecting");
                            if let Err(e) = pool.connect().await {
                                warn!(%e, "reconnect attempt failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

impl Drop for PeerWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background task: filter pool events, satisfy waiters, re-emit.
async fn listen(
    pool: Arc<dyn PeerPool>,
    mut rx: broadcast::Receiver<PeerEvent>,
    inventory: Arc<InventoryCache>,
    waiters: Arc<Waiters>,
    events: broadcast::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "peer event listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            PeerEvent::PeerReady(peer) => {
                info!(peer = %peer.id, best_height = peer.best_height, "peer ready");
            }
            PeerEvent::PeerDisconnect(peer) => {
                warn!(peer = %peer.id, "peer disconnected");
            }
            PeerEvent::Headers(headers) => {
                debug!(count = headers.len(), "received headers");
                waiters.complete_headers(headers);
            }
            PeerEvent::Block { hash, block } => {
                inventory.cache(InvKind::Block, *hash);
                for tx in &block.transactions {
                    if let Ok(txid) = tx.txid() {
                        inventory.cache(InvKind::Tx, txid);
                    }
                }
                waiters.complete_block(hash, block);
            }
            PeerEvent::Tx { hash, .. } => {
                if !inventory.cache(InvKind::Tx, *hash) {
                    continue;
                }
            }
            PeerEvent::Inv(items) => {
                let unseen = inventory.filter_unseen(items);
                if unseen.is_empty() {
                    continue;
                }
                debug!(count = unseen.len(), "requesting announced inventory");
                if let Err(e) = pool.send(PeerMessage::GetData(unseen.clone())).await {
                    debug!(%e, "getdata send failed");
                }
                let _ = events.send(PeerEvent::Inv(unseen));
                continue;
            }
        }
        let _ = events.send(event);
    }
}
