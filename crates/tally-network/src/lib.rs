//! # tally-network: peer side of the Tally indexer.
//!
//! A [`PeerWorker`] wraps a [`PeerPool`] of trusted peers and exposes
//! request/response style calls (`get_headers`, `get_block`) on top of the
//! pool's event stream, retrying unanswered requests on an interval. An
//! [`InventoryCache`] suppresses inventory the worker has already seen.
//!
//! [`Libp2pPool`] is the production pool: Gossipsub for announcements,
//! request-response for header and block fetches, Noise over TCP/Yamux.

pub mod behaviour;
pub mod config;
pub mod inventory;
pub mod pool;
pub mod protocol;
pub mod service;
pub mod worker;

pub use config::NetworkConfig;
pub use inventory::{InvItem, InvKind, InventoryCache};
#[cfg(any(test, feature = "testing"))]
pub use pool::ScriptedPool;
pub use pool::{PeerEvent, PeerInfo, PeerMessage, PeerPool};
pub use protocol::{GossipMessage, TallyCodec, TallyRequest, TallyResponse};
pub use service::Libp2pPool;
pub use worker::{PeerWorker, PeerWorkerConfig};
