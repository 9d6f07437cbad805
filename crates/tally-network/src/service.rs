//! libp2p implementation of [`PeerPool`].
//!
//! Uses a command-channel architecture: [`Libp2pPool`] sends commands over an
//! mpsc channel to a background swarm task running on tokio, and the task
//! turns swarm events into [`PeerEvent`]s on a broadcast channel.
//!
//! A peer counts as ready once it has answered a `GetStatus` request, which
//! also records its best height.

use crate::behaviour::{self, PROTOCOL_VERSION, TallyBehaviour};
use crate::config::NetworkConfig;
use crate::pool::{PeerEvent, PeerInfo, PeerMessage, PeerPool};
use crate::protocol::{
    BLOCKS_TOPIC, GossipMessage, INV_TOPIC, REQ_RESP_PROTOCOL, TXS_TOPIC, TallyCodec,
    TallyRequest, TallyResponse,
};
use async_trait::async_trait;
use libp2p::futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::request_response;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, StreamProtocol, SwarmBuilder, identify};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tally_core::error::NetworkError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Commands sent from [`Libp2pPool`] to the background swarm task.
#[derive(Debug)]
enum Command {
    Dial(Multiaddr),
    /// Send a request to every connected peer.
    Request(TallyRequest),
    DisconnectAll,
    Shutdown,
}

/// Per-peer state shared between the handle and the swarm task.
#[derive(Debug, Clone, Default)]
struct PeerSlot {
    address: Option<String>,
    /// Set once the peer has answered `GetStatus`.
    best_height: Option<u64>,
}

struct SharedState {
    peers: RwLock<HashMap<PeerId, PeerSlot>>,
    running: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    fn info(&self, peer: &PeerId) -> PeerInfo {
        let slot = self.peers.read().get(peer).cloned().unwrap_or_default();
        PeerInfo {
            id: peer.to_string(),
            address: slot.address,
            best_height: slot.best_height.unwrap_or(0),
        }
    }
}

/// Peer pool backed by a libp2p swarm.
pub struct Libp2pPool {
    command_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PeerEvent>,
    state: Arc<SharedState>,
    trusted: Vec<Multiaddr>,
    local_peer_id: PeerId,
}

impl std::fmt::Debug for Libp2pPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Libp2pPool")
            .field("peer_id", &self.local_peer_id)
            .field("peer_count", &self.state.peers.read().len())
            .field("running", &self.state.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Load an Ed25519 keypair from `path`, or generate one and save its seed there.
///
/// Keeps the peer ID stable across restarts. The file holds the raw 32-byte
/// secret and is created with mode `0o600` on Unix.
fn load_or_generate_keypair(path: &Path) -> Result<Keypair, String> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .map_err(|e| format!("failed to read node key file '{}': {e}", path.display()))?;
        let keypair = Keypair::ed25519_from_bytes(bytes)
            .map_err(|e| format!("invalid node key in '{}': {e}", path.display()))?;
        info!(path = %path.display(), "loaded existing node identity key");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create directory '{}': {e}", parent.display()))?;
    }
    let secret = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| format!("keypair is not Ed25519: {e}"))?
        .secret();
    std::fs::write(path, secret.as_ref())
        .map_err(|e| format!("failed to write node key file '{}': {e}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| format!("failed to set permissions on '{}': {e}", path.display()))?;
    }

    info!(path = %path.display(), "generated new node identity key");
    Ok(keypair)
}

/// Peer ID embedded in a trusted multiaddr, if any.
fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Some(peer_id),
        _ => None,
    }
}

impl Libp2pPool {
    /// Build the swarm, start listening, and spawn the event loop.
    ///
    /// Does not dial anything; call [`PeerPool::connect`].
    pub async fn start(config: NetworkConfig) -> Result<Self, String> {
        let keypair = match &config.node_key_path {
            Some(path) => load_or_generate_keypair(path)?,
            None => Keypair::generate_ed25519(),
        };
        let local_peer_id = PeerId::from(keypair.public());
        info!(%local_peer_id, "starting peer pool");

        let trusted = config
            .trusted_peers
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>()
                    .map_err(|e| format!("invalid trusted peer '{s}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let gossipsub = behaviour::build_gossipsub(&keypair, config.gossipsub_heartbeat())?;
        let identify = identify::Behaviour::new(identify::Config::new(
            PROTOCOL_VERSION.to_string(),
            keypair.public(),
        ));
        let request_response = request_response::Behaviour::with_codec(
            TallyCodec,
            [(StreamProtocol::new(REQ_RESP_PROTOCOL), request_response::ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(config.request_timeout()),
        );
        let behaviour = TallyBehaviour {
            gossipsub,
            identify,
            request_response,
        };

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| format!("TCP transport error: {e}"))?
            .with_behaviour(|_| Ok(behaviour))
            .map_err(|e| format!("behaviour error: {e}"))?
            .build();

        for topic in [BLOCKS_TOPIC, TXS_TOPIC, INV_TOPIC] {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic))
                .map_err(|e| format!("subscribe {topic}: {e}"))?;
        }

        let listen_addr: Multiaddr = config
            .listen_multiaddr()
            .parse()
            .map_err(|e| format!("invalid listen addr: {e}"))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| format!("listen error: {e}"))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let state = Arc::new(SharedState::new());

        tokio::spawn(swarm_event_loop(
            swarm,
            command_rx,
            events.clone(),
            Arc::clone(&state),
        ));

        Ok(Self {
            command_tx,
            events,
            state,
            trusted,
            local_peer_id,
        })
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Whether the background swarm event loop is still running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    /// Stop the swarm event loop.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    fn command(&self, cmd: Command) -> Result<(), NetworkError> {
        self.command_tx
            .send(cmd)
            .map_err(|_| NetworkError::PeerDisconnected("swarm task stopped".into()))
    }

    fn is_connected(&self, addr: &Multiaddr) -> bool {
        let peers = self.state.peers.read();
        match peer_id_of(addr) {
            Some(id) => peers.contains_key(&id),
            None => {
                let wanted = addr.to_string();
                peers.values().any(|slot| slot.address.as_deref() == Some(wanted.as_str()))
            }
        }
    }
}

#[async_trait]
impl PeerPool for Libp2pPool {
    async fn connect(&self) -> Result<(), NetworkError> {
        for addr in &self.trusted {
            if !self.is_connected(addr) {
                debug!(%addr, "dialing trusted peer");
                self.command(Command::Dial(addr.clone()))?;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), NetworkError> {
        self.command(Command::DisconnectAll)
    }

    async fn send(&self, message: PeerMessage) -> Result<(), NetworkError> {
        if self.state.peers.read().is_empty() {
            return Err(NetworkError::NoPeers);
        }
        let request = match message {
            PeerMessage::GetHeaders(locator) => TallyRequest::GetHeaders(locator),
            PeerMessage::GetData(items) => TallyRequest::GetData(items),
        };
        request.validate()?;
        self.command(Command::Request(request))
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn best_height(&self) -> u64 {
        self.state
            .peers
            .read()
            .values()
            .filter_map(|slot| slot.best_height)
            .max()
            .unwrap_or(0)
    }

    fn peer_count(&self) -> usize {
        self.state.peers.read().len()
    }
}

/// Empty answer to an inbound request. Indexers do not serve chain data.
fn inbound_response(request: &TallyRequest) -> TallyResponse {
    match request {
        TallyRequest::GetHeaders(_) => TallyResponse::Headers(Vec::new()),
        TallyRequest::GetData(_) => TallyResponse::Data {
            blocks: Vec::new(),
            transactions: Vec::new(),
        },
        TallyRequest::GetStatus => TallyResponse::Status {
            best_height: 0,
            best_hash: tally_core::types::Hash256::ZERO,
        },
    }
}

/// Translate a peer response into pool events.
fn response_events(
    peer: PeerId,
    response: TallyResponse,
    state: &SharedState,
) -> Vec<PeerEvent> {
    match response {
        TallyResponse::Headers(headers) => vec![PeerEvent::Headers(headers)],
        TallyResponse::Data {
            blocks,
            transactions,
        } => {
            let mut out = Vec::with_capacity(blocks.len() + transactions.len());
            for block in blocks {
                out.push(PeerEvent::Block {
                    hash: block.hash(),
                    block,
                });
            }
            for tx in transactions {
                match tx.txid() {
                    Ok(hash) => out.push(PeerEvent::Tx { hash, tx }),
                    Err(e) => debug!(%peer, %e, "dropping undecodable transaction"),
                }
            }
            out
        }
        TallyResponse::Status { best_height, .. } => {
            let first = {
                let mut peers = state.peers.write();
                let slot = peers.entry(peer).or_default();
                let first = slot.best_height.is_none();
                slot.best_height = Some(best_height);
                first
            };
            if first {
                vec![PeerEvent::PeerReady(state.info(&peer))]
            } else {
                Vec::new()
            }
        }
    }
}

/// Translate a gossip payload into a pool event.
fn gossip_event(data: &[u8]) -> Option<PeerEvent> {
    match GossipMessage::decode(data)? {
        GossipMessage::Inv(items) => Some(PeerEvent::Inv(items)),
        GossipMessage::Block(block) => Some(PeerEvent::Block {
            hash: block.hash(),
            block,
        }),
        GossipMessage::Tx(tx) => {
            let hash = tx.txid().ok()?;
            Some(PeerEvent::Tx { hash, tx })
        }
    }
}

/// Background task running the libp2p swarm event loop.
async fn swarm_event_loop(
    mut swarm: libp2p::Swarm<TallyBehaviour>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<PeerEvent>,
    state: Arc<SharedState>,
) {
    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Dial(addr)) => {
                        if let Err(e) = swarm.dial(addr) {
                            debug!("dial error: {e}");
                        }
                    }
                    Some(Command::Request(request)) => {
                        let peers: Vec<PeerId> = state.peers.read().keys().copied().collect();
                        for peer in peers {
                            swarm
                                .behaviour_mut()
                                .request_response
                                .send_request(&peer, request.clone());
                        }
                    }
                    Some(Command::DisconnectAll) => {
                        let peers: Vec<PeerId> = state.peers.read().keys().copied().collect();
                        for peer in peers {
                            let _ = swarm.disconnect_peer_id(peer);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        info!("shutting down swarm event loop");
                        state.running.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
            event = swarm.next() => {
                let Some(event) = event else {
                    state.running.store(false, Ordering::Relaxed);
                    break;
                };

                match event {
                    SwarmEvent::Behaviour(behaviour::TallyBehaviourEvent::Gossipsub(
                        gossipsub::Event::Message { message, .. },
                    )) => match gossip_event(&message.data) {
                        Some(event) => {
                            let _ = events.send(event);
                        }
                        None => debug!("failed to decode gossipsub message"),
                    },

                    SwarmEvent::Behaviour(behaviour::TallyBehaviourEvent::RequestResponse(
                        event,
                    )) => {
                        match event {
                            request_response::Event::Message { peer, message } => match message {
                                request_response::Message::Request { request, channel, .. } => {
                                    debug!(%peer, ?request, "answering inbound request");
                                    let response = inbound_response(&request);
                                    let _ = swarm
                                        .behaviour_mut()
                                        .request_response
                                        .send_response(channel, response);
                                }
                                request_response::Message::Response { response, .. } => {
                                    for event in response_events(peer, response, &state) {
                                        let _ = events.send(event);
                                    }
                                }
                            },
                            request_response::Event::OutboundFailure { peer, error, .. } => {
                                warn!(%peer, %error, "outbound request failed");
                            }
                            request_response::Event::InboundFailure { peer, error, .. } => {
                                warn!(%peer, %error, "inbound request failed");
                            }
                            request_response::Event::ResponseSent { .. } => {}
                        }
                    }

                    SwarmEvent::Behaviour(behaviour::TallyBehaviourEvent::Identify(
                        identify::Event::Received { peer_id, info, .. },
                    )) => {
                        debug!(%peer_id, agent = %info.agent_version, "identify received");
                    }

                    SwarmEvent::ConnectionEstablished {
                        peer_id,
                        endpoint,
                        num_established,
                        ..
                    } => {
                        if num_established.get() == 1 {
                            state.peers.write().insert(
                                peer_id,
                                PeerSlot {
                                    address: Some(endpoint.get_remote_address().to_string()),
                                    best_height: None,
                                },
                            );
                            info!(%peer_id, count = state.peers.read().len(), "peer connected");
                            swarm
                                .behaviour_mut()
                                .request_response
                                .send_request(&peer_id, TallyRequest::GetStatus);
                        }
                    }

                    SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                        if num_established == 0 {
                            let info = state.info(&peer_id);
                            state.peers.write().remove(&peer_id);
                            let _ = events.send(PeerEvent::PeerDisconnect(info));
                        }
                    }

                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        debug!(?peer_id, %error, "outgoing connection failed");
                    }

                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(%address, "listening on");
                    }

                    SwarmEvent::ListenerError { error, .. } => {
                        error!(%error, "listener error");
                    }

                    _ => {}
                }
            }
        }
    }
}
