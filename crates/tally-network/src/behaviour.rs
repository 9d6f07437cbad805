//! Composite libp2p [`NetworkBehaviour`] for the Tally peer protocol.
//!
//! Gossipsub carries inventory, blocks, and loose transactions. Identify
//! exchanges listen addresses. Request-response carries header and block
//! fetches to a specific trusted peer.

use crate::protocol::{MAX_MESSAGE_SIZE, TallyCodec};
use libp2p::gossipsub;
use libp2p::identify;
use libp2p::identity::Keypair;
use libp2p::request_response;
use libp2p::swarm::NetworkBehaviour;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Protocol version string used in Identify.
pub const PROTOCOL_VERSION: &str = "/tally/1.0.0";

#[derive(NetworkBehaviour)]
pub struct TallyBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub request_response: request_response::Behaviour<TallyCodec>,
}

/// Build a gossipsub behaviour with content-addressed message IDs.
///
/// Identical payloads from different peers collapse to one message ID, so a
/// block relayed by every trusted peer is delivered once.
pub fn build_gossipsub(
    keypair: &Keypair,
    heartbeat: Duration,
) -> Result<gossipsub::Behaviour, String> {
    let message_id_fn = |message: &gossipsub::Message| {
        let hash = Sha256::digest(&message.data);
        gossipsub::MessageId::from(hash.to_vec())
    };

    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(heartbeat)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(MAX_MESSAGE_SIZE)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|e| format!("gossipsub config error: {e}"))?;

    gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        config,
    )
    .map_err(|e| format!("gossipsub behaviour error: {e}"))
}
