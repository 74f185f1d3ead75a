use libp2p::{
    gossipsub::{self, IdentTopic},
    identify,
    kad::{self, store::MemoryStore},
    ping,
    request_response,
    swarm::NetworkBehaviour,
};

use crate::codec::SyncCodec;
use crate::error::P2pError;

/// Gossipsub topic carrying every broadcast seal.
pub const SEAL_TOPIC: &str = "tessera/seal/v1";
/// Request/response protocol for sync and point-to-point delivery.
pub const SYNC_PROTOCOL: &str = "/tessera/sync/1";
pub const IDENTIFY_PROTOCOL: &str = "tessera/1.0";

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "crate::events::ComposedEvent")]
pub struct TesseraBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub kad: kad::Behaviour<MemoryStore>,
    pub gossipsub: gossipsub::Behaviour,
    pub rr: request_response::Behaviour<SyncCodec>,
}

impl TesseraBehaviour {
    pub fn subscribe_seal_topic(&mut self) -> Result<(), P2pError> {
        let topic = IdentTopic::new(SEAL_TOPIC);
        self.gossipsub.subscribe(&topic)?;
        tracing::debug!(target: "p2p", topic = %topic.hash(), "gossipsub subscribed");
        Ok(())
    }
}
