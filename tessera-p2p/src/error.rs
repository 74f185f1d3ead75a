use thiserror::Error;

use tessera_common::error::TesseraError;

/// Failures while building or driving the libp2p swarm.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("gossipsub subscribe failed: {0}")]
    Gossipsub(#[from] libp2p::gossipsub::SubscriptionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid multiaddr: {0}")]
    Multiaddr(#[from] libp2p::multiaddr::Error),

    #[error("transport error: {0}")]
    Transport(#[from] libp2p::TransportError<std::io::Error>),

    #[error("dial error: {0}")]
    Dial(#[from] libp2p::swarm::DialError),

    #[error("noise error: {0}")]
    Noise(#[from] libp2p::noise::Error),

    #[error("gossipsub init error: {0}")]
    GossipsubInit(&'static str),

    #[error("node url {0} has no /p2p/ peer id")]
    MissingPeerId(String),
}

/// Failures of a single send or request.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to send message to {0}")]
    SendError(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("request to {0} failed: {1}")]
    RequestFailed(String, String),

    #[error("transport closed")]
    Closed,
}

impl From<P2pError> for TesseraError {
    fn from(e: P2pError) -> Self {
        TesseraError::Network(e.to_string())
    }
}

impl From<NetworkError> for TesseraError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Timeout(peer) => TesseraError::Timeout(format!("request to {peer}")),
            other => TesseraError::Network(other.to_string()),
        }
    }
}
