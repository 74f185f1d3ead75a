use serde::{Deserialize, Serialize};

use tessera_common::utils::Address;

/// A validator and where to reach it. `url` is a multiaddr ending in
/// `/p2p/<peer-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub address: Address,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// e.g. `["/ip4/0.0.0.0/tcp/4001"]`
    pub listen_multiaddrs: Vec<String>,
    /// Extra multiaddrs dialed at start besides the known peers.
    pub bootstrap: Vec<String>,
    pub keypair_path: String,
    pub peers: Vec<PeerEntry>,
}
