//! Wire layer for a tessera node.
//!
//! Consensus only sees the [`Transport`] port and a channel of [`Inbound`]
//! messages. Two implementations exist: [`InMemoryNetwork`] for clusters
//! inside one process and [`Libp2pAdapter`] for real deployments.

pub mod adapter;
pub mod behaviour;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod in_memory;
pub mod key_manager;
pub mod ports;
pub mod protocol;

pub use adapter::{AdapterHandle, Libp2pAdapter, PeerBook};
pub use config::{P2pConfig, PeerEntry};
pub use error::{NetworkError, P2pError};
pub use in_memory::{InMemoryNetwork, InMemoryTransport, OutboundFilter};
pub use ports::{Inbound, Transport};
pub use protocol::{NodeInfo, SyncRequest, SyncResponse};
