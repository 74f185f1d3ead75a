use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use tessera_common::error::Result;
use tessera_common::utils::Address;

use crate::protocol::{SyncRequest, SyncResponse};

/// Default budget for a request/response round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Something arriving from a peer.
#[derive(Debug)]
pub enum Inbound {
    Seal {
        from: Option<Address>,
        bytes: Vec<u8>,
    },
    Request {
        from: Option<Address>,
        request: SyncRequest,
        reply: oneshot::Sender<SyncResponse>,
    },
}

/// Outbound side of the wire. Inbound traffic is handed out as a channel of
/// [`Inbound`] when the transport is created.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Best effort delivery to every known peer except the local node.
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<()>;

    async fn send(&self, node: &Address, bytes: Vec<u8>) -> Result<()>;

    async fn request(&self, node: &Address, request: SyncRequest) -> Result<SyncResponse>;

    /// Peers this transport can reach, the local node excluded.
    fn peers(&self) -> Vec<Address>;
}
