use libp2p::{gossipsub, identify, kad, ping, request_response};

use crate::protocol::{SyncRequest, SyncResponse};

#[derive(Debug)]
pub enum ComposedEvent {
    Identify(identify::Event),
    Ping(ping::Event),
    Kad(kad::Event),
    Gossipsub(gossipsub::Event),
    ReqRes(request_response::Event<SyncRequest, SyncResponse>),
}

impl From<identify::Event> for ComposedEvent {
    fn from(e: identify::Event) -> Self {
        Self::Identify(e)
    }
}

impl From<ping::Event> for ComposedEvent {
    fn from(e: ping::Event) -> Self {
        Self::Ping(e)
    }
}

impl From<kad::Event> for ComposedEvent {
    fn from(e: kad::Event) -> Self {
        Self::Kad(e)
    }
}

impl From<gossipsub::Event> for ComposedEvent {
    fn from(e: gossipsub::Event) -> Self {
        Self::Gossipsub(e)
    }
}

impl From<request_response::Event<SyncRequest, SyncResponse>> for ComposedEvent {
    fn from(e: request_response::Event<SyncRequest, SyncResponse>) -> Self {
        Self::ReqRes(e)
    }
}
