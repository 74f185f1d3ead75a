//! Answers peers' requests from local storage.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use tessera_common::encoding::Encoders;
use tessera_common::error::Result;
use tessera_ledger::Storage;
use tessera_p2p::{NodeInfo, SyncRequest, SyncResponse};

use crate::local::{LocalNode, LocalState};
use crate::states::StateKind;

/// Upper bound on items returned by one request.
pub const MAX_ITEMS: usize = 100;

#[derive(Debug, Clone)]
pub struct Responder {
    local: LocalNode,
    storage: Arc<dyn Storage>,
    encoders: Encoders,
    state: LocalState,
    kind: watch::Receiver<StateKind>,
}

impl Responder {
    pub fn new(
        local: LocalNode,
        storage: Arc<dyn Storage>,
        encoders: Encoders,
        state: LocalState,
        kind: watch::Receiver<StateKind>,
    ) -> Self {
        Self { local, storage, encoders, state, kind }
    }

    pub fn respond(&self, request: SyncRequest) -> SyncResponse {
        let kind = request.kind();
        match self.answer(request) {
            Ok(r) => r,
            Err(e) => {
                debug!(target: "p2p", request = kind, error = %e, "request failed");
                SyncResponse::Error(e.to_string())
            }
        }
    }

    fn answer(&self, request: SyncRequest) -> Result<SyncResponse> {
        let storage = self.storage.as_ref();
        let enc = &self.encoders;
        Ok(match request {
            SyncRequest::Deliver(_) => SyncResponse::Error("seals are delivered on the seal channel".into()),
            SyncRequest::Seals(hashes) => {
                let mut out = Vec::new();
                for h in hashes.iter().take(MAX_ITEMS) {
                    if let Some(seal) = storage.seal_by_hash(h)? {
                        out.push(enc.encode_seal(&seal)?);
                    }
                }
                SyncResponse::Seals(out)
            }
            SyncRequest::Proposal(hash) => match storage.proposal(&hash)? {
                Some(ballot) => SyncResponse::Proposal(Some(enc.encode_seal(&ballot.into())?)),
                None => SyncResponse::Proposal(None),
            },
            SyncRequest::Operations(hashes) => {
                let mut out = Vec::new();
                for h in hashes.iter().take(MAX_ITEMS) {
                    if let Some(op) = storage.operation(h)? {
                        out.push(enc.encode(&op)?);
                    }
                }
                SyncResponse::Operations(out)
            }
            SyncRequest::Manifests(heights) => {
                let mut out = Vec::new();
                for h in heights.iter().take(MAX_ITEMS) {
                    match storage.manifest_by_height(*h)? {
                        Some(m) => out.push(enc.encode(&m)?),
                        None => break,
                    }
                }
                SyncResponse::Manifests(out)
            }
            SyncRequest::Blocks(heights) => {
                let mut out = Vec::new();
                for h in heights.iter().take(MAX_ITEMS) {
                    match storage.block_by_height(*h)? {
                        Some(b) => out.push(enc.encode(&b)?),
                        None => break,
                    }
                }
                SyncResponse::Blocks(out)
            }
            SyncRequest::NodeInfo => {
                let snap = self.state.snapshot();
                SyncResponse::NodeInfo(NodeInfo {
                    address: self.local.address.clone(),
                    publickey: self.local.publickey(),
                    network_id: snap.policy.network_id.clone(),
                    state: self.kind.borrow().to_string(),
                    last_manifest: snap.last_manifest,
                    policy: snap.policy.consensus,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tessera_common::encoding::{Decoded, EncoderKind};
    use tessera_common::env::Height;
    use tessera_ledger::MemoryStorage;

    fn responder() -> Responder {
        let node = testing::nodes(1).remove(0);
        let (_tx, rx) = watch::channel(StateKind::Consensus);
        Responder::new(
            node,
            Arc::new(MemoryStorage::new()),
            Encoders::new(EncoderKind::Bincode),
            LocalState::new(testing::policy()),
            rx,
        )
    }

    #[test]
    fn test_node_info() {
        let r = responder();
        match r.respond(SyncRequest::NodeInfo) {
            SyncResponse::NodeInfo(info) => {
                assert_eq!(info.address.as_str(), "n0");
                assert_eq!(info.state, "CONSENSUS");
                assert!(info.last_manifest.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_data_is_left_out() {
        let r = responder();
        assert_eq!(r.respond(SyncRequest::Manifests(vec![Height(0)])), SyncResponse::Manifests(vec![]));
        assert_eq!(r.respond(SyncRequest::Proposal(testing::hash("p"))), SyncResponse::Proposal(None));
        assert!(matches!(r.respond(SyncRequest::Deliver(vec![])), SyncResponse::Error(_)));
    }

    #[test]
    fn test_operations_are_encoded() {
        let r = responder();
        let node = testing::nodes(1).remove(0);
        let op = testing::kv_operation(&node, "t1", "k", "v");
        r.storage.new_operations(std::slice::from_ref(&op)).unwrap();

        let SyncResponse::Operations(list) = r.respond(SyncRequest::Operations(vec![op.hash])) else {
            panic!("expected operations");
        };
        assert_eq!(list.len(), 1);
        assert!(matches!(r.encoders.decode(&list[0]).unwrap(), Decoded::Operation(o) if o == op));
    }
}
