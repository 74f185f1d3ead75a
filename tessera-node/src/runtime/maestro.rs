use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tessera_common::encoding::Encoders;
use tessera_common::env::Seal;
use tessera_consensus::Responder;
use tessera_p2p::Inbound;

/// Sits between the wire and the orchestrator: inbound seal bytes are decoded
/// and queued for consensus, inbound requests are answered from storage.
pub struct Maestro {
    encoders: Encoders,
    seals: mpsc::Sender<Seal>,
    responder: Arc<Responder>,
}

impl Maestro {
    pub fn new(encoders: Encoders, seals: mpsc::Sender<Seal>, responder: Responder) -> Self {
        Self { encoders, seals, responder: Arc::new(responder) }
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<Inbound>) {
        while let Some(msg) = inbound.recv().await {
            match msg {
                Inbound::Seal { from, bytes } => {
                    let seal = match self.encoders.decode_seal(&bytes) {
                        Ok(seal) => seal,
                        Err(e) => {
                            warn!(target: "p2p", from = ?from, error = %e, "undecodable seal dropped");
                            continue;
                        }
                    };
                    // a full queue pushes back on the transport instead of dropping
                    if self.seals.send(seal).await.is_err() {
                        info!(target: "p2p", "seals queue closed, maestro stops");
                        return;
                    }
                }
                Inbound::Request { from, request, reply } => {
                    let responder = self.responder.clone();
                    tokio::spawn(async move {
                        let kind = request.kind();
                        let response = match tokio::task::spawn_blocking(move || responder.respond(request)).await {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(target: "p2p", error = %e, "responder task failed");
                                return;
                            }
                        };
                        if reply.send(response).is_err() {
                            debug!(target: "p2p", from = ?from, request = kind, "requester went away");
                        }
                    });
                }
            }
        }
        debug!(target: "p2p", "inbound closed, maestro stops");
    }
}
