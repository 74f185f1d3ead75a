//! Consensus for a tessera node.
//!
//! Nodes vote in rounds of four stages (INIT, PROPOSAL, SIGN, ACCEPT) and a
//! block is stored once a threshold of the suffrage accepted it. The
//! [`States`] orchestrator owns the node's state machine; everything else in
//! this crate is a part it drives.

pub mod ballotbox;
pub mod checker;
pub mod genesis;
pub mod hooks;
pub mod local;
pub mod orchestrator;
pub mod policy;
pub mod processor;
pub mod responder;
pub mod states;
pub mod suffrage;
pub mod syncer;
pub mod timers;

#[cfg(test)]
mod testing;

pub use ballotbox::Ballotbox;
pub use genesis::GenesisGenerator;
pub use hooks::BlockSavedHook;
pub use local::{LocalNode, LocalState, NodePool};
pub use orchestrator::{States, StatesConfig, StatesHandle};
pub use policy::{LocalPolicy, TimerPolicy};
pub use processor::operations::{OperationProcessor, OperationProcessors};
pub use processor::ProposalProcessor;
pub use responder::Responder;
pub use states::StateKind;
pub use suffrage::{FixedSuffrage, RoundrobinSuffrage, Suffrage};
