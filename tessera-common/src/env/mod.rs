//! Consensus data model: typed, hash-addressed, signed entities.

pub mod ballot;
pub mod block;
pub mod fact;
pub mod operation;
pub mod policy;
pub mod seal;
pub mod state;
pub mod types;
pub mod voteproof;

pub use ballot::{AcceptFact, Ballot, BallotFact, InitFact, ProposalFact, SignFact};
pub use block::{Block, ConsensusInfo, Manifest, SuffrageInfo};
pub use fact::FactSign;
pub use operation::{KvSetFact, Operation, OperationFact, SetPolicyFact};
pub use policy::{ConsensusPolicy, POLICY_STATE_KEY};
pub use seal::{OperationSeal, Seal, SealHeader};
pub use state::State;
pub use types::{Height, NetworkId, Round, Stage, Threshold, ThresholdRatio, VoteResult};
pub use voteproof::{Voteproof, VoteproofVote};
