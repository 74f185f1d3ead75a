use serde::{Deserialize, Serialize};

use crate::env::types::ThresholdRatio;
use crate::error::{Result, TesseraError};
use crate::utils::concat_bytes;

/// State key holding the chain-wide consensus policy.
pub const POLICY_STATE_KEY: &str = "network_policy";

/// Chain-wide policy, recorded in the genesis block and changeable by a
/// `set-policy` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    pub threshold: ThresholdRatio,
    pub number_of_acting_suffrage_nodes: u32,
    pub max_operations_in_seal: u32,
    pub max_operations_in_proposal: u32,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            threshold: ThresholdRatio::DEFAULT,
            number_of_acting_suffrage_nodes: 1,
            max_operations_in_seal: 100,
            max_operations_in_proposal: 100,
        }
    }
}

impl ConsensusPolicy {
    pub fn bytes(&self) -> Vec<u8> {
        concat_bytes(&[
            &self.threshold.bytes(),
            &self.number_of_acting_suffrage_nodes.to_be_bytes(),
            &self.max_operations_in_seal.to_be_bytes(),
            &self.max_operations_in_proposal.to_be_bytes(),
        ])
    }

    /// Inverse of [`ConsensusPolicy::bytes`], used to read the policy state.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != 20 {
            return Err(TesseraError::Encoding(format!("policy bytes have length {}", b.len())));
        }
        let word = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        let mut ratio = [0u8; 8];
        ratio.copy_from_slice(&b[..8]);
        let policy = ConsensusPolicy {
            threshold: ThresholdRatio::new(f64::from_be_bytes(ratio))?,
            number_of_acting_suffrage_nodes: word(8),
            max_operations_in_seal: word(12),
            max_operations_in_proposal: word(16),
        };
        policy.is_valid()?;
        Ok(policy)
    }

    pub fn is_valid(&self) -> Result<()> {
        self.threshold.is_valid()?;
        if !self.threshold.is_safe() {
            return Err(TesseraError::Invalid(format!(
                "threshold {} allows two disjoint majorities",
                self.threshold.value()
            )));
        }
        if self.number_of_acting_suffrage_nodes < 1 {
            return Err(TesseraError::Invalid("number_of_acting_suffrage_nodes must be >= 1".into()));
        }
        if self.max_operations_in_seal < 1 || self.max_operations_in_proposal < 1 {
            return Err(TesseraError::Invalid("operation limits must be >= 1".into()));
        }
        Ok(())
    }
}
