use serde::{Deserialize, Serialize};

use crate::crypto::Hash;
use crate::env::types::Height;
use crate::error::{Result, TesseraError};
use crate::hint::{self, Hint, Hinted, V0_0_1};
use crate::utils::concat_bytes;

/// A key/value entry of chain state as of `height`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub hint: Hint,
    pub key: String,
    pub value: Vec<u8>,
    pub height: Height,
    /// Height of the previous version, `PRE_GENESIS` if the key is new.
    pub previous_height: Height,
    /// Fact hashes of the operations that produced this version.
    pub operations: Vec<Hash>,
    pub hash: Hash,
}

impl State {
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        height: Height,
        previous_height: Height,
        operations: Vec<Hash>,
    ) -> Self {
        let mut st = State {
            hint: Hint::new(hint::STATE_TYPE, V0_0_1),
            key: key.into(),
            value,
            height,
            previous_height,
            operations,
            hash: Hash::zero(),
        };
        st.hash = st.generate_hash();
        st
    }

    pub fn generate_hash(&self) -> Hash {
        let ops: Vec<&[u8]> = self.operations.iter().map(|h| h.as_bytes()).collect();
        Hash::sha256_parts(&[
            self.key.as_bytes(),
            &self.value,
            &self.height.bytes(),
            &self.previous_height.bytes(),
            &concat_bytes(&ops),
        ])
    }

    pub fn is_valid(&self) -> Result<()> {
        Hint::new(hint::STATE_TYPE, V0_0_1).is_compatible(&self.hint)?;
        if self.key.is_empty() {
            return Err(TesseraError::Invalid("state with empty key".into()));
        }
        if self.previous_height >= self.height {
            return Err(TesseraError::Invalid(format!(
                "state {} previous height {} is not below {}",
                self.key, self.previous_height, self.height
            )));
        }
        if self.hash != self.generate_hash() {
            return Err(TesseraError::Invalid(format!("state {} hash does not match", self.key)));
        }
        Ok(())
    }
}

impl Hinted for State {
    fn hint(&self) -> &Hint {
        &self.hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hash_and_validity() {
        let st = State::new("k", b"v".to_vec(), Height(3), Height::PRE_GENESIS, vec![Hash::sha256(b"op")]);
        assert!(st.is_valid().is_ok());

        let mut changed = st.clone();
        changed.value = b"w".to_vec();
        assert!(changed.is_valid().is_err());

        let stale = State::new("k", b"v".to_vec(), Height(3), Height(3), vec![]);
        assert!(stale.is_valid().is_err());
    }
}
