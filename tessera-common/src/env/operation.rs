//! Operations: signed commands applied to chain state.
//!
//! Fact bytes per kind:
//! * `kv-set`: `len(token) ∥ token ∥ len(key) ∥ key ∥ len(value) ∥ value`
//! * `set-policy`: `len(token) ∥ token ∥ len(policy) ∥ policy.bytes()`
//!
//! Lengths are big-endian u64.
//!
//! The operation hash is `sha256(fact_hash ∥ sign_0.bytes ∥ sign_1.bytes ...)`
//! with signs ordered by signer public-key bytes.

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Privatekey, Publickey};
use crate::env::fact::FactSign;
use crate::env::policy::ConsensusPolicy;
use crate::env::types::NetworkId;
use crate::error::{Result, TesseraError};
use crate::hint::{self, Hint, Hinted, V0_0_1};
use crate::utils::concat_prefixed;

pub const MAX_TOKEN_SIZE: usize = 100;
pub const MAX_KEY_SIZE: usize = 256;

fn check_token(token: &[u8]) -> Result<()> {
    if token.is_empty() || token.len() > MAX_TOKEN_SIZE {
        return Err(TesseraError::Invalid(format!(
            "token length must be 1..={MAX_TOKEN_SIZE}, got {}",
            token.len()
        )));
    }
    Ok(())
}

fn check_fact_hint(hint: &Hint, expected: &str) -> Result<()> {
    Hint::new(expected, V0_0_1).is_compatible(hint)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSetFact {
    pub hint: Hint,
    pub token: Vec<u8>,
    pub key: String,
    pub value: Vec<u8>,
    pub hash: Hash,
}

impl KvSetFact {
    pub fn new(token: impl Into<Vec<u8>>, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<Self> {
        let mut f = KvSetFact {
            hint: Hint::new(hint::KV_SET_FACT_TYPE, V0_0_1),
            token: token.into(),
            key: key.into(),
            value: value.into(),
            hash: Hash::zero(),
        };
        f.hash = f.generate_hash();
        f.is_valid()?;
        Ok(f)
    }

    pub fn bytes(&self) -> Vec<u8> {
        concat_prefixed(&[&self.token, self.key.as_bytes(), &self.value])
    }

    pub fn generate_hash(&self) -> Hash {
        Hash::sha256(&self.bytes())
    }

    pub fn is_valid(&self) -> Result<()> {
        check_fact_hint(&self.hint, hint::KV_SET_FACT_TYPE)?;
        check_token(&self.token)?;
        if self.key.is_empty() || self.key.len() > MAX_KEY_SIZE {
            return Err(TesseraError::Invalid(format!("bad state key length: {}", self.key.len())));
        }
        if self.hash != self.generate_hash() {
            return Err(TesseraError::Invalid("kv-set fact hash does not match".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPolicyFact {
    pub hint: Hint,
    pub token: Vec<u8>,
    pub policy: ConsensusPolicy,
    pub hash: Hash,
}

impl SetPolicyFact {
    pub fn new(token: impl Into<Vec<u8>>, policy: ConsensusPolicy) -> Result<Self> {
        let mut f = SetPolicyFact {
            hint: Hint::new(hint::SET_POLICY_FACT_TYPE, V0_0_1),
            token: token.into(),
            policy,
            hash: Hash::zero(),
        };
        f.hash = f.generate_hash();
        f.is_valid()?;
        Ok(f)
    }

    pub fn bytes(&self) -> Vec<u8> {
        concat_prefixed(&[&self.token, &self.policy.bytes()])
    }

    pub fn generate_hash(&self) -> Hash {
        Hash::sha256(&self.bytes())
    }

    pub fn is_valid(&self) -> Result<()> {
        check_fact_hint(&self.hint, hint::SET_POLICY_FACT_TYPE)?;
        check_token(&self.token)?;
        self.policy.is_valid()?;
        if self.hash != self.generate_hash() {
            return Err(TesseraError::Invalid("set-policy fact hash does not match".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationFact {
    KvSet(KvSetFact),
    SetPolicy(SetPolicyFact),
}

impl OperationFact {
    pub fn hash(&self) -> Hash {
        match self {
            OperationFact::KvSet(f) => f.hash,
            OperationFact::SetPolicy(f) => f.hash,
        }
    }

    pub fn token(&self) -> &[u8] {
        match self {
            OperationFact::KvSet(f) => &f.token,
            OperationFact::SetPolicy(f) => &f.token,
        }
    }

    pub fn is_valid(&self) -> Result<()> {
        match self {
            OperationFact::KvSet(f) => f.is_valid(),
            OperationFact::SetPolicy(f) => f.is_valid(),
        }
    }
}

impl Hinted for OperationFact {
    fn hint(&self) -> &Hint {
        match self {
            OperationFact::KvSet(f) => &f.hint,
            OperationFact::SetPolicy(f) => &f.hint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub hint: Hint,
    pub fact: OperationFact,
    pub signs: Vec<FactSign>,
    pub hash: Hash,
}

impl Operation {
    pub fn new(fact: OperationFact, signer: &Privatekey, network_id: &NetworkId) -> Result<Self> {
        fact.is_valid()?;
        let sign = FactSign::new(signer, &fact.hash(), network_id)?;
        let mut op = Operation {
            hint: Hint::new(hint::OPERATION_TYPE, V0_0_1),
            fact,
            signs: vec![sign],
            hash: Hash::zero(),
        };
        op.hash = op.generate_hash();
        Ok(op)
    }

    pub fn fact_hash(&self) -> Hash {
        self.fact.hash()
    }

    /// Public keys of every fact signer; replay protection records the
    /// token under each of them.
    pub fn signers(&self) -> impl Iterator<Item = &Publickey> + '_ {
        self.signs.iter().map(|s| &s.signer)
    }

    pub fn generate_hash(&self) -> Hash {
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(self.signs.len() + 1);
        parts.push(self.fact.hash().as_bytes().to_vec());
        parts.extend(self.signs.iter().map(|s| s.bytes()));
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Hash::sha256_parts(&refs)
    }

    /// Returns a copy with `signs` merged in. A sign from an existing signer
    /// replaces the old one; new signers are added. The hash is regenerated.
    pub fn add_fact_signs(&self, signs: Vec<FactSign>) -> Result<Operation> {
        let mut op = self.clone();
        for sign in signs {
            match op.signs.iter_mut().find(|s| s.signer == sign.signer) {
                Some(existing) => *existing = sign,
                None => op.signs.push(sign),
            }
        }
        op.signs.sort_by(|a, b| a.signer.bytes().cmp(b.signer.bytes()));
        op.hash = op.generate_hash();
        Ok(op)
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        Hint::new(hint::OPERATION_TYPE, V0_0_1).is_compatible(&self.hint)?;
        self.fact.is_valid()?;

        if self.signs.is_empty() {
            return Err(TesseraError::Invalid("operation without fact signs".into()));
        }
        let fact_hash = self.fact.hash();
        for (i, s) in self.signs.iter().enumerate() {
            s.is_valid(&fact_hash, network_id)?;
            if let Some(next) = self.signs.get(i + 1) {
                if s.signer.bytes() >= next.signer.bytes() {
                    return Err(TesseraError::Invalid(
                        "fact signs must be unique and ordered by signer".into(),
                    ));
                }
            }
        }

        if self.hash != self.generate_hash() {
            return Err(TesseraError::Invalid("operation hash does not match".into()));
        }
        Ok(())
    }
}

impl Hinted for Operation {
    fn hint(&self) -> &Hint {
        &self.hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> NetworkId {
        NetworkId::new("test-net")
    }

    fn kv_op(pk: &Privatekey) -> Operation {
        let fact = KvSetFact::new("token-1", "k", "v").unwrap();
        Operation::new(OperationFact::KvSet(fact), pk, &net()).unwrap()
    }

    #[test]
    fn test_operation_is_valid() {
        let pk = Privatekey::new_btc();
        let op = kv_op(&pk);
        assert!(op.is_valid(&net()).is_ok());
        assert_eq!(op.generate_hash(), op.hash);
        assert!(op.is_valid(&NetworkId::new("other")).is_err());
    }

    #[test]
    fn test_same_signer_replaces_sign() {
        let pk = Privatekey::new_btc();
        let op = kv_op(&pk);

        let mut v2 = FactSign::new(&pk, &op.fact_hash(), &net()).unwrap();
        v2.signed_at = op.signs[0].signed_at + chrono::Duration::seconds(5);

        let updated = op.add_fact_signs(vec![v2.clone()]).unwrap();
        assert_eq!(updated.signs.len(), 1);
        assert_eq!(updated.signs[0], v2);
        assert_ne!(updated.hash, op.hash);
        assert!(updated.is_valid(&net()).is_ok());
    }

    #[test]
    fn test_new_signer_is_added_in_order() {
        let a = Privatekey::new_btc();
        let b = Privatekey::new_btc();
        let op = kv_op(&a);
        let sb = FactSign::new(&b, &op.fact_hash(), &net()).unwrap();

        let updated = op.add_fact_signs(vec![sb]).unwrap();
        assert_eq!(updated.signs.len(), 2);
        assert!(updated.signs[0].signer.bytes() < updated.signs[1].signer.bytes());
        assert!(updated.is_valid(&net()).is_ok());
    }

    #[test]
    fn test_tampered_fact_is_invalid() {
        let pk = Privatekey::new_btc();
        let mut op = kv_op(&pk);
        if let OperationFact::KvSet(f) = &mut op.fact {
            f.value = b"evil".to_vec();
        }
        assert!(op.is_valid(&net()).is_err());
    }

    #[test]
    fn test_token_limits() {
        assert!(KvSetFact::new(Vec::new(), "k", "v").is_err());
        assert!(KvSetFact::new(vec![1u8; MAX_TOKEN_SIZE + 1], "k", "v").is_err());
        assert!(KvSetFact::new(vec![1u8; MAX_TOKEN_SIZE], "k", "v").is_ok());
        assert!(KvSetFact::new("t", "", "v").is_err());
    }

    #[test]
    fn test_shifted_field_boundary_changes_fact_hash() {
        let a = KvSetFact::new("t1", "k", "v").unwrap();
        let b = KvSetFact::new("t", "1k", "v").unwrap();
        assert_ne!(a.hash, b.hash);

        // a sign over one fact must not validate for the other
        let pk = Privatekey::new_btc();
        let op = Operation::new(OperationFact::KvSet(a), &pk, &net()).unwrap();
        let mut swapped = op.clone();
        swapped.fact = OperationFact::KvSet(b);
        swapped.hash = swapped.generate_hash();
        assert!(swapped.is_valid(&net()).is_err());

        let c = KvSetFact::new("t", "k", "1v").unwrap();
        let d = KvSetFact::new("t", "k1", "v").unwrap();
        assert_ne!(c.hash, d.hash);
    }

    #[test]
    fn test_set_policy_fact_token_is_delimited() {
        let a = SetPolicyFact::new("t", ConsensusPolicy::default()).unwrap();
        assert_eq!(&a.bytes()[..8], &1u64.to_be_bytes());
        assert_eq!(&a.bytes()[8..9], b"t");
    }
}
