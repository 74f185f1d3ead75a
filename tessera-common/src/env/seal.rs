//! Signed envelopes.
//!
//! `body_hash = sha256(signer ∥ rfc3339(signed_at) ∥ payload)`, the signature
//! covers `body_hash ∥ network_id` and `hash = sha256(body_hash ∥ signature)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Privatekey, Publickey, Signature};
use crate::env::ballot::Ballot;
use crate::env::operation::Operation;
use crate::env::types::NetworkId;
use crate::error::{Result, TesseraError};
use crate::hint::{self, Hint, Hinted, V0_0_1};
use crate::utils::{concat_bytes, time};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealHeader {
    pub signer: Publickey,
    pub signature: Signature,
    pub signed_at: DateTime<Utc>,
    pub body_hash: Hash,
    pub hash: Hash,
}

impl SealHeader {
    fn body_hash(signer: &Publickey, signed_at: &DateTime<Utc>, payload: &[u8]) -> Hash {
        Hash::sha256_parts(&[signer.bytes(), &time::rfc3339_bytes(signed_at), payload])
    }

    pub fn sign(privatekey: &Privatekey, payload: &[u8], network_id: &NetworkId) -> Result<Self> {
        let signer = privatekey.publickey();
        let signed_at = time::utc_now();
        let body_hash = Self::body_hash(&signer, &signed_at, payload);
        let signature = privatekey.sign(&concat_bytes(&[body_hash.as_bytes(), network_id.as_bytes()]))?;
        let hash = Hash::sha256_parts(&[body_hash.as_bytes(), signature.as_bytes()]);
        Ok(SealHeader { signer, signature, signed_at, body_hash, hash })
    }

    pub fn is_valid(&self, payload: &[u8], network_id: &NetworkId) -> Result<()> {
        if self.body_hash != Self::body_hash(&self.signer, &self.signed_at, payload) {
            return Err(TesseraError::Invalid("seal body hash does not match".into()));
        }
        self.signer.verify(
            &concat_bytes(&[self.body_hash.as_bytes(), network_id.as_bytes()]),
            &self.signature,
        )?;
        if self.hash != Hash::sha256_parts(&[self.body_hash.as_bytes(), self.signature.as_bytes()]) {
            return Err(TesseraError::Invalid("seal hash does not match".into()));
        }
        Ok(())
    }
}

/// Seal carrying operations from clients or other nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSeal {
    pub hint: Hint,
    pub operations: Vec<Operation>,
    pub header: SealHeader,
}

impl OperationSeal {
    fn payload(operations: &[Operation]) -> Vec<u8> {
        let hashes: Vec<&[u8]> = operations.iter().map(|o| o.hash.as_bytes()).collect();
        concat_bytes(&hashes)
    }

    pub fn new(operations: Vec<Operation>, privatekey: &Privatekey, network_id: &NetworkId) -> Result<Self> {
        let header = SealHeader::sign(privatekey, &Self::payload(&operations), network_id)?;
        Ok(OperationSeal {
            hint: Hint::new(hint::OPERATION_SEAL_TYPE, V0_0_1),
            operations,
            header,
        })
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        Hint::new(hint::OPERATION_SEAL_TYPE, V0_0_1).is_compatible(&self.hint)?;
        if self.operations.is_empty() {
            return Err(TesseraError::Invalid("operation seal without operations".into()));
        }
        for op in &self.operations {
            op.is_valid(network_id)?;
        }
        self.header.is_valid(&Self::payload(&self.operations), network_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Seal {
    Ballot(Box<Ballot>),
    Operation(OperationSeal),
}

impl Seal {
    pub fn header(&self) -> &SealHeader {
        match self {
            Seal::Ballot(b) => &b.header,
            Seal::Operation(s) => &s.header,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header().hash
    }

    pub fn signer(&self) -> &Publickey {
        &self.header().signer
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.header().signed_at
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        match self {
            Seal::Ballot(b) => b.is_valid(network_id),
            Seal::Operation(s) => s.is_valid(network_id),
        }
    }

    pub fn hint(&self) -> &Hint {
        match self {
            Seal::Ballot(b) => &b.hint,
            Seal::Operation(s) => &s.hint,
        }
    }

    pub fn as_ballot(&self) -> Option<&Ballot> {
        match self {
            Seal::Ballot(b) => Some(b),
            Seal::Operation(_) => None,
        }
    }
}

impl Hinted for OperationSeal {
    fn hint(&self) -> &Hint {
        &self.hint
    }
}

impl From<Ballot> for Seal {
    fn from(b: Ballot) -> Self {
        Seal::Ballot(Box::new(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::operation::{KvSetFact, OperationFact};

    #[test]
    fn test_operation_seal_is_valid() {
        let pk = Privatekey::new_btc();
        let net = NetworkId::new("n");
        let op = Operation::new(OperationFact::KvSet(KvSetFact::new("t", "k", "v").unwrap()), &pk, &net).unwrap();
        let seal = OperationSeal::new(vec![op], &pk, &net).unwrap();
        assert!(seal.is_valid(&net).is_ok());

        let as_seal = Seal::Operation(seal.clone());
        assert_eq!(as_seal.hash(), seal.header.hash);
        assert!(as_seal.as_ballot().is_none());
    }

    #[test]
    fn test_header_detects_tampering() {
        let pk = Privatekey::new_btc();
        let net = NetworkId::new("n");
        let h = SealHeader::sign(&pk, b"payload", &net).unwrap();
        assert!(h.is_valid(b"payload", &net).is_ok());
        assert!(h.is_valid(b"payloaD", &net).is_err());
        assert!(h.is_valid(b"payload", &NetworkId::new("x")).is_err());

        let mut bad = h.clone();
        bad.hash = Hash::sha256(b"x");
        assert!(bad.is_valid(b"payload", &net).is_err());
    }
}
