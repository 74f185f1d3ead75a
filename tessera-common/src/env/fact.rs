//! Signatures over facts.
//!
//! A fact is never signed directly: the signed message is
//! `fact_hash ∥ network_id`, so a sign can not be replayed on another chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Privatekey, Publickey, Signature};
use crate::env::types::NetworkId;
use crate::error::Result;
use crate::utils::{concat_bytes, time};

pub fn fact_sign_message(fact_hash: &Hash, network_id: &NetworkId) -> Vec<u8> {
    concat_bytes(&[fact_hash.as_bytes(), network_id.as_bytes()])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSign {
    pub signer: Publickey,
    pub signature: Signature,
    pub signed_at: DateTime<Utc>,
}

impl FactSign {
    pub fn new(privatekey: &Privatekey, fact_hash: &Hash, network_id: &NetworkId) -> Result<Self> {
        let signature = privatekey.sign(&fact_sign_message(fact_hash, network_id))?;
        Ok(FactSign {
            signer: privatekey.publickey(),
            signature,
            signed_at: time::utc_now(),
        })
    }

    /// `signer ∥ signature ∥ rfc3339(signed_at)`
    pub fn bytes(&self) -> Vec<u8> {
        concat_bytes(&[
            self.signer.bytes(),
            self.signature.as_bytes(),
            &time::rfc3339_bytes(&self.signed_at),
        ])
    }

    pub fn is_valid(&self, fact_hash: &Hash, network_id: &NetworkId) -> Result<()> {
        self.signer
            .verify(&fact_sign_message(fact_hash, network_id), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TesseraError;

    #[test]
    fn test_fact_sign_binds_network() {
        let pk = Privatekey::new_btc();
        let fact = Hash::sha256(b"fact");
        let net = NetworkId::new("net-a");

        let fs = FactSign::new(&pk, &fact, &net).unwrap();
        assert!(fs.is_valid(&fact, &net).is_ok());

        let err = fs.is_valid(&fact, &NetworkId::new("net-b")).unwrap_err();
        assert!(matches!(err, TesseraError::SignatureInvalid(_)));
        assert!(fs.is_valid(&Hash::sha256(b"other"), &net).is_err());
    }

    #[test]
    fn test_bytes_change_with_signed_at() {
        let pk = Privatekey::new_btc();
        let fact = Hash::sha256(b"fact");
        let net = NetworkId::new("n");
        let a = FactSign::new(&pk, &fact, &net).unwrap();
        let mut b = a.clone();
        b.signed_at = a.signed_at + chrono::Duration::seconds(1);
        assert_ne!(a.bytes(), b.bytes());
    }
}
