//! Node and signer keys.
//!
//! Two kinds are supported: BTC-style Schnorr over secp256k1 (the default)
//! and Ed25519. Both carry 32-byte public keys and 64-byte signatures, so a
//! key is stored as its kind plus raw bytes and the concrete curve type is
//! only materialized when signing or verifying.
//!
//! Text form is `<base58>~<kind>`, e.g. `2Nf3...~btc-pub`.

use std::fmt;
use std::str::FromStr;

// `signature` 2.x traits, shared by the k256 and ed25519 key types
use ed25519_dalek::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Btc,
    Ed25519,
}

impl KeyKind {
    fn public_suffix(&self) -> &'static str {
        match self {
            KeyKind::Btc => "btc-pub",
            KeyKind::Ed25519 => "ed-pub",
        }
    }

    fn private_suffix(&self) -> &'static str {
        match self {
            KeyKind::Btc => "btc-priv",
            KeyKind::Ed25519 => "ed-priv",
        }
    }
}

fn split_key_text(s: &str) -> Result<(&str, &str)> {
    s.rsplit_once('~')
        .ok_or_else(|| TesseraError::Invalid(format!("key without kind suffix: {s:?}")))
}

fn decode_32(body: &str) -> Result<[u8; 32]> {
    let raw = bs58::decode(body)
        .into_vec()
        .map_err(|e| TesseraError::Invalid(format!("bad base58 key: {e}")))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| TesseraError::Invalid(format!("key must be 32 bytes, got {}", raw.len())))
}

/// Opaque signature bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "hex::serde")] Vec<u8>);

impl Signature {
    pub fn from_bytes(b: Vec<u8>) -> Self {
        Signature(b)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.to_string();
        write!(f, "Signature({})", &s[..s.len().min(12)])
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Publickey {
    kind: KeyKind,
    bytes: [u8; 32],
}

impl Publickey {
    pub fn from_raw(kind: KeyKind, bytes: [u8; 32]) -> Result<Self> {
        let pk = Publickey { kind, bytes };
        pk.is_valid()?;
        Ok(pk)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_valid(&self) -> Result<()> {
        match self.kind {
            KeyKind::Btc => {
                k256::schnorr::VerifyingKey::from_bytes(&self.bytes)
                    .map_err(|e| TesseraError::Invalid(format!("invalid btc public key: {e}")))?;
            }
            KeyKind::Ed25519 => {
                ed25519_dalek::VerifyingKey::from_bytes(&self.bytes)
                    .map_err(|e| TesseraError::Invalid(format!("invalid ed25519 public key: {e}")))?;
            }
        }
        Ok(())
    }

    /// Returns `SignatureInvalid` when the signature does not bind this key to `msg`.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<()> {
        match self.kind {
            KeyKind::Btc => {
                let vk = k256::schnorr::VerifyingKey::from_bytes(&self.bytes)
                    .map_err(|e| TesseraError::SignatureInvalid(e.to_string()))?;
                let sig = k256::schnorr::Signature::try_from(signature.as_bytes())
                    .map_err(|e| TesseraError::SignatureInvalid(e.to_string()))?;
                vk.verify(msg, &sig)
                    .map_err(|_| TesseraError::SignatureInvalid(format!("signer {self}")))
            }
            KeyKind::Ed25519 => {
                let vk = ed25519_dalek::VerifyingKey::from_bytes(&self.bytes)
                    .map_err(|e| TesseraError::SignatureInvalid(e.to_string()))?;
                let sig = ed25519_dalek::Signature::from_slice(signature.as_bytes())
                    .map_err(|e| TesseraError::SignatureInvalid(e.to_string()))?;
                vk.verify(msg, &sig)
                    .map_err(|_| TesseraError::SignatureInvalid(format!("signer {self}")))
            }
        }
    }
}

impl fmt::Display for Publickey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", bs58::encode(self.bytes).into_string(), self.kind.public_suffix())
    }
}

impl fmt::Debug for Publickey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Publickey({self})")
    }
}

impl FromStr for Publickey {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let (body, suffix) = split_key_text(s)?;
        let kind = match suffix {
            "btc-pub" => KeyKind::Btc,
            "ed-pub" => KeyKind::Ed25519,
            other => return Err(TesseraError::Invalid(format!("unknown public key kind: {other}"))),
        };
        Publickey::from_raw(kind, decode_32(body)?)
    }
}

impl Serialize for Publickey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Publickey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone)]
pub struct Privatekey {
    kind: KeyKind,
    secret: [u8; 32],
    public: [u8; 32],
}

impl Privatekey {
    pub fn generate(kind: KeyKind) -> Self {
        match kind {
            KeyKind::Btc => {
                let sk = k256::schnorr::SigningKey::random(&mut OsRng);
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&sk.to_bytes());
                let mut public = [0u8; 32];
                public.copy_from_slice(&sk.verifying_key().to_bytes());
                Privatekey { kind, secret, public }
            }
            KeyKind::Ed25519 => {
                let sk = ed25519_dalek::SigningKey::generate(&mut OsRng);
                Privatekey { kind, secret: sk.to_bytes(), public: sk.verifying_key().to_bytes() }
            }
        }
    }

    /// New BTC-style key, the default kind for nodes.
    pub fn new_btc() -> Self {
        Self::generate(KeyKind::Btc)
    }

    pub fn from_raw(kind: KeyKind, secret: [u8; 32]) -> Result<Self> {
        let public = match kind {
            KeyKind::Btc => {
                let sk = k256::schnorr::SigningKey::from_bytes(&secret)
                    .map_err(|e| TesseraError::Invalid(format!("invalid btc private key: {e}")))?;
                let mut b = [0u8; 32];
                b.copy_from_slice(&sk.verifying_key().to_bytes());
                b
            }
            KeyKind::Ed25519 => ed25519_dalek::SigningKey::from_bytes(&secret)
                .verifying_key()
                .to_bytes(),
        };
        Ok(Privatekey { kind, secret, public })
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn publickey(&self) -> Publickey {
        Publickey { kind: self.kind, bytes: self.public }
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Signature> {
        match self.kind {
            KeyKind::Btc => {
                let sk = k256::schnorr::SigningKey::from_bytes(&self.secret)
                    .map_err(|e| TesseraError::Invalid(e.to_string()))?;
                let sig: k256::schnorr::Signature = sk
                    .try_sign(msg)
                    .map_err(|e| TesseraError::Other(format!("schnorr signing failed: {e}")))?;
                Ok(Signature(sig.to_bytes().to_vec()))
            }
            KeyKind::Ed25519 => {
                let sk = ed25519_dalek::SigningKey::from_bytes(&self.secret);
                Ok(Signature(sk.sign(msg).to_bytes().to_vec()))
            }
        }
    }
}

impl fmt::Display for Privatekey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", bs58::encode(self.secret).into_string(), self.kind.private_suffix())
    }
}

impl fmt::Debug for Privatekey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Privatekey({:?}, public={})", self.kind, self.publickey())
    }
}

impl FromStr for Privatekey {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let (body, suffix) = split_key_text(s)?;
        let kind = match suffix {
            "btc-priv" => KeyKind::Btc,
            "ed-priv" => KeyKind::Ed25519,
            other => return Err(TesseraError::Invalid(format!("unknown private key kind: {other}"))),
        };
        Privatekey::from_raw(kind, decode_32(body)?)
    }
}

impl Serialize for Privatekey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Privatekey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
