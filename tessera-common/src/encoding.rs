//! Hinted encoding.
//!
//! Every encoded entity is wrapped in an envelope `{hint, body}`. Decoding
//! first reads the hint, then looks it up in [`Encoders`] to find the
//! constructor for the concrete type. Two formats exist, bincode (default,
//! used between nodes) and JSON; both carry the same content.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::env::{Ballot, Block, Manifest, Operation, OperationSeal, Seal, Stage, State, Voteproof};
use crate::error::{Result, TesseraError};
use crate::hint::{self, Hint, Hinted, Version, V0_0_1};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Bincode,
    Json,
}

#[derive(Serialize, Deserialize)]
struct BinaryEnvelope {
    hint: Hint,
    body: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct JsonEnvelope {
    #[serde(rename = "_hint")]
    hint: Hint,
    body: serde_json::Value,
}

impl EncoderKind {
    pub fn encode<T: Serialize + Hinted>(&self, v: &T) -> Result<Vec<u8>> {
        match self {
            EncoderKind::Bincode => {
                let env = BinaryEnvelope { hint: v.hint().clone(), body: bincode::serialize(v)? };
                Ok(bincode::serialize(&env)?)
            }
            EncoderKind::Json => {
                let env = JsonEnvelope { hint: v.hint().clone(), body: serde_json::to_value(v)? };
                Ok(serde_json::to_vec(&env)?)
            }
        }
    }

    fn open(&self, b: &[u8]) -> Result<(Hint, Body)> {
        match self {
            EncoderKind::Bincode => {
                let env: BinaryEnvelope = bincode::deserialize(b)?;
                Ok((env.hint, Body::Binary(env.body)))
            }
            EncoderKind::Json => {
                let env: JsonEnvelope = serde_json::from_slice(b)?;
                Ok((env.hint, Body::Json(env.body)))
            }
        }
    }

    /// Reads only the envelope hint.
    pub fn peek_hint(&self, b: &[u8]) -> Result<Hint> {
        self.open(b).map(|(h, _)| h)
    }
}

enum Body {
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl Body {
    fn decode<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Body::Binary(b) => Ok(bincode::deserialize(&b)?),
            Body::Json(v) => Ok(serde_json::from_value(v)?),
        }
    }
}

/// Result of decoding by hint.
#[derive(Debug, Clone)]
pub enum Decoded {
    Seal(Seal),
    Operation(Operation),
    Voteproof(Voteproof),
    Manifest(Manifest),
    Block(Box<Block>),
    State(State),
}

type Constructor = fn(Body) -> Result<Decoded>;

fn decode_ballot(stage: Stage) -> impl Fn(Body) -> Result<Decoded> {
    move |body| {
        let b: Ballot = body.decode()?;
        if b.stage() != stage {
            return Err(TesseraError::InvalidHint(format!("{} hint on {} ballot", stage, b.stage())));
        }
        Ok(Decoded::Seal(b.into()))
    }
}

/// Registry of `(type, version)` → constructor.
#[derive(Clone)]
pub struct Encoders {
    kind: EncoderKind,
    entries: HashMap<String, Vec<(Version, Constructor)>>,
}

impl std::fmt::Debug for Encoders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.entries.keys().collect();
        types.sort();
        f.debug_struct("Encoders").field("kind", &self.kind).field("types", &types).finish()
    }
}

impl Encoders {
    pub fn empty(kind: EncoderKind) -> Self {
        Encoders { kind, entries: HashMap::new() }
    }

    /// Registry with every built-in entity type.
    pub fn new(kind: EncoderKind) -> Self {
        let mut e = Self::empty(kind);
        e.register(hint::INIT_BALLOT_TYPE, V0_0_1, |b| decode_ballot(Stage::Init)(b));
        e.register(hint::PROPOSAL_TYPE, V0_0_1, |b| decode_ballot(Stage::Proposal)(b));
        e.register(hint::SIGN_BALLOT_TYPE, V0_0_1, |b| decode_ballot(Stage::Sign)(b));
        e.register(hint::ACCEPT_BALLOT_TYPE, V0_0_1, |b| decode_ballot(Stage::Accept)(b));
        e.register(hint::OPERATION_SEAL_TYPE, V0_0_1, |b| {
            Ok(Decoded::Seal(Seal::Operation(b.decode::<OperationSeal>()?)))
        });
        e.register(hint::OPERATION_TYPE, V0_0_1, |b| Ok(Decoded::Operation(b.decode()?)));
        e.register(hint::VOTEPROOF_TYPE, V0_0_1, |b| Ok(Decoded::Voteproof(b.decode()?)));
        e.register(hint::MANIFEST_TYPE, V0_0_1, |b| Ok(Decoded::Manifest(b.decode()?)));
        e.register(hint::BLOCK_TYPE, V0_0_1, |b| Ok(Decoded::Block(Box::new(b.decode()?))));
        e.register(hint::STATE_TYPE, V0_0_1, |b| Ok(Decoded::State(b.decode()?)));
        e
    }

    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    fn register(&mut self, ty: &str, version: Version, c: Constructor) {
        let list = self.entries.entry(ty.to_string()).or_default();
        list.push((version, c));
        list.sort_by(|a, b| b.0.cmp(&a.0));
    }

    pub fn encode<T: Serialize + Hinted>(&self, v: &T) -> Result<Vec<u8>> {
        self.kind.encode(v)
    }

    /// Seals are encoded as their concrete ballot or operation seal so the
    /// envelope hint names the stage.
    pub fn encode_seal(&self, s: &Seal) -> Result<Vec<u8>> {
        match s {
            Seal::Ballot(b) => self.kind.encode(b.as_ref()),
            Seal::Operation(o) => self.kind.encode(o),
        }
    }

    pub fn decode(&self, b: &[u8]) -> Result<Decoded> {
        let (found, body) = self.kind.open(b)?;
        let constructor = self
            .entries
            .get(found.ty())
            .and_then(|list| {
                list.iter()
                    .find(|(v, _)| Hint::new(found.ty(), *v).is_compatible(&found).is_ok())
            })
            .map(|(_, c)| *c)
            .ok_or_else(|| TesseraError::InvalidHint(format!("no decoder for {found}")))?;
        constructor(body)
    }

    pub fn decode_seal(&self, b: &[u8]) -> Result<Seal> {
        match self.decode(b)? {
            Decoded::Seal(s) => Ok(s),
            other => Err(TesseraError::InvalidHint(format!("expected seal, got {}", decoded_name(&other)))),
        }
    }

    pub fn decode_block(&self, b: &[u8]) -> Result<Block> {
        match self.decode(b)? {
            Decoded::Block(blk) => Ok(*blk),
            other => Err(TesseraError::InvalidHint(format!("expected block, got {}", decoded_name(&other)))),
        }
    }

    pub fn decode_manifest(&self, b: &[u8]) -> Result<Manifest> {
        match self.decode(b)? {
            Decoded::Manifest(m) => Ok(m),
            other => Err(TesseraError::InvalidHint(format!("expected manifest, got {}", decoded_name(&other)))),
        }
    }
}

fn decoded_name(d: &Decoded) -> &'static str {
    match d {
        Decoded::Seal(_) => "seal",
        Decoded::Operation(_) => "operation",
        Decoded::Voteproof(_) => "voteproof",
        Decoded::Manifest(_) => "manifest",
        Decoded::Block(_) => "block",
        Decoded::State(_) => "state",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash, Privatekey};
    use crate::env::{BallotFact, Height, InitFact, KvSetFact, NetworkId, OperationFact, Round};
    use crate::utils::Address;

    fn sample_ballot() -> Ballot {
        let fact = BallotFact::Init(InitFact {
            height: Height::GENESIS,
            round: Round(0),
            previous_block: Hash::zero(),
        });
        Ballot::new(Address::new("n0").unwrap(), fact, None, None, &Privatekey::new_btc(), &NetworkId::new("n"))
            .unwrap()
    }

    #[test]
    fn test_ballot_roundtrip_both_formats() {
        let ballot = sample_ballot();
        for kind in [EncoderKind::Bincode, EncoderKind::Json] {
            let enc = Encoders::new(kind);
            let seal: Seal = ballot.clone().into();
            let bytes = enc.encode_seal(&seal).unwrap();
            let back = enc.decode_seal(&bytes).unwrap();
            assert_eq!(back, seal, "{kind:?}");
            assert!(back.is_valid(&NetworkId::new("n")).is_ok());
        }
    }

    #[test]
    fn test_operation_seal_roundtrip() {
        let pk = Privatekey::new_btc();
        let net = NetworkId::new("n");
        let op = Operation::new(OperationFact::KvSet(KvSetFact::new("t", "k", "v").unwrap()), &pk, &net).unwrap();
        let seal = Seal::Operation(OperationSeal::new(vec![op.clone()], &pk, &net).unwrap());

        let enc = Encoders::new(EncoderKind::Bincode);
        assert_eq!(enc.decode_seal(&enc.encode_seal(&seal).unwrap()).unwrap(), seal);
        match enc.decode(&enc.encode(&op).unwrap()).unwrap() {
            Decoded::Operation(back) => assert_eq!(back, op),
            other => panic!("unexpected {}", decoded_name(&other)),
        }
    }

    #[test]
    fn test_unknown_hint_is_rejected() {
        let enc = Encoders::empty(EncoderKind::Bincode);
        let bytes = enc.encode_seal(&Seal::from(sample_ballot())).unwrap();
        let err = enc.decode(&bytes).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidHint(_)));
    }

    #[test]
    fn test_newer_minor_version_is_rejected() {
        let enc = Encoders::new(EncoderKind::Json);
        let mut ballot = sample_ballot();
        ballot.hint = Hint::new(hint::INIT_BALLOT_TYPE, Version::new(0, 1, 0));
        let bytes = enc.encode_seal(&Seal::from(ballot)).unwrap();
        assert!(matches!(enc.decode(&bytes).unwrap_err(), TesseraError::InvalidHint(_)));
        assert_eq!(
            enc.kind().peek_hint(&bytes).unwrap().version(),
            Version::new(0, 1, 0)
        );
    }

    #[test]
    fn test_seal_decoder_refuses_other_entities() {
        let enc = Encoders::new(EncoderKind::Bincode);
        let st = State::new("k", vec![1], Height(1), Height::PRE_GENESIS, vec![]);
        let bytes = enc.encode(&st).unwrap();
        assert!(enc.decode_seal(&bytes).is_err());
    }
}
