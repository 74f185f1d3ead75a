//! Type + version tags carried by every encoded entity.
//!
//! A hint prints as `<type>-v<major>.<minor>.<patch>`, e.g. `init-ballot-v0.0.1`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TesseraError};

pub const MAX_HINT_TYPE_SIZE: usize = 100;

pub const OPERATION_SEAL_TYPE: &str = "operation-seal";
pub const INIT_BALLOT_TYPE: &str = "init-ballot";
pub const PROPOSAL_TYPE: &str = "proposal";
pub const SIGN_BALLOT_TYPE: &str = "sign-ballot";
pub const ACCEPT_BALLOT_TYPE: &str = "accept-ballot";
pub const VOTEPROOF_TYPE: &str = "voteproof";
pub const OPERATION_TYPE: &str = "operation";
pub const KV_SET_FACT_TYPE: &str = "kv-set-fact";
pub const SET_POLICY_FACT_TYPE: &str = "set-policy-fact";
pub const MANIFEST_TYPE: &str = "manifest";
pub const BLOCK_TYPE: &str = "block";
pub const STATE_TYPE: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Version { major, minor, patch }
    }

    /// `self` (what a decoder supports) can read data written as `encoded`.
    pub fn is_compatible(&self, encoded: &Version) -> bool {
        self.major == encoded.major && self.minor >= encoded.minor
    }
}

pub const V0_0_1: Version = Version::new(0, 0, 1);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('v')
            .ok_or_else(|| TesseraError::InvalidHint(format!("version without 'v': {s:?}")))?;
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(TesseraError::InvalidHint(format!("bad version: {s:?}")));
        }
        let num = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| TesseraError::InvalidHint(format!("bad version part {p:?} in {s:?}")))
        };
        Ok(Version::new(num(parts[0])?, num(parts[1])?, num(parts[2])?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hint {
    ty: String,
    version: Version,
}

impl Hint {
    pub fn new(ty: &str, version: Version) -> Self {
        Hint { ty: ty.to_string(), version }
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.ty.is_empty() || self.ty.len() > MAX_HINT_TYPE_SIZE {
            return Err(TesseraError::InvalidHint(format!("bad hint type length: {}", self.ty.len())));
        }
        if !self.ty.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
            return Err(TesseraError::InvalidHint(format!("bad hint type: {:?}", self.ty)));
        }
        Ok(())
    }

    /// `self` is the registered hint, `encoded` the one found on the wire.
    pub fn is_compatible(&self, encoded: &Hint) -> Result<()> {
        if self.ty != encoded.ty {
            return Err(TesseraError::InvalidHint(format!(
                "type does not match; {} != {}",
                self.ty, encoded.ty
            )));
        }
        if !self.version.is_compatible(&encoded.version) {
            return Err(TesseraError::InvalidHint(format!(
                "version {} can not read {}",
                self.version, encoded.version
            )));
        }
        Ok(())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ty, self.version)
    }
}

impl FromStr for Hint {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let (ty, version) = s
            .rsplit_once("-v")
            .ok_or_else(|| TesseraError::InvalidHint(format!("unknown hint format: {s:?}")))?;
        let hint = Hint { ty: ty.to_string(), version: format!("v{version}").parse()? };
        hint.is_valid()?;
        Ok(hint)
    }
}

impl Serialize for Hint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Anything that carries a hint.
pub trait Hinted {
    fn hint(&self) -> &Hint;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_text_roundtrip() {
        let h = Hint::new("init-ballot", Version::new(1, 2, 3));
        assert_eq!(h.to_string(), "init-ballot-v1.2.3");
        let back: Hint = "init-ballot-v1.2.3".parse().unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_bad_hints() {
        assert!("init-ballot".parse::<Hint>().is_err());
        assert!("init-ballot-v1.2".parse::<Hint>().is_err());
        assert!("Init-v1.0.0".parse::<Hint>().is_err());
        assert!("-v1.0.0".parse::<Hint>().is_err());
    }

    #[test]
    fn test_compatibility() {
        let registered = Hint::new("voteproof", Version::new(1, 2, 0));
        assert!(registered.is_compatible(&Hint::new("voteproof", Version::new(1, 2, 9))).is_ok());
        assert!(registered.is_compatible(&Hint::new("voteproof", Version::new(1, 1, 5))).is_ok());
        assert!(registered.is_compatible(&Hint::new("voteproof", Version::new(1, 3, 0))).is_err());
        assert!(registered.is_compatible(&Hint::new("voteproof", Version::new(2, 0, 0))).is_err());
        assert!(registered.is_compatible(&Hint::new("manifest", Version::new(1, 2, 0))).is_err());
    }
}
