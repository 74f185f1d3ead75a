use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Block height. `-1` is the pre-genesis height, `0` the genesis block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Height(pub i64);

impl Height {
    pub const PRE_GENESIS: Height = Height(-1);
    pub const GENESIS: Height = Height(0);

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> Height {
        Height(self.0 + 1)
    }

    pub fn prev(&self) -> Height {
        Height(self.0 - 1)
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.0 < Self::PRE_GENESIS.0 {
            return Err(TesseraError::Invalid(format!("height below pre-genesis: {}", self.0)));
        }
        Ok(())
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Round(pub u64);

impl Round {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Round {
        Round(self.0 + 1)
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Voting stages in the order they happen within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Proposal,
    Sign,
    Accept,
}

impl Stage {
    pub fn byte(&self) -> u8 {
        match self {
            Stage::Init => 1,
            Stage::Proposal => 2,
            Stage::Sign => 3,
            Stage::Accept => 4,
        }
    }

    /// Proposals are not tallied; every other stage ends in a voteproof.
    pub fn can_vote(&self) -> bool {
        !matches!(self, Stage::Proposal)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "INIT",
            Stage::Proposal => "PROPOSAL",
            Stage::Sign => "SIGN",
            Stage::Accept => "ACCEPT",
        };
        f.write_str(s)
    }
}

/// Identifies one chain instance; mixed into every signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(s: impl Into<String>) -> Self {
        NetworkId(s.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quorum ratio in `(0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdRatio(f64);

impl ThresholdRatio {
    pub const DEFAULT: ThresholdRatio = ThresholdRatio(0.67);

    pub fn new(ratio: f64) -> Result<Self> {
        let r = ThresholdRatio(ratio);
        r.is_valid()?;
        Ok(r)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_valid(&self) -> Result<()> {
        if !(self.0 > 0.0 && self.0 <= 1.0) {
            return Err(TesseraError::Invalid(format!("threshold ratio out of (0, 1]: {}", self.0)));
        }
        Ok(())
    }

    /// Above one half two disjoint quorums can not exist.
    pub fn is_safe(&self) -> bool {
        self.0 > 0.5
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl Default for ThresholdRatio {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ThresholdRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.0 * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub total: usize,
    pub threshold: usize,
    pub ratio: ThresholdRatio,
}

impl Threshold {
    pub fn new(total: usize, ratio: ThresholdRatio) -> Self {
        // rounded first so 3 * 0.67 does not pick up float noise
        let exact = (total as f64 * ratio.value() * 1e9).round() / 1e9;
        Threshold { total, threshold: exact.ceil() as usize, ratio }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteResult {
    NotYet,
    Draw,
    Majority,
}

impl VoteResult {
    pub fn byte(&self) -> u8 {
        match self {
            VoteResult::NotYet => 0,
            VoteResult::Draw => 1,
            VoteResult::Majority => 2,
        }
    }
}

impl fmt::Display for VoteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VoteResult::NotYet => "NOT-YET",
            VoteResult::Draw => "DRAW",
            VoteResult::Majority => "MAJORITY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorityOutcome {
    NotYet,
    Draw,
    /// Index into the `counts` slice that reached the threshold.
    Found(usize),
}

/// Decides a tally. `counts[i]` is the number of voters for candidate `i`.
pub fn find_majority(total: usize, threshold: usize, counts: &[usize]) -> MajorityOutcome {
    if threshold > total || threshold == 0 {
        return MajorityOutcome::Draw;
    }

    let voted: usize = counts.iter().sum();
    let Some((top, top_count)) = counts.iter().copied().enumerate().max_by_key(|(_, c)| *c) else {
        return MajorityOutcome::NotYet;
    };

    if top_count >= threshold {
        return MajorityOutcome::Found(top);
    }

    let remaining = total.saturating_sub(voted);
    if top_count + remaining < threshold {
        return MajorityOutcome::Draw;
    }

    MajorityOutcome::NotYet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_rounds_up() {
        let r = ThresholdRatio::new(0.67).unwrap();
        assert_eq!(Threshold::new(3, r).threshold, 3);
        assert_eq!(Threshold::new(4, r).threshold, 3);
        assert_eq!(Threshold::new(10, r).threshold, 7);
        assert_eq!(Threshold::new(1, r).threshold, 1);
        assert_eq!(Threshold::new(100, r).threshold, 67);
    }

    #[test]
    fn test_ratio_bounds() {
        assert!(ThresholdRatio::new(0.0).is_err());
        assert!(ThresholdRatio::new(1.01).is_err());
        assert!(ThresholdRatio::new(1.0).is_ok());
        assert!(!ThresholdRatio::new(0.4).unwrap().is_safe());
        assert!(!ThresholdRatio::new(0.5).unwrap().is_safe());
        assert!(ThresholdRatio::new(0.51).unwrap().is_safe());
    }

    #[test]
    fn test_find_majority() {
        assert_eq!(find_majority(4, 3, &[]), MajorityOutcome::NotYet);
        assert_eq!(find_majority(4, 3, &[3]), MajorityOutcome::Found(0));
        assert_eq!(find_majority(4, 3, &[1, 3]), MajorityOutcome::Found(1));
        assert_eq!(find_majority(4, 3, &[2]), MajorityOutcome::NotYet);
        assert_eq!(find_majority(4, 3, &[2, 2]), MajorityOutcome::Draw);
        assert_eq!(find_majority(3, 3, &[2, 1]), MajorityOutcome::Draw);
        assert_eq!(find_majority(2, 3, &[1]), MajorityOutcome::Draw);
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::Init < Stage::Proposal);
        assert!(Stage::Sign < Stage::Accept);
        assert!(!Stage::Proposal.can_vote());
    }
}
