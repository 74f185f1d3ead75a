//! Per-kind operation processing against a [`StatePool`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tessera_common::crypto::Publickey;
use tessera_common::env::{Operation, OperationFact, POLICY_STATE_KEY};
use tessera_common::error::{Result, TesseraError};
use tessera_common::hint::{self, Hinted};
use tessera_ledger::StatePool;

/// Largest value a `kv-set` may write.
pub const MAX_STATE_VALUE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Applied,
    /// The operation stays in the block but changes no state.
    Rejected(String),
}

/// `Err` is reserved for failures of the node itself, e.g. storage reads;
/// a bad operation is an [`OperationOutcome::Rejected`].
pub trait OperationProcessor: Send + Sync {
    fn fact_type(&self) -> &'static str;
    fn process(&self, op: &Operation, pool: &mut StatePool) -> Result<OperationOutcome>;
}

pub struct KvSetProcessor;

impl OperationProcessor for KvSetProcessor {
    fn fact_type(&self) -> &'static str {
        hint::KV_SET_FACT_TYPE
    }

    fn process(&self, op: &Operation, pool: &mut StatePool) -> Result<OperationOutcome> {
        let OperationFact::KvSet(fact) = &op.fact else {
            return Ok(OperationOutcome::Rejected("not a kv-set fact".into()));
        };
        if fact.key == POLICY_STATE_KEY {
            return Ok(OperationOutcome::Rejected(format!("{POLICY_STATE_KEY} is reserved")));
        }
        if fact.value.len() > MAX_STATE_VALUE_SIZE {
            return Ok(OperationOutcome::Rejected(format!("value too large: {}", fact.value.len())));
        }
        pool.set(&fact.key, fact.value.clone(), op.fact_hash())?;
        Ok(OperationOutcome::Applied)
    }
}

/// Only validators may change the chain policy.
pub struct SetPolicyProcessor {
    validators: HashSet<Publickey>,
}

impl SetPolicyProcessor {
    pub fn new(validators: impl IntoIterator<Item = Publickey>) -> Self {
        Self { validators: validators.into_iter().collect() }
    }
}

impl OperationProcessor for SetPolicyProcessor {
    fn fact_type(&self) -> &'static str {
        hint::SET_POLICY_FACT_TYPE
    }

    fn process(&self, op: &Operation, pool: &mut StatePool) -> Result<OperationOutcome> {
        let OperationFact::SetPolicy(fact) = &op.fact else {
            return Ok(OperationOutcome::Rejected("not a set-policy fact".into()));
        };
        if !op.signs.iter().any(|s| self.validators.contains(&s.signer)) {
            return Ok(OperationOutcome::Rejected("set-policy needs a validator sign".into()));
        }
        if let Err(e) = fact.policy.is_valid() {
            return Ok(OperationOutcome::Rejected(e.to_string()));
        }
        pool.set(POLICY_STATE_KEY, fact.policy.bytes(), op.fact_hash())?;
        Ok(OperationOutcome::Applied)
    }
}

/// Processors keyed by fact hint type.
#[derive(Clone, Default)]
pub struct OperationProcessors {
    by_type: HashMap<&'static str, Arc<dyn OperationProcessor>>,
}

impl fmt::Debug for OperationProcessors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("OperationProcessors").field("types", &types).finish()
    }
}

impl OperationProcessors {
    pub fn new() -> Self {
        Self::default()
    }

    /// `kv-set` plus `set-policy` restricted to `validators`.
    pub fn with_defaults(validators: impl IntoIterator<Item = Publickey>) -> Result<Self> {
        let mut p = Self::new();
        p.register(Arc::new(KvSetProcessor))?;
        p.register(Arc::new(SetPolicyProcessor::new(validators)))?;
        Ok(p)
    }

    pub fn register(&mut self, processor: Arc<dyn OperationProcessor>) -> Result<()> {
        let ty = processor.fact_type();
        if self.by_type.contains_key(ty) {
            return Err(TesseraError::Duplicate(format!("operation processor for {ty}")));
        }
        self.by_type.insert(ty, processor);
        Ok(())
    }

    /// Applies `op`; a rejected operation leaves `pool` as it was.
    pub fn process(&self, op: &Operation, pool: &mut StatePool) -> Result<OperationOutcome> {
        let ty = op.fact.hint().ty();
        let Some(processor) = self.by_type.get(ty) else {
            return Ok(OperationOutcome::Rejected(format!("unknown operation type {ty}")));
        };
        let snapshot = pool.snapshot();
        let outcome = processor.process(op, pool)?;
        if outcome != OperationOutcome::Applied {
            pool.restore(snapshot);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tessera_common::crypto::Privatekey;
    use tessera_common::env::{ConsensusPolicy, Height, KvSetFact, SetPolicyFact};
    use tessera_ledger::{MemoryStorage, Storage};

    fn pool() -> StatePool {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        StatePool::new(storage, Height(1))
    }

    #[test]
    fn test_kv_set_writes_state() {
        let pk = Privatekey::new_btc();
        let procs = OperationProcessors::with_defaults(vec![]).unwrap();
        let op = Operation::new(OperationFact::KvSet(KvSetFact::new("t1", "k", "v").unwrap()), &pk, &testing::net())
            .unwrap();
        let mut pool = pool();
        assert_eq!(procs.process(&op, &mut pool).unwrap(), OperationOutcome::Applied);
        assert_eq!(pool.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_policy_key_reserved_for_set_policy() {
        let pk = Privatekey::new_btc();
        let procs = OperationProcessors::with_defaults(vec![]).unwrap();
        let op = Operation::new(
            OperationFact::KvSet(KvSetFact::new("t1", POLICY_STATE_KEY, "x").unwrap()),
            &pk,
            &testing::net(),
        )
        .unwrap();
        let mut pool = pool();
        assert!(matches!(procs.process(&op, &mut pool).unwrap(), OperationOutcome::Rejected(_)));
        assert!(!pool.is_updated());
    }

    #[test]
    fn test_set_policy_needs_validator() {
        let validator = Privatekey::new_btc();
        let procs = OperationProcessors::with_defaults(vec![validator.publickey()]).unwrap();
        let fact = OperationFact::SetPolicy(SetPolicyFact::new("p", ConsensusPolicy::default()).unwrap());

        let op = Operation::new(fact.clone(), &Privatekey::new_btc(), &testing::net()).unwrap();
        let mut pool = pool();
        assert!(matches!(procs.process(&op, &mut pool).unwrap(), OperationOutcome::Rejected(_)));

        let op = Operation::new(fact, &validator, &testing::net()).unwrap();
        assert_eq!(procs.process(&op, &mut pool).unwrap(), OperationOutcome::Applied);
        let stored = pool.get(POLICY_STATE_KEY).unwrap().unwrap();
        assert_eq!(ConsensusPolicy::from_bytes(&stored).unwrap(), ConsensusPolicy::default());
    }

    #[test]
    fn test_register_twice_fails() {
        let mut procs = OperationProcessors::new();
        procs.register(Arc::new(KvSetProcessor)).unwrap();
        assert!(procs.register(Arc::new(KvSetProcessor)).unwrap_err().is_duplicate());
    }
}
