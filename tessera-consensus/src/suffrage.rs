//! Suffrage: who may vote, who proposes and who signs at `(height, round)`.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use tessera_common::env::{Height, Round};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::Address;

const CACHE_SIZE: usize = 128;

/// Outcome of the election for one `(height, round)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingSuffrage {
    pub height: Height,
    pub round: Round,
    pub proposer: Address,
    pub nodes: Vec<Address>,
}

impl ActingSuffrage {
    pub fn exists(&self, node: &Address) -> bool {
        self.nodes.contains(node)
    }
}

pub trait Suffrage: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Every validator, sorted.
    fn nodes(&self) -> &[Address];

    /// Pure: the same inputs always elect the same proposer and acting set.
    fn acting(&self, height: Height, round: Round) -> ActingSuffrage;

    /// Changes the acting set size. Cached elections are dropped.
    fn set_number_of_acting(&self, n: usize);

    fn is_inside(&self, node: &Address) -> bool {
        self.nodes().binary_search(node).is_ok()
    }

    fn is_acting(&self, height: Height, round: Round, node: &Address) -> bool {
        self.acting(height, round).exists(node)
    }

    fn is_proposer(&self, height: Height, round: Round, node: &Address) -> bool {
        &self.acting(height, round).proposer == node
    }
}

fn sorted_nodes(mut nodes: Vec<Address>) -> Result<Vec<Address>> {
    if nodes.is_empty() {
        return Err(TesseraError::Config("suffrage without nodes".into()));
    }
    nodes.sort();
    let before = nodes.len();
    nodes.dedup();
    if nodes.len() != before {
        return Err(TesseraError::Config("duplicated node in suffrage".into()));
    }
    Ok(nodes)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Always the configured proposer; every validator acts.
#[derive(Debug)]
pub struct FixedSuffrage {
    proposer: Address,
    nodes: Vec<Address>,
}

impl FixedSuffrage {
    pub fn new(proposer: Address, nodes: Vec<Address>) -> Result<Self> {
        let nodes = sorted_nodes(nodes)?;
        if nodes.binary_search(&proposer).is_err() {
            return Err(TesseraError::Config(format!("fixed proposer {proposer} is not a suffrage node")));
        }
        Ok(Self { proposer, nodes })
    }
}

impl Suffrage for FixedSuffrage {
    fn name(&self) -> &'static str {
        "fixed-proposer"
    }

    fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    fn acting(&self, height: Height, round: Round) -> ActingSuffrage {
        ActingSuffrage { height, round, proposer: self.proposer.clone(), nodes: self.nodes.clone() }
    }

    fn set_number_of_acting(&self, _: usize) {}
}

/// Rotates the proposer by `height + round` over the sorted validators.
pub struct RoundrobinSuffrage {
    nodes: Vec<Address>,
    state: Mutex<RoundrobinState>,
}

struct RoundrobinState {
    number_of_acting: usize,
    cache: LruCache<(Height, Round), ActingSuffrage>,
}

impl fmt::Debug for RoundrobinSuffrage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundrobinSuffrage")
            .field("nodes", &self.nodes)
            .field("number_of_acting", &lock(&self.state).number_of_acting)
            .finish()
    }
}

impl RoundrobinSuffrage {
    pub fn new(nodes: Vec<Address>, number_of_acting: usize) -> Result<Self> {
        if number_of_acting < 1 {
            return Err(TesseraError::Config("number of acting suffrage nodes must be >= 1".into()));
        }
        let nodes = sorted_nodes(nodes)?;
        let cache = LruCache::new(NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN));
        Ok(Self { nodes, state: Mutex::new(RoundrobinState { number_of_acting, cache }) })
    }

    fn elect(&self, height: Height, round: Round, number_of_acting: usize) -> ActingSuffrage {
        let n = self.nodes.len();
        let k = number_of_acting.min(n);
        // heights are never below pre-genesis, and the sum wraps instead of panicking
        let base = (height.value().max(0) as u64).wrapping_add(round.value());
        let pos = (base % n as u64) as usize;
        let nodes = (0..k).map(|i| self.nodes[(pos + i) % n].clone()).collect();
        ActingSuffrage { height, round, proposer: self.nodes[pos].clone(), nodes }
    }
}

impl Suffrage for RoundrobinSuffrage {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    fn acting(&self, height: Height, round: Round) -> ActingSuffrage {
        let mut state = lock(&self.state);
        if let Some(found) = state.cache.get(&(height, round)) {
            return found.clone();
        }
        let elected = self.elect(height, round, state.number_of_acting);
        state.cache.put((height, round), elected.clone());
        elected
    }

    fn set_number_of_acting(&self, n: usize) {
        let mut state = lock(&self.state);
        if n < 1 || n == state.number_of_acting {
            return;
        }
        state.number_of_acting = n;
        state.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(names: &[&str]) -> Vec<Address> {
        names.iter().map(|n| Address::from(*n)).collect()
    }

    #[test]
    fn test_roundrobin_rotates() {
        let s = RoundrobinSuffrage::new(addrs(&["n2", "n0", "n1"]), 1).unwrap();
        assert_eq!(s.nodes(), addrs(&["n0", "n1", "n2"]).as_slice());

        let a = s.acting(Height(1), Round(0));
        assert_eq!(a.proposer, Address::from("n1"));
        assert_eq!(a.nodes, addrs(&["n1"]));

        assert_eq!(s.acting(Height(1), Round(1)).proposer, Address::from("n2"));
        assert_eq!(s.acting(Height(2), Round(1)).proposer, Address::from("n0"));
    }

    #[test]
    fn test_roundrobin_acting_wraps() {
        let s = RoundrobinSuffrage::new(addrs(&["a", "b", "c", "d"]), 3).unwrap();
        let a = s.acting(Height(3), Round(0));
        assert_eq!(a.proposer, Address::from("d"));
        assert_eq!(a.nodes, addrs(&["d", "a", "b"]));

        // more acting nodes than validators is capped
        s.set_number_of_acting(10);
        assert_eq!(s.acting(Height(3), Round(0)).nodes.len(), 4);
    }

    #[test]
    fn test_roundrobin_is_pure() {
        let a = RoundrobinSuffrage::new(addrs(&["n0", "n1", "n2"]), 2).unwrap();
        let b = RoundrobinSuffrage::new(addrs(&["n1", "n2", "n0"]), 2).unwrap();
        for h in 0..10 {
            for r in 0..4 {
                let first = a.acting(Height(h), Round(r));
                assert_eq!(first, a.acting(Height(h), Round(r)));
                assert_eq!(first, b.acting(Height(h), Round(r)));
            }
        }
    }

    #[test]
    fn test_predicates() {
        let s = RoundrobinSuffrage::new(addrs(&["n0", "n1", "n2"]), 1).unwrap();
        assert!(s.is_inside(&Address::from("n0")));
        assert!(!s.is_inside(&Address::from("n9")));
        assert!(s.is_proposer(Height(0), Round(0), &Address::from("n0")));
        assert!(s.is_acting(Height(0), Round(0), &Address::from("n0")));
        assert!(!s.is_acting(Height(0), Round(0), &Address::from("n1")));
    }

    #[test]
    fn test_fixed_proposer() {
        let s = FixedSuffrage::new(Address::from("n1"), addrs(&["n0", "n1", "n2"])).unwrap();
        for r in 0..3 {
            let a = s.acting(Height(5), Round(r));
            assert_eq!(a.proposer, Address::from("n1"));
            assert_eq!(a.nodes.len(), 3);
        }
        assert!(FixedSuffrage::new(Address::from("n9"), addrs(&["n0"])).is_err());
    }

    #[test]
    fn test_duplicated_nodes_rejected() {
        assert!(RoundrobinSuffrage::new(addrs(&["n0", "n0"]), 1).is_err());
        assert!(RoundrobinSuffrage::new(vec![], 1).is_err());
    }
}
