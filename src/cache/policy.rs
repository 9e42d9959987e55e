//! Eviction Policies
//!
//! Victim selection for the memory tier. Each policy is a strategy that
//! tracks its own ordering alongside the tier's map, so picking a victim
//! never scans the whole tier.
//!
//! - LRU: least recently accessed (or inserted) first
//! - LFU: lowest hit count first, ties broken by insertion order
//! - FIFO: insertion order; reads and replacements do not reorder

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::element::ElementKey;
use crate::error::Error;

/// Memory tier eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
    /// First in, first out
    Fifo,
}

impl EvictionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "LRU",
            EvictionPolicy::Lfu => "LFU",
            EvictionPolicy::Fifo => "FIFO",
        }
    }

    /// Build the strategy implementing this policy
    pub fn strategy(&self) -> Box<dyn EvictionStrategy> {
        match self {
            EvictionPolicy::Lru => Box::new(LruStrategy::default()),
            EvictionPolicy::Lfu => Box::new(LfuStrategy::default()),
            EvictionPolicy::Fifo => Box::new(FifoStrategy::default()),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for EvictionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            other => Err(Error::Config(format!("unknown eviction policy: {}", other))),
        }
    }
}

// =============================================================================
// Strategy Trait
// =============================================================================

/// Ordering bookkeeping for one eviction policy.
///
/// The memory tier calls these hooks for every mutation of its map; the
/// strategy must track exactly the keys the tier holds.
pub trait EvictionStrategy: Send {
    /// Which policy this strategy implements
    fn policy(&self) -> EvictionPolicy;

    /// A key not currently tracked was inserted with the given hit count
    fn on_insert(&mut self, key: &ElementKey, hit_count: u64);

    /// A tracked key was replaced by a put
    fn on_update(&mut self, key: &ElementKey, hit_count: u64);

    /// A tracked key was read
    fn on_access(&mut self, key: &ElementKey);

    /// A tracked key left the tier
    fn on_remove(&mut self, key: &ElementKey);

    /// Next key to evict, without removing it
    fn peek_victim(&self) -> Option<&ElementKey>;

    /// Next key to evict other than `exclude`
    fn peek_victim_except(&self, exclude: &ElementKey) -> Option<&ElementKey>;

    /// Forget every key
    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Ordered Index
// =============================================================================

/// Key ordering by a monotonically increasing rank
#[derive(Debug, Default)]
struct RankedKeys<R: Ord + Copy> {
    ranks: HashMap<ElementKey, R>,
    order: BTreeMap<R, ElementKey>,
}

impl<R: Ord + Copy> RankedKeys<R> {
    fn set(&mut self, key: &ElementKey, rank: R) {
        if let Some(old) = self.ranks.insert(key.clone(), rank) {
            self.order.remove(&old);
        }
        self.order.insert(rank, key.clone());
    }

    fn get(&self, key: &ElementKey) -> Option<R> {
        self.ranks.get(key).copied()
    }

    fn remove(&mut self, key: &ElementKey) {
        if let Some(rank) = self.ranks.remove(key) {
            self.order.remove(&rank);
        }
    }

    fn first(&self) -> Option<&ElementKey> {
        self.order.values().next()
    }

    fn first_except(&self, exclude: &ElementKey) -> Option<&ElementKey> {
        self.order.values().find(|key| *key != exclude)
    }

    fn clear(&mut self) {
        self.ranks.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.ranks.len()
    }
}

// =============================================================================
// LRU
// =============================================================================

/// Least recently used
#[derive(Debug, Default)]
pub struct LruStrategy {
    tick: u64,
    keys: RankedKeys<u64>,
}

impl LruStrategy {
    fn touch(&mut self, key: &ElementKey) {
        self.tick += 1;
        self.keys.set(key, self.tick);
    }
}

impl EvictionStrategy for LruStrategy {
    fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::Lru
    }

    fn on_insert(&mut self, key: &ElementKey, _hit_count: u64) {
        self.touch(key);
    }

    fn on_update(&mut self, key: &ElementKey, _hit_count: u64) {
        self.touch(key);
    }

    fn on_access(&mut self, key: &ElementKey) {
        self.touch(key);
    }

    fn on_remove(&mut self, key: &ElementKey) {
        self.keys.remove(key);
    }

    fn peek_victim(&self) -> Option<&ElementKey> {
        self.keys.first()
    }

    fn peek_victim_except(&self, exclude: &ElementKey) -> Option<&ElementKey> {
        self.keys.first_except(exclude)
    }

    fn clear(&mut self) {
        self.keys.clear();
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

// =============================================================================
// LFU
// =============================================================================

/// Least frequently used, oldest insertion first among equal counts
#[derive(Debug, Default)]
pub struct LfuStrategy {
    sequence: u64,
    keys: RankedKeys<(u64, u64)>,
}

impl LfuStrategy {
    fn insert(&mut self, key: &ElementKey, hit_count: u64) {
        self.sequence += 1;
        self.keys.set(key, (hit_count, self.sequence));
    }
}

impl EvictionStrategy for LfuStrategy {
    fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::Lfu
    }

    fn on_insert(&mut self, key: &ElementKey, hit_count: u64) {
        self.insert(key, hit_count);
    }

    fn on_update(&mut self, key: &ElementKey, hit_count: u64) {
        self.insert(key, hit_count);
    }

    fn on_access(&mut self, key: &ElementKey) {
        if let Some((hits, sequence)) = self.keys.get(key) {
            self.keys.set(key, (hits.saturating_add(1), sequence));
        }
    }

    fn on_remove(&mut self, key: &ElementKey) {
        self.keys.remove(key);
    }

    fn peek_victim(&self) -> Option<&ElementKey> {
        self.keys.first()
    }

    fn peek_victim_except(&self, exclude: &ElementKey) -> Option<&ElementKey> {
        self.keys.first_except(exclude)
    }

    fn clear(&mut self) {
        self.keys.clear();
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

// =============================================================================
// FIFO
// =============================================================================

/// Insertion order
#[derive(Debug, Default)]
pub struct FifoStrategy {
    sequence: u64,
    keys: RankedKeys<u64>,
}

impl EvictionStrategy for FifoStrategy {
    fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::Fifo
    }

    fn on_insert(&mut self, key: &ElementKey, _hit_count: u64) {
        self.sequence += 1;
        self.keys.set(key, self.sequence);
    }

    fn on_update(&mut self, key: &ElementKey, hit_count: u64) {
        if self.keys.get(key).is_none() {
            self.on_insert(key, hit_count);
        }
    }

    fn on_access(&mut self, _key: &ElementKey) {}

    fn on_remove(&mut self, key: &ElementKey) {
        self.keys.remove(key);
    }

    fn peek_victim(&self) -> Option<&ElementKey> {
        self.keys.first()
    }

    fn peek_victim_except(&self, exclude: &ElementKey) -> Option<&ElementKey> {
        self.keys.first_except(exclude)
    }

    fn clear(&mut self) {
        self.keys.clear();
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
