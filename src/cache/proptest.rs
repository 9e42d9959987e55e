//! Property-Based Tests for the Tiered Cache
//!
//! Checks the tiers against simple reference models over random
//! operation sequences.
//!
//! # Test Properties
//!
//! 1. **Capacity**: the memory tier never holds more than its bound
//! 2. **Victim Order**: LRU and FIFO eviction follow list models exactly
//! 3. **Disjoint Tiers**: a key is in memory or on disk, never both
//! 4. **No Loss**: with overflow enabled, every stored key stays readable
//!    with its latest value, whichever tier holds it

#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;

use super::element::{Element, ElementKey};
use super::engine::Cache;
use super::expiry::ManualClock;
use super::memory::{MemoryCapacity, MemoryTier};
use super::policy::EvictionPolicy;
use crate::config::CacheConfiguration;

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(i64, i64),
    Get(i64),
    Remove(i64),
}

/// Operations over a small key space so keys collide often
fn op_strategy(keys: i64) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..keys, any::<i64>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => (0..keys).prop_map(Op::Get),
        1 => (0..keys).prop_map(Op::Remove),
    ]
}

fn policy_strategy() -> impl Strategy<Value = EvictionPolicy> {
    prop_oneof![
        Just(EvictionPolicy::Lru),
        Just(EvictionPolicy::Lfu),
        Just(EvictionPolicy::Fifo),
    ]
}

// =============================================================================
// Memory Tier Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: element count never exceeds the configured capacity.
    #[test]
    fn prop_memory_capacity_bound(
        capacity in 1usize..8,
        policy in policy_strategy(),
        ops in prop::collection::vec(op_strategy(16), 1..200),
    ) {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(capacity), policy);
        for (now, op) in ops.into_iter().enumerate() {
            match op {
                Op::Put(k, v) => { tier.put(Element::new_at(k, v, now as u64)); }
                Op::Get(k) => { tier.get(&ElementKey::from(k), now as u64); }
                Op::Remove(k) => { tier.remove(&ElementKey::from(k)); }
            }
            prop_assert!(tier.len() <= capacity);
        }
    }

    /// Property: LRU keeps exactly the most recently touched keys.
    #[test]
    fn prop_lru_matches_recency_model(
        capacity in 1usize..6,
        ops in prop::collection::vec(op_strategy(12), 1..200),
    ) {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(capacity), EvictionPolicy::Lru);
        let mut model: VecDeque<i64> = VecDeque::new();

        for (now, op) in ops.into_iter().enumerate() {
            match op {
                Op::Put(k, v) => {
                    let outcome = tier.put(Element::new_at(k, v, now as u64));
                    model.retain(|&m| m != k);
                    model.push_back(k);
                    let mut expected = Vec::new();
                    while model.len() > capacity {
                        expected.extend(model.pop_front());
                    }
                    let evicted: Vec<ElementKey> =
                        outcome.evicted.iter().map(|e| e.key().clone()).collect();
                    let expected: Vec<ElementKey> =
                        expected.into_iter().map(ElementKey::from).collect();
                    prop_assert_eq!(evicted, expected);
                }
                Op::Get(k) => {
                    let hit = tier.get(&ElementKey::from(k), now as u64).is_some();
                    prop_assert_eq!(hit, model.contains(&k));
                    if hit {
                        model.retain(|&m| m != k);
                        model.push_back(k);
                    }
                }
                Op::Remove(k) => {
                    let removed = tier.remove(&ElementKey::from(k)).is_some();
                    prop_assert_eq!(removed, model.contains(&k));
                    model.retain(|&m| m != k);
                }
            }
        }
    }

    /// Property: FIFO evicts in first-insertion order; reads and
    /// replacing puts do not reorder.
    #[test]
    fn prop_fifo_matches_insertion_model(
        capacity in 1usize..6,
        ops in prop::collection::vec(op_strategy(12), 1..200),
    ) {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(capacity), EvictionPolicy::Fifo);
        let mut model: VecDeque<i64> = VecDeque::new();

        for (now, op) in ops.into_iter().enumerate() {
            match op {
                Op::Put(k, v) => {
                    let outcome = tier.put(Element::new_at(k, v, now as u64));
                    if !model.contains(&k) {
                        model.push_back(k);
                    }
                    let mut expected = Vec::new();
                    while model.len() > capacity {
                        expected.extend(model.pop_front());
                    }
                    let evicted: Vec<ElementKey> =
                        outcome.evicted.iter().map(|e| e.key().clone()).collect();
                    let expected: Vec<ElementKey> =
                        expected.into_iter().map(ElementKey::from).collect();
                    prop_assert_eq!(evicted, expected);
                }
                Op::Get(k) => {
                    let hit = tier.get(&ElementKey::from(k), now as u64).is_some();
                    prop_assert_eq!(hit, model.contains(&k));
                }
                Op::Remove(k) => {
                    tier.remove(&ElementKey::from(k));
                    model.retain(|&m| m != k);
                }
            }
        }
    }
}

// =============================================================================
// Tiered Cache Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: overflow to disk never loses an element; every read
    /// returns the latest value put and the total size matches.
    #[test]
    fn prop_overflow_loses_nothing(
        capacity in 1usize..5,
        policy in policy_strategy(),
        ops in prop::collection::vec(op_strategy(24), 1..120),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfiguration::new("prop", capacity)
            .with_eviction_policy(policy)
            .with_overflow_to_disk(true)
            .with_eternal(true)
            .with_disk_store_path(dir.path());
        let cache = Cache::with_clock(config, Arc::new(ManualClock::new(1_000))).unwrap();
        cache.initialise().unwrap();

        let mut model: HashMap<i64, i64> = HashMap::new();
        for op in ops {
            match op {
                Op::Put(k, v) => {
                    cache.put(Element::new(k, v)).unwrap();
                    model.insert(k, v);
                }
                Op::Get(k) => {
                    let found = cache.get(k).unwrap().and_then(|e| e.value().as_integer());
                    prop_assert_eq!(found, model.get(&k).copied());
                }
                Op::Remove(k) => {
                    let removed = cache.remove(k).unwrap();
                    prop_assert_eq!(removed, model.remove(&k).is_some());
                }
            }
        }

        for k in model.keys() {
            let key = ElementKey::from(*k);
            prop_assert!(cache.is_element_in_memory(&key) != cache.is_element_on_disk(&key));
        }

        prop_assert_eq!(cache.size().unwrap(), model.len());
        prop_assert!(cache.memory_store_size().unwrap() <= capacity);
        cache.flush().unwrap();
        prop_assert_eq!(cache.disk_store_size().unwrap(), model.len());
        cache.dispose().unwrap();
    }
}
