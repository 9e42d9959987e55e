//! Memory Tier
//!
//! Bounded in-process store of elements with policy-driven eviction.
//!
//! # Design
//!
//! - A plain `HashMap` plus the policy's ordering index; the owning cache
//!   serializes access under a single lock, so every method here takes
//!   `&mut self` or `&self` without internal synchronization
//! - Capacity is either an element count or an estimated byte budget
//! - A put that takes the tier over capacity returns its victims to the
//!   caller, which decides between overflow and discard

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::element::{Element, ElementKey};
use super::expiry::ExpiryPolicy;
use super::policy::{EvictionPolicy, EvictionStrategy};

/// Upper bound on the memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCapacity {
    /// Maximum number of elements
    Elements(usize),
    /// Maximum total estimated size in bytes
    Bytes(u64),
}

impl Default for MemoryCapacity {
    fn default() -> Self {
        MemoryCapacity::Elements(super::DEFAULT_MAX_ELEMENTS_IN_MEMORY)
    }
}

impl fmt::Display for MemoryCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryCapacity::Elements(n) => write!(f, "{} elements", n),
            MemoryCapacity::Bytes(n) => write!(f, "{} bytes", n),
        }
    }
}

/// Result of a memory tier put
#[derive(Debug, Default)]
pub struct PutOutcome {
    /// Element previously stored under the same key
    pub previous: Option<Element>,
    /// Elements removed to bring the tier back within capacity, in
    /// eviction order. Includes the element just inserted only when it
    /// cannot fit on its own.
    pub evicted: Vec<Element>,
}

/// Memory tier statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub capacity: Option<MemoryCapacity>,
    pub evictions: u64,
}

/// Memory tier
pub struct MemoryTier {
    entries: HashMap<ElementKey, Element>,
    strategy: Box<dyn EvictionStrategy>,
    capacity: MemoryCapacity,
    /// Sum of estimated sizes of resident elements
    size_bytes: u64,
    evictions: u64,
}

impl MemoryTier {
    pub fn new(capacity: MemoryCapacity, policy: EvictionPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            strategy: policy.strategy(),
            capacity,
            size_bytes: 0,
            evictions: 0,
        }
    }

    /// Insert or replace an element, evicting as needed
    pub fn put(&mut self, element: Element) -> PutOutcome {
        let key = element.key().clone();
        let hit_count = element.hit_count();
        self.size_bytes += element.estimated_size() as u64;

        let previous = self.entries.insert(key.clone(), element);
        match &previous {
            Some(old) => {
                self.size_bytes = self
                    .size_bytes
                    .saturating_sub(old.estimated_size() as u64);
                self.strategy.on_update(&key, hit_count);
            }
            None => self.strategy.on_insert(&key, hit_count),
        }

        PutOutcome {
            previous,
            evicted: self.evict_to_capacity(&key),
        }
    }

    /// Read an element, recording the access
    pub fn get(&mut self, key: &ElementKey, now: u64) -> Option<&Element> {
        let element = self.entries.get_mut(key)?;
        element.record_access(now);
        self.strategy.on_access(key);
        Some(element)
    }

    /// Read an element without touching statistics or eviction order
    pub fn get_quiet(&self, key: &ElementKey) -> Option<&Element> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &ElementKey) -> Option<Element> {
        let element = self.entries.remove(key)?;
        self.strategy.on_remove(key);
        self.size_bytes = self
            .size_bytes
            .saturating_sub(element.estimated_size() as u64);
        Some(element)
    }

    /// Drop every element, returning how many were held
    pub fn remove_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.strategy.clear();
        self.size_bytes = 0;
        count
    }

    /// Remove and return every element
    pub fn drain(&mut self) -> Vec<Element> {
        self.strategy.clear();
        self.size_bytes = 0;
        self.entries.drain().map(|(_, element)| element).collect()
    }

    /// Remove and return every element expired at `now`
    pub fn remove_expired(&mut self, expiry: &ExpiryPolicy, now: u64) -> Vec<Element> {
        let expired: Vec<ElementKey> = self
            .entries
            .iter()
            .filter(|(_, element)| expiry.is_expired(element, now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| self.remove(key))
            .collect()
    }

    pub fn contains_key(&self, key: &ElementKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ElementKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &Element> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Running total of estimated element sizes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Recompute the estimated size by walking every resident element
    pub fn calculate_size(&self) -> u64 {
        self.entries
            .values()
            .map(|element| element.estimated_size() as u64)
            .sum()
    }

    pub fn capacity(&self) -> MemoryCapacity {
        self.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.strategy.policy()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.entries.len(),
            size_bytes: self.size_bytes,
            capacity: Some(self.capacity),
            evictions: self.evictions,
        }
    }

    fn is_over_capacity(&self) -> bool {
        match self.capacity {
            MemoryCapacity::Elements(max) => self.entries.len() > max,
            MemoryCapacity::Bytes(max) => self.size_bytes > max,
        }
    }

    /// Whether the element under `key` is within capacity by itself
    fn fits_alone(&self, key: &ElementKey) -> bool {
        match self.capacity {
            MemoryCapacity::Elements(max) => max > 0,
            MemoryCapacity::Bytes(max) => self
                .entries
                .get(key)
                .map_or(true, |element| element.estimated_size() as u64 <= max),
        }
    }

    /// Evict until within capacity. The element just inserted is never a
    /// victim unless it cannot fit on its own.
    fn evict_to_capacity(&mut self, inserted: &ElementKey) -> Vec<Element> {
        let mut evicted = Vec::new();
        if !self.fits_alone(inserted) {
            if let Some(element) = self.remove(inserted) {
                self.evictions += 1;
                evicted.push(element);
            }
        }

        while self.is_over_capacity() {
            let Some(victim) = self.strategy.peek_victim_except(inserted).cloned() else {
                break;
            };
            if let Some(element) = self.remove(&victim) {
                self.evictions += 1;
                evicted.push(element);
            }
        }
        evicted
    }
}

impl fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTier")
            .field("entries", &self.entries.len())
            .field("size_bytes", &self.size_bytes)
            .field("capacity", &self.capacity)
            .field("policy", &self.strategy.policy())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn element(key: &str) -> Element {
        Element::new_at(key, key, 1_000)
    }

    fn keys_of(elements: &[Element]) -> Vec<String> {
        elements.iter().map(|e| e.key().to_string()).collect()
    }

    #[test]
    fn test_put_and_get() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(10), EvictionPolicy::Lru);

        let outcome = tier.put(element("a"));
        assert!(outcome.previous.is_none());
        assert!(outcome.evicted.is_empty());

        let found = tier.get(&ElementKey::from("a"), 2_000).unwrap();
        assert_eq!(found.hit_count(), 1);
        assert_eq!(found.last_access_time(), 2_000);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_get_quiet_leaves_statistics() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(10), EvictionPolicy::Lru);
        tier.put(element("a"));

        let found = tier.get_quiet(&ElementKey::from("a")).unwrap();
        assert_eq!(found.hit_count(), 0);
        assert_eq!(found.last_access_time(), 0);
    }

    #[test]
    fn test_replace_returns_previous() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(10), EvictionPolicy::Lru);
        tier.put(Element::new_at("a", "one", 1_000));

        let outcome = tier.put(Element::new_at("a", "two", 2_000));
        assert_eq!(outcome.previous.unwrap().value().as_text(), Some("one"));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), tier.calculate_size());
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(2), EvictionPolicy::Lru);
        tier.put(element("a"));
        tier.put(element("b"));
        tier.get(&ElementKey::from("a"), 2_000);

        let outcome = tier.put(element("c"));
        assert_eq!(keys_of(&outcome.evicted), vec!["b"]);
        assert!(tier.contains_key(&ElementKey::from("a")));
        assert!(tier.contains_key(&ElementKey::from("c")));
    }

    #[test]
    fn test_fifo_eviction_order() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(2), EvictionPolicy::Fifo);
        tier.put(element("a"));
        tier.put(element("b"));
        tier.get(&ElementKey::from("a"), 2_000);

        let outcome = tier.put(element("c"));
        assert_eq!(keys_of(&outcome.evicted), vec!["a"]);
    }

    #[test]
    fn test_lfu_eviction_order() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(2), EvictionPolicy::Lfu);
        tier.put(element("a"));
        tier.put(element("b"));
        tier.get(&ElementKey::from("a"), 2_000);
        tier.get(&ElementKey::from("b"), 2_000);
        tier.get(&ElementKey::from("b"), 2_000);

        // c has the fewest hits but was just added; a is next
        let outcome = tier.put(element("c"));
        assert_eq!(keys_of(&outcome.evicted), vec!["a"]);
        assert!(tier.contains_key(&ElementKey::from("b")));
        assert!(tier.contains_key(&ElementKey::from("c")));
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_oversized_element_evicts_only_itself() {
        let small = Element::new_at("a", vec![0u8; 10], 1_000).estimated_size() as u64;
        let mut tier = MemoryTier::new(MemoryCapacity::Bytes(small * 2), EvictionPolicy::Lfu);
        tier.put(Element::new_at("a", vec![0u8; 10], 1_000));

        let outcome = tier.put(Element::new_at("big", vec![0u8; 4096], 1_000));
        assert_eq!(keys_of(&outcome.evicted), vec!["big"]);
        assert!(tier.contains_key(&ElementKey::from("a")));
        assert_eq!(tier.size_bytes(), tier.calculate_size());
    }

    #[test]
    fn test_zero_capacity_evicts_inserted() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(0), EvictionPolicy::Lru);
        let outcome = tier.put(element("a"));

        assert_eq!(keys_of(&outcome.evicted), vec!["a"]);
        assert!(tier.is_empty());
        assert_eq!(tier.size_bytes(), 0);
    }

    #[test]
    fn test_byte_capacity() {
        let one = Element::new_at("a", vec![0u8; 100], 1_000).estimated_size() as u64;
        let mut tier = MemoryTier::new(MemoryCapacity::Bytes(one * 2), EvictionPolicy::Lru);

        tier.put(Element::new_at("a", vec![0u8; 100], 1_000));
        tier.put(Element::new_at("b", vec![0u8; 100], 1_000));
        assert!(tier.stats().evictions == 0);

        let outcome = tier.put(Element::new_at("c", vec![0u8; 100], 1_000));
        assert_eq!(keys_of(&outcome.evicted), vec!["a"]);
        assert!(tier.size_bytes() <= one * 2);
    }

    #[test]
    fn test_remove_expired() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(10), EvictionPolicy::Lru);
        tier.put(Element::new_at("old", "v", 1_000));
        tier.put(Element::new_at("new", "v", 9_000));

        let expiry = ExpiryPolicy::new(false, 5, 0);
        let expired = tier.remove_expired(&expiry, 10_000);

        assert_eq!(keys_of(&expired), vec!["old"]);
        assert_eq!(tier.keys(), vec![ElementKey::from("new")]);
    }

    #[test]
    fn test_drain_and_remove_all() {
        let mut tier = MemoryTier::new(MemoryCapacity::Elements(10), EvictionPolicy::Fifo);
        tier.put(element("a"));
        tier.put(element("b"));

        assert_eq!(tier.drain().len(), 2);
        assert!(tier.is_empty());

        tier.put(element("c"));
        assert_eq!(tier.remove_all(), 1);
        assert_eq!(tier.size_bytes(), 0);
    }
}
