//! Spool: the bounded hand-off queue between evicting callers and the
//! disk mover thread.
//!
//! Queued elements stay visible to lookups by key until the mover has
//! written them. Each key is queued at most once; re-queueing replaces
//! the pending element. Memory held by the queue is bounded by a byte
//! budget of estimated element sizes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::cache::element::{Element, ElementKey};
use crate::cache::expiry::ExpiryPolicy;

/// What happens when an element does not fit in the spool budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoolPolicy {
    /// Wait until the mover frees enough budget
    #[default]
    Block,
    /// Discard the incoming element
    Drop,
}

impl std::str::FromStr for SpoolPolicy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(SpoolPolicy::Block),
            "drop" => Ok(SpoolPolicy::Drop),
            other => Err(crate::error::Error::Config(format!(
                "unknown spool policy: {}",
                other
            ))),
        }
    }
}

/// Why an element was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotSerializable,
    SpoolFull,
    Closed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DropReason::NotSerializable => "value not serializable",
            DropReason::SpoolFull => "spool budget exhausted",
            DropReason::Closed => "disk tier shutting down",
        };
        write!(f, "{}", reason)
    }
}

struct Pending {
    sequence: u64,
    size: u64,
    element: Element,
}

#[derive(Default)]
struct SpoolState {
    entries: HashMap<ElementKey, Pending>,
    /// Hand-off order; entries whose sequence no longer matches are stale
    order: VecDeque<(u64, ElementKey)>,
    bytes: u64,
    sequence: u64,
    closed: bool,
}

impl SpoolState {
    fn take(&mut self, key: &ElementKey) -> Option<Pending> {
        let pending = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(pending.size);
        Some(pending)
    }
}

pub(crate) struct Spool {
    state: Mutex<SpoolState>,
    not_empty: Condvar,
    not_full: Condvar,
    budget_bytes: u64,
    policy: SpoolPolicy,
}

impl Spool {
    pub fn new(budget_bytes: u64, policy: SpoolPolicy) -> Self {
        Self {
            state: Mutex::new(SpoolState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            budget_bytes,
            policy,
        }
    }

    /// Queue an element for writing.
    ///
    /// An element always fits into an empty spool, so a single oversized
    /// element cannot wedge the queue.
    pub fn enqueue(&self, element: Element) -> Result<(), DropReason> {
        if !element.is_serializable() {
            return Err(DropReason::NotSerializable);
        }

        let size = element.estimated_size() as u64;
        let key = element.key().clone();
        let mut state = self.state.lock();
        if state.closed {
            return Err(DropReason::Closed);
        }

        // A replaced entry gives its budget back first
        if state.take(&key).is_some() {
            self.not_full.notify_all();
        }

        while state.bytes > 0 && state.bytes + size > self.budget_bytes {
            match self.policy {
                SpoolPolicy::Drop => return Err(DropReason::SpoolFull),
                SpoolPolicy::Block => {
                    self.not_full.wait(&mut state);
                    if state.closed {
                        return Err(DropReason::Closed);
                    }
                }
            }
        }

        state.sequence += 1;
        let sequence = state.sequence;
        state.order.push_back((sequence, key.clone()));
        state.bytes += size;
        state.entries.insert(
            key,
            Pending {
                sequence,
                size,
                element,
            },
        );
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the oldest queued element
    pub fn pop(&self) -> Option<Element> {
        let mut state = self.state.lock();
        while let Some((sequence, key)) = state.order.pop_front() {
            let current = state.entries.get(&key).map(|p| p.sequence);
            if current == Some(sequence) {
                let pending = state.take(&key)?;
                self.not_full.notify_all();
                return Some(pending.element);
            }
        }
        None
    }

    /// Remove a queued element by key
    pub fn take(&self, key: &ElementKey) -> Option<Element> {
        let pending = self.state.lock().take(key)?;
        self.not_full.notify_all();
        Some(pending.element)
    }

    pub fn peek(&self, key: &ElementKey) -> Option<Element> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|p| p.element.clone())
    }

    pub fn contains_key(&self, key: &ElementKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ElementKey> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Remove and return every queued element expired at `now`
    pub fn remove_expired(&self, expiry: &ExpiryPolicy, now: u64) -> Vec<Element> {
        let mut state = self.state.lock();
        let expired: Vec<ElementKey> = state
            .entries
            .iter()
            .filter(|(_, p)| expiry.is_expired(&p.element, now))
            .map(|(key, _)| key.clone())
            .collect();

        let removed: Vec<Element> = expired
            .iter()
            .filter_map(|key| state.take(key))
            .map(|p| p.element)
            .collect();
        if !removed.is_empty() {
            self.not_full.notify_all();
        }
        removed
    }

    /// Discard every queued element, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.order.clear();
        state.bytes = 0;
        self.not_full.notify_all();
        count
    }

    /// Wait until there is work or the spool is closed.
    ///
    /// Returns `false` once the spool is closed and empty.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.entries.is_empty() && !state.closed {
            self.not_empty.wait_for(&mut state, timeout);
        }
        !state.closed || !state.entries.is_empty()
    }

    /// Stop accepting elements; queued elements are kept for draining
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::element::OpaqueValue;
    use std::sync::Arc;

    fn element(key: &str) -> Element {
        Element::new_at(key, vec![0u8; 64], 1_000)
    }

    #[test]
    fn test_fifo_hand_off() {
        let spool = Spool::new(u64::MAX, SpoolPolicy::Block);
        spool.enqueue(element("a")).unwrap();
        spool.enqueue(element("b")).unwrap();

        assert_eq!(spool.pop().unwrap().key(), &ElementKey::from("a"));
        assert_eq!(spool.pop().unwrap().key(), &ElementKey::from("b"));
        assert!(spool.pop().is_none());
        assert_eq!(spool.bytes(), 0);
    }

    #[test]
    fn test_requeue_replaces() {
        let spool = Spool::new(u64::MAX, SpoolPolicy::Block);
        spool.enqueue(Element::new_at("a", "one", 1)).unwrap();
        spool.enqueue(element("b")).unwrap();
        spool.enqueue(Element::new_at("a", "two", 2)).unwrap();

        assert_eq!(spool.len(), 2);
        assert_eq!(spool.pop().unwrap().key(), &ElementKey::from("b"));
        assert_eq!(spool.pop().unwrap().value().as_text(), Some("two"));
    }

    #[test]
    fn test_take_and_peek() {
        let spool = Spool::new(u64::MAX, SpoolPolicy::Block);
        spool.enqueue(element("a")).unwrap();

        assert!(spool.peek(&ElementKey::from("a")).is_some());
        assert!(spool.take(&ElementKey::from("a")).is_some());
        assert!(!spool.contains_key(&ElementKey::from("a")));
        // stale order entry is skipped
        assert!(spool.pop().is_none());
    }

    #[test]
    fn test_non_serializable_rejected() {
        let spool = Spool::new(u64::MAX, SpoolPolicy::Block);
        let result = spool.enqueue(Element::new("a", OpaqueValue::new(1u8)));
        assert_eq!(result, Err(DropReason::NotSerializable));
    }

    #[test]
    fn test_drop_policy_budget() {
        let size = element("a").estimated_size() as u64;
        let spool = Spool::new(size * 2, SpoolPolicy::Drop);

        spool.enqueue(element("a")).unwrap();
        spool.enqueue(element("b")).unwrap();
        assert_eq!(spool.enqueue(element("c")), Err(DropReason::SpoolFull));

        spool.pop();
        spool.enqueue(element("c")).unwrap();
        assert!(spool.bytes() <= size * 2);
    }

    #[test]
    fn test_oversized_element_fits_empty_spool() {
        let spool = Spool::new(1, SpoolPolicy::Drop);
        spool.enqueue(element("a")).unwrap();
        assert_eq!(spool.enqueue(element("b")), Err(DropReason::SpoolFull));
    }

    #[test]
    fn test_block_policy_waits_for_pop() {
        let size = element("a").estimated_size() as u64;
        let spool = Arc::new(Spool::new(size, SpoolPolicy::Block));
        spool.enqueue(element("a")).unwrap();

        let producer = {
            let spool = Arc::clone(&spool);
            std::thread::spawn(move || spool.enqueue(element("b")))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(spool.len(), 1);

        assert!(spool.pop().is_some());
        producer.join().unwrap().unwrap();
        assert!(spool.contains_key(&ElementKey::from("b")));
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let size = element("a").estimated_size() as u64;
        let spool = Arc::new(Spool::new(size, SpoolPolicy::Block));
        spool.enqueue(element("a")).unwrap();

        let producer = {
            let spool = Arc::clone(&spool);
            std::thread::spawn(move || spool.enqueue(element("b")))
        };

        std::thread::sleep(Duration::from_millis(50));
        spool.close();
        assert_eq!(producer.join().unwrap(), Err(DropReason::Closed));

        // closed but not empty: still work to drain
        assert!(spool.wait_for_work(Duration::from_millis(1)));
        spool.pop();
        assert!(!spool.wait_for_work(Duration::from_millis(1)));
    }

    #[test]
    fn test_remove_expired() {
        let spool = Spool::new(u64::MAX, SpoolPolicy::Block);
        spool.enqueue(Element::new_at("old", "v", 1_000)).unwrap();
        spool.enqueue(Element::new_at("new", "v", 9_000)).unwrap();

        let expired = spool.remove_expired(&ExpiryPolicy::new(false, 5, 0), 10_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(spool.keys(), vec![ElementKey::from("new")]);
    }
}
