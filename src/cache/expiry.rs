//! Expiry Policy
//!
//! Time-to-live / time-to-idle evaluation and the clock it is measured
//! against.
//!
//! An element is expired when either window has elapsed:
//!
//! ```text
//! now - creation_time             > time_to_live   (if time_to_live > 0)
//! now - max(creation, last_access) > time_to_idle  (if time_to_idle > 0)
//! ```
//!
//! An explicit per-element `eternal` flag takes precedence over the
//! cache's flag in both directions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::element::Element;

/// Milliseconds since the Unix epoch
pub fn current_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time for a cache
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        current_time_millis()
    }
}

/// Manually advanced clock for deterministic expiry
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance_millis(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(secs * 1000);
    }

    pub fn set_millis(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Expiry Policy
// =============================================================================

/// Cache-wide expiry defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpiryPolicy {
    /// Elements never expire unless they opt out individually
    pub eternal: bool,
    /// Maximum lifetime in seconds (0 = unlimited)
    pub time_to_live_seconds: u64,
    /// Maximum idle time in seconds (0 = unlimited)
    pub time_to_idle_seconds: u64,
}

impl ExpiryPolicy {
    pub fn new(eternal: bool, time_to_live_seconds: u64, time_to_idle_seconds: u64) -> Self {
        Self {
            eternal,
            time_to_live_seconds,
            time_to_idle_seconds,
        }
    }

    /// Policy under which nothing expires
    pub fn eternal() -> Self {
        Self::new(true, 0, 0)
    }

    fn is_eternal_for(&self, element: &Element) -> bool {
        element.eternal().unwrap_or(self.eternal)
    }

    /// Whether `element` has expired at `now` (milliseconds)
    pub fn is_expired(&self, element: &Element, now: u64) -> bool {
        match self.expiration_time(element) {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    /// Absolute instant after which `element` is expired, `None` if never
    pub fn expiration_time(&self, element: &Element) -> Option<u64> {
        if self.is_eternal_for(element) {
            return None;
        }

        let ttl = element.time_to_live().unwrap_or(self.time_to_live_seconds);
        let tti = element.time_to_idle().unwrap_or(self.time_to_idle_seconds);

        let ttl_expiry = (ttl > 0).then(|| {
            element
                .creation_time()
                .saturating_add(ttl.saturating_mul(1000))
        });
        let tti_expiry = (tti > 0).then(|| {
            element
                .last_touched()
                .saturating_add(tti.saturating_mul(1000))
        });

        match (ttl_expiry, tti_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
