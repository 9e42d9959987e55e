//! Cache Element Types
//!
//! The key/value pair stored by a cache, together with the access and
//! lifetime metadata that eviction and expiry decisions are based on.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::expiry::current_time_millis;

/// Fixed per-element bookkeeping counted by size estimates
const ELEMENT_OVERHEAD_BYTES: usize = std::mem::size_of::<Element>();

// =============================================================================
// Element Key
// =============================================================================

/// Key under which an element is stored
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementKey {
    /// UTF-8 key
    Text(String),
    /// Integer key
    Int(i64),
    /// Raw byte key
    Bytes(Vec<u8>),
}

impl ElementKey {
    /// Approximate heap footprint of the key
    pub fn deep_size(&self) -> usize {
        match self {
            ElementKey::Text(s) => s.capacity(),
            ElementKey::Int(_) => 0,
            ElementKey::Bytes(b) => b.capacity(),
        }
    }

    /// Text form of the key, if it is a text key
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ElementKey::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKey::Text(s) => write!(f, "{}", s),
            ElementKey::Int(i) => write!(f, "{}", i),
            ElementKey::Bytes(b) => {
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for ElementKey {
    fn from(s: &str) -> Self {
        ElementKey::Text(s.to_string())
    }
}

impl From<String> for ElementKey {
    fn from(s: String) -> Self {
        ElementKey::Text(s)
    }
}

impl From<i64> for ElementKey {
    fn from(i: i64) -> Self {
        ElementKey::Int(i)
    }
}

impl From<Vec<u8>> for ElementKey {
    fn from(b: Vec<u8>) -> Self {
        ElementKey::Bytes(b)
    }
}

// =============================================================================
// Element Value
// =============================================================================

/// In-process value that never leaves memory.
///
/// Elements holding an opaque value are discarded instead of being
/// written to the disk tier.
#[derive(Clone)]
pub struct OpaqueValue {
    inner: Arc<dyn Any + Send + Sync>,
    size_hint: usize,
}

impl OpaqueValue {
    /// Wrap a value, estimating its size from its type
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            size_hint: std::mem::size_of::<T>(),
        }
    }

    /// Wrap a value with an explicit heap size estimate
    pub fn with_size_hint<T: Any + Send + Sync>(value: T, size_hint: usize) -> Self {
        Self {
            inner: Arc::new(value),
            size_hint,
        }
    }

    /// Borrow the wrapped value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn size_hint(&self) -> usize {
        self.size_hint
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueValue")
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Value held by an element
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ElementValue {
    /// Absent value; stored like any other
    #[default]
    Null,
    /// Raw bytes
    Bytes(Bytes),
    /// UTF-8 text
    Text(String),
    /// Signed integer
    Integer(i64),
    /// Structured JSON document
    Json(serde_json::Value),
    /// Non-serializable in-process value
    Opaque(OpaqueValue),
}

impl ElementValue {
    /// Whether the value can be written to the disk tier
    pub fn is_serializable(&self) -> bool {
        !matches!(self, ElementValue::Opaque(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ElementValue::Null)
    }

    /// Approximate heap footprint of the value, following nested structure
    pub fn deep_size(&self) -> usize {
        match self {
            ElementValue::Null | ElementValue::Integer(_) => 0,
            ElementValue::Bytes(b) => b.len(),
            ElementValue::Text(s) => s.capacity(),
            ElementValue::Json(v) => json_deep_size(v),
            ElementValue::Opaque(o) => o.size_hint(),
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ElementValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ElementValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ElementValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ElementValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

fn json_deep_size(value: &serde_json::Value) -> usize {
    use serde_json::Value;

    let node = std::mem::size_of::<Value>();
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => node,
        Value::String(s) => node + s.capacity(),
        Value::Array(items) => node + items.iter().map(json_deep_size).sum::<usize>(),
        Value::Object(map) => {
            node + map
                .iter()
                .map(|(k, v)| k.capacity() + json_deep_size(v))
                .sum::<usize>()
        }
    }
}

impl From<Bytes> for ElementValue {
    fn from(b: Bytes) -> Self {
        ElementValue::Bytes(b)
    }
}

impl From<Vec<u8>> for ElementValue {
    fn from(b: Vec<u8>) -> Self {
        ElementValue::Bytes(Bytes::from(b))
    }
}

impl From<&str> for ElementValue {
    fn from(s: &str) -> Self {
        ElementValue::Text(s.to_string())
    }
}

impl From<String> for ElementValue {
    fn from(s: String) -> Self {
        ElementValue::Text(s)
    }
}

impl From<i64> for ElementValue {
    fn from(i: i64) -> Self {
        ElementValue::Integer(i)
    }
}

impl From<serde_json::Value> for ElementValue {
    fn from(v: serde_json::Value) -> Self {
        ElementValue::Json(v)
    }
}

impl From<OpaqueValue> for ElementValue {
    fn from(o: OpaqueValue) -> Self {
        ElementValue::Opaque(o)
    }
}

// =============================================================================
// Element
// =============================================================================

/// A cached key/value pair with its access and lifetime metadata.
///
/// Timestamps are milliseconds since the Unix epoch; `0` means "never".
/// A per-element `eternal`, `time_to_live` or `time_to_idle` set here
/// overrides the cache-wide default for this element only.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    key: ElementKey,
    value: ElementValue,
    version: u64,
    creation_time: u64,
    last_access_time: u64,
    last_update_time: u64,
    hit_count: u64,
    eternal: Option<bool>,
    time_to_live_seconds: Option<u64>,
    time_to_idle_seconds: Option<u64>,
}

impl Element {
    /// Create an element stamped with the current wall-clock time
    pub fn new(key: impl Into<ElementKey>, value: impl Into<ElementValue>) -> Self {
        Self::new_at(key, value, current_time_millis())
    }

    /// Create an element with an explicit creation time
    pub fn new_at(
        key: impl Into<ElementKey>,
        value: impl Into<ElementValue>,
        creation_time: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version: 1,
            creation_time,
            last_access_time: 0,
            last_update_time: 0,
            hit_count: 0,
            eternal: None,
            time_to_live_seconds: None,
            time_to_idle_seconds: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Override the cache's eternal flag for this element
    pub fn with_eternal(mut self, eternal: bool) -> Self {
        self.eternal = Some(eternal);
        self
    }

    /// Override the cache's time-to-live for this element
    pub fn with_time_to_live(mut self, seconds: u64) -> Self {
        self.time_to_live_seconds = Some(seconds);
        self
    }

    /// Override the cache's time-to-idle for this element
    pub fn with_time_to_idle(mut self, seconds: u64) -> Self {
        self.time_to_idle_seconds = Some(seconds);
        self
    }

    #[inline]
    pub fn key(&self) -> &ElementKey {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &ElementValue {
        &self.value
    }

    pub fn into_value(self) -> ElementValue {
        self.value
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    #[inline]
    pub fn last_access_time(&self) -> u64 {
        self.last_access_time
    }

    #[inline]
    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn eternal(&self) -> Option<bool> {
        self.eternal
    }

    pub fn time_to_live(&self) -> Option<u64> {
        self.time_to_live_seconds
    }

    pub fn time_to_idle(&self) -> Option<u64> {
        self.time_to_idle_seconds
    }

    /// Most recent of creation and last access, the start of the idle window
    pub fn last_touched(&self) -> u64 {
        self.creation_time.max(self.last_access_time)
    }

    /// Record a read: bump the hit count and move the access time forward
    pub fn record_access(&mut self, now: u64) {
        self.hit_count = self.hit_count.saturating_add(1);
        self.last_access_time = now;
    }

    /// Record that this element replaced a stored element of `previous_version`
    pub fn record_update(&mut self, now: u64, previous_version: u64) {
        self.version = previous_version.saturating_add(1);
        self.last_update_time = now;
    }

    /// Start a fresh lifetime at `now`, clearing access statistics
    pub fn reset_access_statistics(&mut self, now: u64) {
        self.creation_time = now;
        self.last_access_time = 0;
        self.hit_count = 0;
    }

    /// Carry creation and access statistics over from the element being replaced
    pub fn inherit_statistics(&mut self, previous: &Element) {
        self.creation_time = previous.creation_time;
        self.last_access_time = previous.last_access_time;
        self.hit_count = previous.hit_count;
    }

    pub fn is_serializable(&self) -> bool {
        self.value.is_serializable()
    }

    /// Estimated in-memory size of the element, key and value included
    pub fn estimated_size(&self) -> usize {
        ELEMENT_OVERHEAD_BYTES + self.key.deep_size() + self.value.deep_size()
    }

    /// Rebuild an element from its persisted parts
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        key: ElementKey,
        value: ElementValue,
        version: u64,
        creation_time: u64,
        last_access_time: u64,
        last_update_time: u64,
        hit_count: u64,
        eternal: Option<bool>,
        time_to_live_seconds: Option<u64>,
        time_to_idle_seconds: Option<u64>,
    ) -> Self {
        Self {
            key,
            value,
            version,
            creation_time,
            last_access_time,
            last_update_time,
            hit_count,
            eternal,
            time_to_live_seconds,
            time_to_idle_seconds,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
