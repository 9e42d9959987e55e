//! Cache Configuration
//!
//! Per-cache options. Values are plain data; hosts may deserialize them
//! from whatever configuration format they use.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::compression::CompressionAlgorithm;
use crate::cache::disk::SpoolPolicy;
use crate::cache::expiry::ExpiryPolicy;
use crate::cache::memory::MemoryCapacity;
use crate::cache::policy::EvictionPolicy;
use crate::cache::{DEFAULT_EXPIRY_THREAD_INTERVAL_SECONDS, DEFAULT_SPOOL_BUFFER_BYTES};
use crate::error::{Error, Result};

/// Configuration of a single cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfiguration {
    /// Unique name within a manager; also the disk file stem
    pub name: String,
    pub memory_capacity: MemoryCapacity,
    pub eviction_policy: EvictionPolicy,
    /// Spool memory evictions to the disk tier instead of discarding them
    pub overflow_to_disk: bool,
    /// Elements never expire (unless they opt out individually)
    pub eternal: bool,
    /// 0 = unlimited
    pub time_to_live_seconds: u64,
    /// 0 = unlimited
    pub time_to_idle_seconds: u64,
    /// Keep the disk tier across restarts
    pub disk_persistent: bool,
    /// Period of the background expiry sweep
    pub disk_expiry_thread_interval_seconds: u64,
    /// Directory for disk files; the manager supplies one when absent
    pub disk_store_path: Option<PathBuf>,
    /// Memory budget for elements waiting to be written to disk
    pub disk_spool_buffer_bytes: u64,
    pub spool_policy: SpoolPolicy,
    pub disk_compression: CompressionAlgorithm,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            memory_capacity: MemoryCapacity::default(),
            eviction_policy: EvictionPolicy::Lru,
            overflow_to_disk: false,
            eternal: false,
            time_to_live_seconds: 0,
            time_to_idle_seconds: 0,
            disk_persistent: false,
            disk_expiry_thread_interval_seconds: DEFAULT_EXPIRY_THREAD_INTERVAL_SECONDS,
            disk_store_path: None,
            disk_spool_buffer_bytes: DEFAULT_SPOOL_BUFFER_BYTES,
            spool_policy: SpoolPolicy::Block,
            disk_compression: CompressionAlgorithm::Lz4,
        }
    }
}

impl CacheConfiguration {
    /// Configuration holding at most `max_elements_in_memory` elements
    pub fn new(name: impl Into<String>, max_elements_in_memory: usize) -> Self {
        Self {
            name: name.into(),
            memory_capacity: MemoryCapacity::Elements(max_elements_in_memory),
            ..Default::default()
        }
    }

    pub fn with_memory_capacity(mut self, capacity: MemoryCapacity) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_overflow_to_disk(mut self, overflow: bool) -> Self {
        self.overflow_to_disk = overflow;
        self
    }

    pub fn with_eternal(mut self, eternal: bool) -> Self {
        self.eternal = eternal;
        self
    }

    pub fn with_time_to_live(mut self, seconds: u64) -> Self {
        self.time_to_live_seconds = seconds;
        self
    }

    pub fn with_time_to_idle(mut self, seconds: u64) -> Self {
        self.time_to_idle_seconds = seconds;
        self
    }

    pub fn with_disk_persistent(mut self, persistent: bool) -> Self {
        self.disk_persistent = persistent;
        self
    }

    pub fn with_disk_expiry_thread_interval(mut self, seconds: u64) -> Self {
        self.disk_expiry_thread_interval_seconds = seconds;
        self
    }

    pub fn with_disk_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_store_path = Some(path.into());
        self
    }

    pub fn with_spool_buffer(mut self, bytes: u64, policy: SpoolPolicy) -> Self {
        self.disk_spool_buffer_bytes = bytes;
        self.spool_policy = policy;
        self
    }

    pub fn with_disk_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.disk_compression = compression;
        self
    }

    /// Whether a cache with this configuration has a disk tier
    pub fn uses_disk(&self) -> bool {
        self.overflow_to_disk || self.disk_persistent
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(
            self.eternal,
            self.time_to_live_seconds,
            self.time_to_idle_seconds,
        )
    }

    /// Reject illegal option combinations
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.disk_expiry_thread_interval_seconds == 0 {
            return Err(Error::Config(format!(
                "cache {}: disk_expiry_thread_interval_seconds must be positive",
                self.name
            )));
        }

        if self.uses_disk() && self.disk_spool_buffer_bytes == 0 {
            return Err(Error::Config(format!(
                "cache {}: disk_spool_buffer_bytes must be positive when a disk tier is used",
                self.name
            )));
        }

        if self.eternal && (self.time_to_live_seconds > 0 || self.time_to_idle_seconds > 0) {
            warn!(
                cache = %self.name,
                ttl = self.time_to_live_seconds,
                tti = self.time_to_idle_seconds,
                "Cache is eternal; time-to-live and time-to-idle are ignored"
            );
        }

        Ok(())
    }
}

/// Cache names become file names: non-empty, no path separators
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = CacheConfiguration::default();
        assert_eq!(config.disk_expiry_thread_interval_seconds, 120);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(!config.uses_disk());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CacheConfiguration::new("orders", 500)
            .with_eviction_policy(EvictionPolicy::Lfu)
            .with_disk_persistent(true)
            .with_time_to_idle(30);

        assert_eq!(config.memory_capacity, MemoryCapacity::Elements(500));
        assert!(config.uses_disk());
        assert_eq!(config.expiry_policy(), ExpiryPolicy::new(false, 0, 30));
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "  ", "a/b", "a\\b"] {
            let config = CacheConfiguration::new(name, 10);
            assert_matches!(config.validate(), Err(Error::InvalidName(_)));
        }
    }

    #[test]
    fn test_illegal_combinations() {
        let config = CacheConfiguration::new("c", 10).with_disk_expiry_thread_interval(0);
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfiguration::new("c", 10)
            .with_overflow_to_disk(true)
            .with_spool_buffer(0, SpoolPolicy::Drop);
        assert_matches!(config.validate(), Err(Error::Config(_)));

        // Irrelevant without a disk tier
        let config = CacheConfiguration::new("c", 10).with_spool_buffer(0, SpoolPolicy::Drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = CacheConfiguration::new("c", 10)
            .with_memory_capacity(MemoryCapacity::Bytes(4096))
            .with_eviction_policy(EvictionPolicy::Fifo);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"fifo\""));

        let parsed: CacheConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let partial: CacheConfiguration =
            serde_json::from_str(r#"{"name": "p", "overflow_to_disk": true}"#).unwrap();
        assert_eq!(partial.name, "p");
        assert!(partial.overflow_to_disk);
        assert_eq!(partial.disk_expiry_thread_interval_seconds, 120);
    }
}
