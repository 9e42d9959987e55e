//! Tiered Cache
//!
//! A bounded in-memory tier that overflows to a disk tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Cache                            │
//! │  lifecycle · expiry · listeners · loaders · statistics   │
//! ├──────────────────────────────────────────────────────────┤
//! │  MemoryTier (LRU / LFU / FIFO)                           │
//! │         │ eviction                          ▲ promotion  │
//! │         ▼                                   │            │
//! │  DiskTier: spool ──▶ mover thread ──▶ data file + index  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! An element lives in exactly one tier at a time. Reads that hit disk
//! move the element back into memory; memory evictions are queued on the
//! spool and written asynchronously.

pub mod compression;
pub mod disk;
pub mod element;
pub mod engine;
pub mod events;
pub mod expiry;
pub mod loader;
pub mod memory;
pub mod policy;
pub mod statistics;

mod proptest;
mod reaper;

use std::path::PathBuf;

pub use compression::CompressionAlgorithm;
pub use disk::{DiskStats, DropReason, SpoolPolicy};
pub use element::{Element, ElementKey, ElementValue, OpaqueValue};
pub use engine::{Cache, Status};
pub use events::{CacheEvent, CacheEventListener, EventCollector, LoggingListener, RegisteredListeners};
pub use expiry::{Clock, ExpiryPolicy, ManualClock, SystemClock};
pub use loader::{BootstrapCacheLoader, CacheLoader, FnLoader};
pub use memory::{MemoryCapacity, MemoryStats};
pub use policy::EvictionPolicy;
pub use statistics::StatisticsSnapshot;

/// Memory capacity used when none is configured
pub const DEFAULT_MAX_ELEMENTS_IN_MEMORY: usize = 10_000;

/// Period of the background expiry sweep
pub const DEFAULT_EXPIRY_THREAD_INTERVAL_SECONDS: u64 = 120;

/// Memory budget of the disk spool (30 MiB)
pub const DEFAULT_SPOOL_BUFFER_BYTES: u64 = 30 * 1024 * 1024;

/// Disk directory for caches that were given none
pub fn default_disk_store_path() -> PathBuf {
    std::env::temp_dir().join("tiercache")
}
