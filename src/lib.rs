//! tiercache - Tiered In-Process Cache
//!
//! A bounded in-memory cache that overflows evicted elements to a local
//! disk tier, with per-element expiry, pluggable eviction policies,
//! listeners, loaders and an explicit cache registry.
//!
//! # Architecture
//!
//! ```text
//! CacheManager ──owns──▶ Cache ──▶ MemoryTier (LRU / LFU / FIFO)
//!                          │            │ evict        ▲ promote
//!                          │            ▼              │
//!                          │        DiskTier (spool → mover → data file)
//!                          │
//!                          ├──▶ listeners, loader, bootstrap loader
//!                          └──▶ expiry reaper thread
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tiercache::{Cache, CacheConfiguration, Element};
//!
//! # fn main() -> tiercache::Result<()> {
//! let config = CacheConfiguration::new("users", 1_000)
//!     .with_overflow_to_disk(true)
//!     .with_time_to_idle(300);
//! let cache = Cache::new(config)?;
//! cache.initialise()?;
//!
//! cache.put(Element::new("alice", "admin"))?;
//! assert!(cache.get("alice")?.is_some());
//! cache.dispose()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Elements, tiers, the cache engine and its hooks
//! - [`config`] - Per-cache configuration
//! - [`error`] - Error types
//! - [`manager`] - Registry of named caches

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;

// Re-export commonly used types
pub use cache::{
    BootstrapCacheLoader, Cache, CacheEventListener, CacheLoader, Element, ElementKey,
    ElementValue, EvictionPolicy, MemoryCapacity, Status,
};
pub use config::CacheConfiguration;
pub use error::{Error, Result};
pub use manager::{CacheManager, ManagerConfiguration};
