//! Cache Manager
//!
//! An explicit registry of named caches. Each manager is independent, so
//! a process may hold several (one per test, for instance).
//!
//! Adding a cache gives it the manager's disk directory when it has none
//! and initialises it; removing it disposes it.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::engine::{Cache, Status};
use crate::cache::expiry::{Clock, SystemClock};
use crate::config::CacheConfiguration;
use crate::error::{Error, Result};

/// Manager-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfiguration {
    /// Directory for disk tiers of caches that do not name their own
    pub disk_store_path: PathBuf,
    /// Template for `add_cache_named`
    pub default_cache: CacheConfiguration,
}

impl Default for ManagerConfiguration {
    fn default() -> Self {
        Self {
            disk_store_path: crate::cache::default_disk_store_path(),
            default_cache: CacheConfiguration::default(),
        }
    }
}

impl ManagerConfiguration {
    pub fn new(disk_store_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_store_path: disk_store_path.into(),
            ..Default::default()
        }
    }

    pub fn with_default_cache(mut self, config: CacheConfiguration) -> Self {
        self.default_cache = config;
        self
    }
}

/// Registry owning a set of caches
pub struct CacheManager {
    config: ManagerConfiguration,
    caches: DashMap<String, Cache>,
    status: RwLock<Status>,
    clock: Arc<dyn Clock>,
}

impl CacheManager {
    pub fn new(config: ManagerConfiguration) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Manager whose `add_cache_named` caches measure time with `clock`
    pub fn with_clock(config: ManagerConfiguration, clock: Arc<dyn Clock>) -> Self {
        info!(disk_store_path = %config.disk_store_path.display(), "Cache manager created");
        Self {
            config,
            caches: DashMap::new(),
            status: RwLock::new(Status::Alive),
            clock,
        }
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn configuration(&self) -> &ManagerConfiguration {
        &self.config
    }

    /// Register and initialise an uninitialised cache.
    ///
    /// The cache is initialised before it is inserted, so a bootstrap
    /// loader may call back into the manager.
    pub fn add_cache(&self, cache: Cache) -> Result<()> {
        if self.status() != Status::Alive {
            return Err(Error::ManagerShutdown);
        }

        let name = cache.name();
        if cache.status() != Status::Uninitialised {
            return Err(Error::InvalidState {
                cache: name,
                status: cache.status().to_string(),
                operation: "add to a manager".to_string(),
            });
        }
        if self.caches.contains_key(&name) {
            return Err(Error::CacheExists(name));
        }

        if cache.disk_store_path().is_none() {
            cache.set_disk_store_path(self.config.disk_store_path.clone())?;
        }
        cache.initialise()?;

        let status = self.status.read();
        let rejected = if *status != Status::Alive {
            Error::ManagerShutdown
        } else {
            match self.caches.entry(name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(cache);
                    info!(cache = %name, "Cache added");
                    return Ok(());
                }
                Entry::Occupied(_) => Error::CacheExists(name.clone()),
            }
        };
        drop(status);

        // Lost a race with another add or with shutdown
        if let Err(e) = cache.dispose() {
            warn!(cache = %name, error = %e, "Failed to dispose rejected cache");
        }
        Err(rejected)
    }

    /// Create a cache from the default configuration and add it
    pub fn add_cache_named(&self, name: &str) -> Result<Cache> {
        let config = CacheConfiguration {
            name: name.to_string(),
            ..self.config.default_cache.clone()
        };
        let cache = Cache::with_clock(config, Arc::clone(&self.clock))?;
        self.add_cache(cache.clone())?;
        Ok(cache)
    }

    pub fn get_cache(&self, name: &str) -> Option<Cache> {
        self.caches.get(name).map(|entry| entry.value().clone())
    }

    pub fn cache_exists(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Registered cache names, sorted
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Unregister and dispose a cache; `false` if none had this name
    pub fn remove_cache(&self, name: &str) -> Result<bool> {
        match self.caches.remove(name) {
            Some((_, cache)) => {
                cache.dispose()?;
                info!(cache = %name, "Cache removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every element from every cache
    pub fn clear_all(&self) -> Result<()> {
        if self.status() != Status::Alive {
            return Err(Error::ManagerShutdown);
        }
        for cache in self.snapshot() {
            cache.remove_all()?;
        }
        Ok(())
    }

    /// Dispose every cache. Later adds fail; calling again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut status = self.status.write();
            if *status == Status::Shutdown {
                return Ok(());
            }
            *status = Status::Shutdown;
        }

        let mut first_error = None;
        for name in self.cache_names() {
            if let Some((_, cache)) = self.caches.remove(&name) {
                if let Err(e) = cache.dispose() {
                    warn!(cache = %name, error = %e, "Failed to dispose cache during shutdown");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("Cache manager shut down");
        first_error.map_or(Ok(()), Err)
    }

    fn snapshot(&self) -> Vec<Cache> {
        self.caches.iter().map(|e| e.value().clone()).collect()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Cache manager shutdown on drop failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
