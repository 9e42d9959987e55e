//! Cache Engine
//!
//! The public cache: a memory tier backed by an optional disk tier, with
//! a lifecycle, expiry, listeners and loaders.
//!
//! # Lookup Flow
//!
//! ```text
//! get(key)
//!   │
//!   ├─▶ memory ── hit ──▶ expired? ── yes ──▶ remove, notify expire, miss
//!   │                        └─ no ──▶ record access, return
//!   │
//!   ├─▶ disk ──── hit ──▶ expired? ── yes ──▶ remove, notify expire, miss
//!   │                        └─ no ──▶ move to memory (may evict), return
//!   │
//!   └─▶ loader (if registered) ──▶ put, return
//! ```
//!
//! All tier operations for one cache run under its memory lock, so each
//! key is visible in exactly one tier and operations on a key are
//! linearizable. Evicted elements leave through the disk spool and are
//! written by the mover thread, never by the evicting caller.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::disk::{DiskConfig, DiskStats, DiskTier};
use super::element::{Element, ElementKey, ElementValue};
use super::events::{CacheEventListener, Notification, RegisteredListeners};
use super::expiry::{Clock, ExpiryPolicy, SystemClock};
use super::loader::{BootstrapCacheLoader, CacheLoader};
use super::memory::{MemoryStats, MemoryTier};
use super::reaper::Reaper;
use super::statistics::{CacheStatistics, LatencyTracker, StatisticsSnapshot, TierSizes};
use crate::config::{validate_name, CacheConfiguration};
use crate::error::{Error, Result};

/// Lifecycle status of a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Created, not yet initialised; data operations fail
    Uninitialised,
    /// Serving requests
    Alive,
    /// Disposed; terminal
    Shutdown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Uninitialised => write!(f, "uninitialised"),
            Status::Alive => write!(f, "alive"),
            Status::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutMode {
    /// Fresh lifetime and statistics, listeners notified
    Normal,
    /// Stored as given, no statistics or listener notification
    Quiet,
    /// Creation time and access statistics carried over from the stored element
    PreservingStatistics,
}

enum Lookup {
    Hit(Element),
    Expired,
    Missing,
}

pub(crate) struct CacheInner {
    name: RwLock<String>,
    guid: Uuid,
    config: CacheConfiguration,
    expiry: ExpiryPolicy,
    status: RwLock<Status>,
    memory: Mutex<MemoryTier>,
    disk: OnceCell<DiskTier>,
    disk_store_path: RwLock<Option<PathBuf>>,
    listeners: RegisteredListeners,
    loader: RwLock<Option<Arc<dyn CacheLoader>>>,
    bootstrap: RwLock<Option<Arc<dyn BootstrapCacheLoader>>>,
    statistics: Arc<CacheStatistics>,
    clock: Arc<dyn Clock>,
    reaper: Mutex<Option<Reaper>>,
}

/// A cache. Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Create an uninitialised cache
    pub fn new(config: CacheConfiguration) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an uninitialised cache measuring time with `clock`
    pub fn with_clock(config: CacheConfiguration, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let memory = MemoryTier::new(config.memory_capacity, config.eviction_policy);
        let inner = CacheInner {
            name: RwLock::new(config.name.clone()),
            guid: Uuid::new_v4(),
            expiry: config.expiry_policy(),
            status: RwLock::new(Status::Uninitialised),
            memory: Mutex::new(memory),
            disk: OnceCell::new(),
            disk_store_path: RwLock::new(config.disk_store_path.clone()),
            listeners: RegisteredListeners::new(),
            loader: RwLock::new(None),
            bootstrap: RwLock::new(None),
            statistics: Arc::new(CacheStatistics::new()),
            clock,
            reaper: Mutex::new(None),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn from_inner(inner: Arc<CacheInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheInner> {
        Arc::downgrade(&self.inner)
    }

    // =========================================================================
    // Identity and Configuration
    // =========================================================================

    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    /// Rename the cache; only allowed before it is initialised
    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        validate_name(&name)?;
        self.require_uninitialised("rename")?;
        *self.inner.name.write() = name;
        Ok(())
    }

    /// Random identity assigned at construction
    pub fn guid(&self) -> Uuid {
        self.inner.guid
    }

    pub fn status(&self) -> Status {
        *self.inner.status.read()
    }

    pub fn configuration(&self) -> &CacheConfiguration {
        &self.inner.config
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        self.inner.expiry
    }

    /// Directory for the disk tier; only settable before initialisation
    pub fn set_disk_store_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.require_uninitialised("set the disk store path of")?;
        *self.inner.disk_store_path.write() = Some(path.into());
        Ok(())
    }

    pub fn disk_store_path(&self) -> Option<PathBuf> {
        self.inner.disk_store_path.read().clone()
    }

    pub fn event_listeners(&self) -> &RegisteredListeners {
        &self.inner.listeners
    }

    pub fn register_listener(&self, listener: Arc<dyn CacheEventListener>) {
        self.inner.listeners.register(listener);
    }

    pub fn set_loader(&self, loader: Option<Arc<dyn CacheLoader>>) {
        *self.inner.loader.write() = loader;
    }

    /// Install the bootstrap loader run by `initialise()`
    pub fn set_bootstrap_loader(&self, loader: Arc<dyn BootstrapCacheLoader>) -> Result<()> {
        self.require_uninitialised("set the bootstrap loader of")?;
        *self.inner.bootstrap.write() = Some(loader);
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the tiers, start background threads and run the bootstrap
    /// loader. Fails unless the cache is uninitialised.
    pub fn initialise(&self) -> Result<()> {
        let name = self.name();
        {
            let mut status = self.inner.status.write();
            if *status != Status::Uninitialised {
                return Err(self.invalid_state(*status, "initialise"));
            }

            if self.inner.config.uses_disk() {
                let directory = self
                    .disk_store_path()
                    .unwrap_or_else(super::default_disk_store_path);
                let disk = DiskTier::open(
                    DiskConfig {
                        directory,
                        name: name.clone(),
                        persistent: self.inner.config.disk_persistent,
                        spool_budget_bytes: self.inner.config.disk_spool_buffer_bytes,
                        spool_policy: self.inner.config.spool_policy,
                        compression: self.inner.config.disk_compression,
                        expiry: self.inner.expiry,
                    },
                    Arc::clone(&self.inner.statistics),
                )?;
                if self.inner.disk.set(disk).is_err() {
                    warn!(cache = %name, "Disk tier already present");
                }
            }

            *status = Status::Alive;
        }

        if !self.inner.config.eternal {
            let interval =
                Duration::from_secs(self.inner.config.disk_expiry_thread_interval_seconds);
            let reaper = Reaper::start(self.downgrade(), &name, interval)?;
            *self.inner.reaper.lock() = Some(reaper);
        }

        info!(
            cache = %name,
            guid = %self.inner.guid,
            capacity = %self.inner.config.memory_capacity,
            policy = %self.inner.config.eviction_policy,
            disk = self.inner.config.uses_disk(),
            persistent = self.inner.config.disk_persistent,
            "Cache initialised"
        );

        self.run_bootstrap()
    }

    fn run_bootstrap(&self) -> Result<()> {
        let Some(loader) = self.inner.bootstrap.read().clone() else {
            return Ok(());
        };

        if loader.is_asynchronous() {
            let cache = self.clone();
            std::thread::Builder::new()
                .name(format!("{}-bootstrap", self.name()))
                .spawn(move || {
                    if let Err(e) = loader.load(&cache) {
                        error!(cache = %cache.name(), error = %e, "Asynchronous bootstrap failed");
                    }
                })?;
            return Ok(());
        }

        loader.load(self).map_err(|e| Error::Bootstrap {
            cache: self.name(),
            reason: e.to_string(),
        })
    }

    /// Shut the cache down. Persistent caches write every memory element
    /// and the disk index; transient caches discard their contents.
    /// Safe to call more than once.
    pub fn dispose(&self) -> Result<()> {
        {
            let mut status = self.inner.status.write();
            match *status {
                Status::Shutdown => return Ok(()),
                Status::Uninitialised => {
                    *status = Status::Shutdown;
                    return Ok(());
                }
                Status::Alive => *status = Status::Shutdown,
            }
        }

        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.stop();
        }

        let now = self.now();
        let mut result = Ok(());
        {
            let mut memory = self.inner.memory.lock();
            if let Some(disk) = self.disk() {
                if disk.is_persistent() {
                    for element in memory.drain() {
                        if self.inner.expiry.is_expired(&element, now) {
                            continue;
                        }
                        if let Err(e) = disk.write(&element) {
                            self.inner.statistics.record_disk_write_failure();
                            error!(cache = %self.name(), key = %element.key(), error = %e, "Failed to persist element on shutdown");
                        }
                    }
                }
                result = disk.dispose();
            }
            memory.remove_all();
        }

        self.inner.listeners.dispose(self);
        info!(cache = %self.name(), "Cache disposed");
        result
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Store an element, notifying listeners. `None` is ignored.
    ///
    /// The element starts a fresh lifetime: its creation time becomes now
    /// and its hit count and last access time are cleared.
    pub fn put(&self, element: impl Into<Option<Element>>) -> Result<()> {
        self.put_internal(element.into(), PutMode::Normal)
    }

    /// Store an element exactly as given, without statistics or notification
    pub fn put_quiet(&self, element: impl Into<Option<Element>>) -> Result<()> {
        self.put_internal(element.into(), PutMode::Quiet)
    }

    /// Replace an element's value while keeping the stored element's
    /// creation time, hit count and last access time
    pub fn put_preserving_statistics(&self, element: impl Into<Option<Element>>) -> Result<()> {
        self.put_internal(element.into(), PutMode::PreservingStatistics)
    }

    fn put_internal(&self, element: Option<Element>, mode: PutMode) -> Result<()> {
        self.check_alive()?;
        let Some(mut element) = element else {
            debug!(cache = %self.name(), "Ignoring put of absent element");
            return Ok(());
        };

        let now = self.now();
        let notify = mode != PutMode::Quiet && !self.inner.listeners.is_empty();
        let mut notifications = Vec::new();

        let previous_version = {
            let mut memory = self.inner.memory.lock();
            let key = element.key().clone();

            let previous_version = if mode == PutMode::PreservingStatistics {
                let previous = match memory.get_quiet(&key) {
                    Some(stored) => Some(stored.clone()),
                    None => self.take_from_disk(&key),
                };
                if let Some(previous) = &previous {
                    element.inherit_statistics(previous);
                }
                previous.map(|p| p.version())
            } else {
                match memory.get_quiet(&key) {
                    Some(stored) => Some(stored.version()),
                    None => self.disk().and_then(|disk| disk.remove(&key)),
                }
            };

            if mode == PutMode::Normal {
                element.reset_access_statistics(now);
            }
            if mode != PutMode::Quiet {
                if let Some(version) = previous_version {
                    element.record_update(now, version);
                }
            }

            if notify {
                notifications.push(match previous_version {
                    Some(_) => Notification::Update(element.clone()),
                    None => Notification::Put(element.clone()),
                });
            }

            let outcome = memory.put(element);
            self.handle_evicted(outcome.evicted, now, &mut notifications);
            previous_version
        };

        if mode != PutMode::Quiet {
            match previous_version {
                Some(_) => self.inner.statistics.record_update(),
                None => self.inner.statistics.record_put(),
            }
        }

        self.dispatch(notifications);
        Ok(())
    }

    /// Route memory victims: expired ones are dropped, live ones overflow
    /// to disk when enabled and are discarded otherwise
    fn handle_evicted(
        &self,
        evicted: Vec<Element>,
        now: u64,
        notifications: &mut Vec<Notification>,
    ) {
        for element in evicted {
            if self.inner.expiry.is_expired(&element, now) {
                self.inner.statistics.record_expirations(1);
                notifications.push(Notification::Expire(element));
                continue;
            }

            self.inner.statistics.record_eviction();
            match self.overflow_disk() {
                Some(disk) if element.is_serializable() => {
                    disk.put(element);
                }
                Some(_) => {
                    self.inner.statistics.record_overflow_discard();
                    debug!(cache = %self.name(), key = %element.key(), "Discarding non-serializable element on eviction");
                    notifications.push(Notification::Evict(element));
                }
                None => notifications.push(Notification::Evict(element)),
            }
        }
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Look up an element, falling back to the loader on a miss
    pub fn get(&self, key: impl Into<ElementKey>) -> Result<Option<Element>> {
        let key = key.into();
        let tracker = LatencyTracker::start();
        let found = self.lookup(&key, false)?;
        self.inner.statistics.record_get_time(tracker.elapsed());

        match found {
            Some(element) => Ok(Some(element)),
            None => self.load_through(&key),
        }
    }

    /// Look up an element without touching statistics, access metadata
    /// or the loader. Expired elements are still removed.
    pub fn get_quiet(&self, key: impl Into<ElementKey>) -> Result<Option<Element>> {
        self.lookup(&key.into(), true)
    }

    /// Look up several keys, loading the misses in one loader call
    pub fn get_all(&self, keys: &[ElementKey]) -> Result<HashMap<ElementKey, Element>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match self.lookup(key, false)? {
                Some(element) => {
                    found.insert(key.clone(), element);
                }
                None => missing.push(key.clone()),
            }
        }

        let loader = self.inner.loader.read().clone();
        if let (Some(loader), false) = (loader, missing.is_empty()) {
            let loaded = loader.load_all(&missing).map_err(|e| Error::Loader {
                cache: self.name(),
                key: format!("{} keys", missing.len()),
                source: e,
            })?;
            for (key, value) in loaded {
                let element = Element::new_at(key.clone(), value, self.now());
                self.put(element.clone())?;
                found.insert(key, element);
            }
        }

        Ok(found)
    }

    /// Pre-load `key` through the loader unless it is already cached
    pub fn load(&self, key: impl Into<ElementKey>) -> Result<()> {
        let key = key.into();
        self.check_alive()?;
        if self.is_key_in_cache(&key) {
            return Ok(());
        }
        self.load_through(&key).map(|_| ())
    }

    fn load_through(&self, key: &ElementKey) -> Result<Option<Element>> {
        let Some(loader) = self.inner.loader.read().clone() else {
            return Ok(None);
        };

        let value = loader.load(key).map_err(|e| Error::Loader {
            cache: self.name(),
            key: key.to_string(),
            source: e,
        })?;

        match value {
            Some(value) => {
                let element = Element::new_at(key.clone(), value, self.now());
                self.put(element.clone())?;
                debug!(cache = %self.name(), key = %key, "Loaded element on miss");
                Ok(Some(element))
            }
            None => Ok(None),
        }
    }

    fn lookup(&self, key: &ElementKey, quiet: bool) -> Result<Option<Element>> {
        self.check_alive()?;
        let now = self.now();
        let mut notifications = Vec::new();

        let lookup = {
            let mut memory = self.inner.memory.lock();
            match self.search_memory(&mut memory, key, now, quiet, &mut notifications) {
                Lookup::Missing => {
                    self.search_disk(&mut memory, key, now, quiet, &mut notifications)
                }
                other => other,
            }
        };

        let found = match lookup {
            Lookup::Hit(element) => Some(element),
            Lookup::Expired => {
                if !quiet {
                    self.inner.statistics.record_miss_expired();
                }
                None
            }
            Lookup::Missing => {
                if !quiet {
                    self.inner.statistics.record_miss_not_found();
                }
                None
            }
        };

        self.dispatch(notifications);
        Ok(found)
    }

    fn search_memory(
        &self,
        memory: &mut MemoryTier,
        key: &ElementKey,
        now: u64,
        quiet: bool,
        notifications: &mut Vec<Notification>,
    ) -> Lookup {
        let expired = match memory.get_quiet(key) {
            Some(element) => self.inner.expiry.is_expired(element, now),
            None => return Lookup::Missing,
        };

        if expired {
            if let Some(element) = memory.remove(key) {
                self.inner.statistics.record_expirations(1);
                notifications.push(Notification::Expire(element));
            }
            return Lookup::Expired;
        }

        let element = if quiet {
            memory.get_quiet(key).cloned()
        } else {
            memory.get(key, now).cloned()
        };

        match element {
            Some(element) => {
                if !quiet {
                    self.inner.statistics.record_memory_hit();
                }
                Lookup::Hit(element)
            }
            None => Lookup::Missing,
        }
    }

    fn search_disk(
        &self,
        memory: &mut MemoryTier,
        key: &ElementKey,
        now: u64,
        quiet: bool,
        notifications: &mut Vec<Notification>,
    ) -> Lookup {
        let Some(mut element) = self.take_from_disk(key) else {
            return Lookup::Missing;
        };

        if self.inner.expiry.is_expired(&element, now) {
            self.inner.statistics.record_expirations(1);
            notifications.push(Notification::Expire(element));
            return Lookup::Expired;
        }

        if !quiet {
            element.record_access(now);
            self.inner.statistics.record_disk_hit();
        }

        let outcome = memory.put(element.clone());
        self.handle_evicted(outcome.evicted, now, notifications);
        Lookup::Hit(element)
    }

    /// Move an element out of the disk tier; read failures count as misses
    fn take_from_disk(&self, key: &ElementKey) -> Option<Element> {
        let disk = self.disk()?;
        match disk.get(key) {
            Ok(found) => found,
            Err(e) => {
                warn!(cache = %self.name(), key = %key, error = %e, "Failed to read element from disk, treating as miss");
                None
            }
        }
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove an element, notifying listeners. `true` if it was present.
    pub fn remove(&self, key: impl Into<ElementKey>) -> Result<bool> {
        self.remove_internal(&key.into(), false)
    }

    /// Remove an element without notification
    pub fn remove_quiet(&self, key: impl Into<ElementKey>) -> Result<bool> {
        self.remove_internal(&key.into(), true)
    }

    fn remove_internal(&self, key: &ElementKey, quiet: bool) -> Result<bool> {
        self.check_alive()?;
        let notify = !quiet && !self.inner.listeners.is_empty();

        let (existed, removed) = {
            let mut memory = self.inner.memory.lock();
            match memory.remove(key) {
                Some(element) => (true, Some(element)),
                None => match self.disk() {
                    // Only read the record back when someone will see it
                    Some(_) if notify => {
                        let element = self.take_from_disk(key);
                        let unreadable = self.disk().and_then(|d| d.remove(key)).is_some();
                        (element.is_some() || unreadable, element)
                    }
                    Some(disk) => (disk.remove(key).is_some(), None),
                    None => (false, None),
                },
            }
        };

        if existed && !quiet {
            self.inner.statistics.record_removal();
            if let (true, Some(element)) = (notify, removed) {
                self.dispatch(vec![Notification::Remove(element)]);
            }
        }
        Ok(existed)
    }

    /// Remove every element from both tiers
    pub fn remove_all(&self) -> Result<()> {
        self.check_alive()?;
        {
            let mut memory = self.inner.memory.lock();
            memory.remove_all();
            if let Some(disk) = self.disk() {
                disk.remove_all()?;
            }
        }
        self.dispatch(vec![Notification::RemoveAll]);
        Ok(())
    }

    // =========================================================================
    // Keys and Sizes
    // =========================================================================

    /// Keys of both tiers without duplicates. Expired elements are included.
    pub fn keys(&self) -> Result<Vec<ElementKey>> {
        self.check_alive()?;
        let memory = self.inner.memory.lock();
        let mut keys: HashSet<ElementKey> = memory.keys().into_iter().collect();
        if let Some(disk) = self.disk() {
            keys.extend(disk.keys());
        }
        Ok(keys.into_iter().collect())
    }

    /// Keys of both tiers, excluding expired elements. Does not promote or
    /// touch statistics.
    pub fn keys_with_expiry_check(&self) -> Result<Vec<ElementKey>> {
        self.check_alive()?;
        let now = self.now();
        let memory = self.inner.memory.lock();

        let mut keys: HashSet<ElementKey> = memory
            .values()
            .filter(|element| !self.inner.expiry.is_expired(element, now))
            .map(|element| element.key().clone())
            .collect();
        if let Some(disk) = self.disk() {
            keys.extend(
                disk.keys()
                    .into_iter()
                    .filter(|key| disk.is_expired(key, now) == Some(false)),
            );
        }
        Ok(keys.into_iter().collect())
    }

    /// Memory keys followed by disk keys, without deduplication
    pub fn keys_no_duplicate_check(&self) -> Result<Vec<ElementKey>> {
        self.check_alive()?;
        let memory = self.inner.memory.lock();
        let mut keys = memory.keys();
        if let Some(disk) = self.disk() {
            keys.extend(disk.keys());
        }
        Ok(keys)
    }

    /// Elements held in both tiers
    pub fn size(&self) -> Result<usize> {
        self.check_alive()?;
        let memory = self.inner.memory.lock();
        Ok(memory.len() + self.disk().map_or(0, DiskTier::size))
    }

    pub fn memory_store_size(&self) -> Result<usize> {
        self.check_alive()?;
        Ok(self.inner.memory.lock().len())
    }

    pub fn disk_store_size(&self) -> Result<usize> {
        self.check_alive()?;
        Ok(self.disk().map_or(0, DiskTier::size))
    }

    /// Estimated bytes held by the memory tier, walking every element
    pub fn calculate_in_memory_size(&self) -> Result<u64> {
        self.check_alive()?;
        Ok(self.inner.memory.lock().calculate_size())
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.memory.lock().stats()
    }

    pub fn disk_stats(&self) -> Option<DiskStats> {
        self.disk().map(DiskTier::stats)
    }

    // =========================================================================
    // Flush and Expiry
    // =========================================================================

    /// Move every memory element to the disk tier (if there is one) and
    /// write it out; the memory tier is empty afterwards
    pub fn flush(&self) -> Result<()> {
        self.check_alive()?;
        let now = self.now();
        let mut notifications = Vec::new();

        {
            let mut memory = self.inner.memory.lock();
            let elements = memory.drain();

            match self.disk() {
                Some(disk) => {
                    for element in elements {
                        if self.inner.expiry.is_expired(&element, now) {
                            self.inner.statistics.record_expirations(1);
                            notifications.push(Notification::Expire(element));
                            continue;
                        }
                        if let Err(e) = disk.write(&element) {
                            self.inner.statistics.record_disk_write_failure();
                            error!(cache = %self.name(), key = %element.key(), error = %e, "Failed to flush element to disk");
                        }
                    }
                    disk.flush()?;
                }
                None => {
                    debug!(cache = %self.name(), discarded = elements.len(), "Flushed memory tier without a disk tier");
                }
            }
        }

        self.dispatch(notifications);
        Ok(())
    }

    /// Remove every expired element from both tiers, returning how many
    pub fn evict_expired_elements(&self) -> Result<usize> {
        self.check_alive()?;
        let now = self.now();

        let expired = {
            let mut memory = self.inner.memory.lock();
            let mut expired = memory.remove_expired(&self.inner.expiry, now);
            if let Some(disk) = self.disk() {
                expired.extend(disk.expire_elements(now));
            }
            expired
        };

        let count = expired.len();
        if count > 0 {
            self.inner.statistics.record_expirations(count as u64);
            debug!(cache = %self.name(), count, "Evicted expired elements");
        }
        self.dispatch(expired.into_iter().map(Notification::Expire).collect());
        Ok(count)
    }

    /// Whether `element` is expired under this cache's policy
    pub fn is_expired(&self, element: &Element) -> Result<bool> {
        self.check_alive()?;
        Ok(self.inner.expiry.is_expired(element, self.now()))
    }

    // =========================================================================
    // Membership Probes
    // =========================================================================

    pub fn is_element_in_memory(&self, key: &ElementKey) -> bool {
        self.inner.memory.lock().contains_key(key)
    }

    pub fn is_element_on_disk(&self, key: &ElementKey) -> bool {
        self.disk().is_some_and(|disk| disk.contains_key(key))
    }

    /// Whether either tier holds `key`, expired or not
    pub fn is_key_in_cache(&self, key: &ElementKey) -> bool {
        let memory = self.inner.memory.lock();
        memory.contains_key(key) || self.disk().is_some_and(|disk| disk.contains_key(key))
    }

    /// Whether any element holds `value`. Reads every disk record.
    pub fn is_value_in_cache(&self, value: &ElementValue) -> Result<bool> {
        self.check_alive()?;
        let memory = self.inner.memory.lock();
        if memory.values().any(|element| element.value() == value) {
            return Ok(true);
        }

        if let Some(disk) = self.disk() {
            for key in disk.keys() {
                if let Ok(Some(element)) = disk.get_quiet(&key) {
                    if element.value() == value {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn statistics(&self) -> StatisticsSnapshot {
        let (memory, disk) = {
            let memory = self.inner.memory.lock();
            (memory.len(), self.disk().map_or(0, DiskTier::size))
        };
        self.inner.statistics.snapshot(TierSizes {
            cache_name: self.name(),
            memory,
            disk,
        })
    }

    /// Reset hit, miss and event counters
    pub fn clear_statistics(&self) {
        self.inner.statistics.clear();
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    fn disk(&self) -> Option<&DiskTier> {
        self.inner.disk.get()
    }

    fn overflow_disk(&self) -> Option<&DiskTier> {
        if self.inner.config.overflow_to_disk {
            self.disk()
        } else {
            None
        }
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        self.inner.listeners.dispatch(self, notifications);
    }

    fn check_alive(&self) -> Result<()> {
        if *self.inner.status.read() != Status::Alive {
            return Err(Error::NotAlive { cache: self.name() });
        }
        Ok(())
    }

    fn require_uninitialised(&self, operation: &str) -> Result<()> {
        let status = *self.inner.status.read();
        if status != Status::Uninitialised {
            return Err(self.invalid_state(status, operation));
        }
        Ok(())
    }

    fn invalid_state(&self, status: Status, operation: &str) -> Error {
        Error::InvalidState {
            cache: self.name(),
            status: status.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Whether both handles refer to the same cache
    pub fn ptr_eq(&self, other: &Cache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name())
            .field("guid", &self.inner.guid)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::events::{CacheEvent, EventCollector};
    use crate::cache::expiry::ManualClock;
    use crate::cache::policy::EvictionPolicy;
    use crate::error::LoaderError;
    use assert_matches::assert_matches;

    const T0: u64 = 1_700_000_000_000;

    fn alive(config: CacheConfiguration) -> (Cache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Cache::with_clock(config, clock.clone()).unwrap();
        cache.initialise().unwrap();
        (cache, clock)
    }

    fn key(s: &str) -> ElementKey {
        ElementKey::from(s)
    }

    #[test]
    fn test_lifecycle() {
        let cache = Cache::new(CacheConfiguration::new("life", 10)).unwrap();
        assert_eq!(cache.status(), Status::Uninitialised);
        assert_matches!(cache.get("a"), Err(Error::NotAlive { .. }));

        cache.initialise().unwrap();
        assert_eq!(cache.status(), Status::Alive);
        assert_matches!(cache.initialise(), Err(Error::InvalidState { .. }));

        cache.dispose().unwrap();
        cache.dispose().unwrap();
        assert_eq!(cache.status(), Status::Shutdown);
        assert_matches!(cache.put(Element::new("a", "b")), Err(Error::NotAlive { .. }));
    }

    #[test]
    fn test_rename_only_before_initialise() {
        let cache = Cache::new(CacheConfiguration::new("before", 10)).unwrap();
        cache.set_name("after").unwrap();
        assert_eq!(cache.name(), "after");
        assert_matches!(cache.set_name("a/b"), Err(Error::InvalidName(_)));

        cache.initialise().unwrap();
        assert_matches!(cache.set_name("later"), Err(Error::InvalidState { .. }));
    }

    #[test]
    fn test_put_get_and_statistics() {
        let (cache, clock) = alive(CacheConfiguration::new("stats", 10));

        cache.put(Element::new("a", "alpha")).unwrap();
        clock.advance_millis(10);

        let element = cache.get("a").unwrap().unwrap();
        assert_eq!(element.value().as_text(), Some("alpha"));
        assert_eq!(element.hit_count(), 1);
        assert_eq!(element.creation_time(), T0);
        assert_eq!(element.last_access_time(), T0 + 10);

        assert!(cache.get("missing").unwrap().is_none());

        let stats = cache.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses_not_found, 1);
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_put_none_is_noop() {
        let (cache, _) = alive(CacheConfiguration::new("none", 10));
        cache.put(None).unwrap();
        assert_eq!(cache.size().unwrap(), 0);
    }

    #[test]
    fn test_get_quiet_leaves_statistics() {
        let (cache, _) = alive(CacheConfiguration::new("quiet", 10));
        cache.put(Element::new("a", 1i64)).unwrap();

        let element = cache.get_quiet("a").unwrap().unwrap();
        assert_eq!(element.hit_count(), 0);
        assert!(cache.get_quiet("missing").unwrap().is_none());

        let stats = cache.statistics();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_replacing_put_bumps_version_and_resets_lifetime() {
        let (cache, clock) = alive(CacheConfiguration::new("versions", 10));
        cache.put(Element::new("a", "one")).unwrap();
        cache.get("a").unwrap();

        clock.advance_secs(5);
        cache.put(Element::new("a", "two")).unwrap();

        let element = cache.get_quiet("a").unwrap().unwrap();
        assert_eq!(element.version(), 2);
        assert_eq!(element.creation_time(), T0 + 5_000);
        assert_eq!(element.last_update_time(), T0 + 5_000);
        assert_eq!(element.hit_count(), 0);
        assert_eq!(cache.statistics().updates, 1);
    }

    #[test]
    fn test_put_preserving_statistics() {
        let (cache, clock) = alive(CacheConfiguration::new("preserve", 10));
        cache.put(Element::new("a", "one")).unwrap();
        cache.get("a").unwrap();
        cache.get("a").unwrap();

        clock.advance_secs(5);
        cache
            .put_preserving_statistics(Element::new("a", "two"))
            .unwrap();

        let element = cache.get_quiet("a").unwrap().unwrap();
        assert_eq!(element.value().as_text(), Some("two"));
        assert_eq!(element.creation_time(), T0);
        assert_eq!(element.hit_count(), 2);
        assert_eq!(element.version(), 2);
    }

    #[test]
    fn test_put_quiet_stores_as_given() {
        let (cache, _) = alive(CacheConfiguration::new("putquiet", 10));
        let collector = Arc::new(EventCollector::new());
        cache.register_listener(collector.clone());

        cache
            .put_quiet(Element::new_at("a", "v", 42).with_version(9))
            .unwrap();

        let element = cache.get_quiet("a").unwrap().unwrap();
        assert_eq!(element.creation_time(), 42);
        assert_eq!(element.version(), 9);
        assert!(collector.is_empty());
        assert_eq!(cache.statistics().puts, 0);
    }

    #[test]
    fn test_time_to_live_expiry_on_get() {
        let config = CacheConfiguration::new("ttl", 10).with_time_to_live(1);
        let (cache, clock) = alive(config);
        let collector = Arc::new(EventCollector::new());
        cache.register_listener(collector.clone());

        cache.put(Element::new("a", "v")).unwrap();
        clock.advance_millis(1_000);
        assert!(cache.get("a").unwrap().is_some());

        clock.advance_millis(1);
        assert!(cache.get("a").unwrap().is_none());
        assert_eq!(cache.size().unwrap(), 0);

        let stats = cache.statistics();
        assert_eq!(stats.misses_expired, 1);
        assert_eq!(stats.misses_not_found, 0);
        assert_eq!(
            collector.events_of_type("expire"),
            vec![CacheEvent::Expire(key("a"))]
        );
    }

    #[test]
    fn test_time_to_idle_refreshed_by_get_only() {
        let config = CacheConfiguration::new("tti", 10).with_time_to_idle(2);
        let (cache, clock) = alive(config);

        cache.put(Element::new("a", "v")).unwrap();
        for _ in 0..3 {
            clock.advance_millis(1_500);
            assert!(cache.get("a").unwrap().is_some());
        }

        clock.advance_millis(1_500);
        assert!(cache.get_quiet("a").unwrap().is_some());
        clock.advance_millis(1_000);
        // quiet read did not refresh the idle window
        assert!(cache.get_quiet("a").unwrap().is_none());
    }

    #[test]
    fn test_eviction_without_overflow_discards() {
        let config = CacheConfiguration::new("discard", 2).with_eviction_policy(EvictionPolicy::Fifo);
        let (cache, _) = alive(config);
        let collector = Arc::new(EventCollector::new());
        cache.register_listener(collector.clone());

        for k in ["a", "b", "c"] {
            cache.put(Element::new(k, k)).unwrap();
        }

        assert_eq!(cache.size().unwrap(), 2);
        assert!(!cache.is_key_in_cache(&key("a")));
        assert_eq!(
            collector.events_of_type("evict"),
            vec![CacheEvent::Evict(key("a"))]
        );
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn test_lfu_put_is_visible_when_residents_are_hot() {
        let config = CacheConfiguration::new("lfu", 2).with_eviction_policy(EvictionPolicy::Lfu);
        let (cache, _) = alive(config);

        cache.put(Element::new("a", "a")).unwrap();
        cache.put(Element::new("b", "b")).unwrap();
        cache.get("a").unwrap();
        cache.get("b").unwrap();
        cache.get("b").unwrap();

        cache.put(Element::new("c", "c")).unwrap();
        let found = cache.get("c").unwrap().unwrap();
        assert_eq!(found.value().as_text(), Some("c"));

        let mut keys = cache.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec![key("b"), key("c")]);
    }

    #[test]
    fn test_remove_and_remove_all() {
        let (cache, _) = alive(CacheConfiguration::new("remove", 10));
        let collector = Arc::new(EventCollector::new());
        cache.register_listener(collector.clone());

        cache.put(Element::new("a", "v")).unwrap();
        cache.put(Element::new("b", "v")).unwrap();
        cache.put(Element::new("c", "v")).unwrap();

        assert!(cache.remove("a").unwrap());
        assert!(!cache.remove("a").unwrap());
        assert!(cache.remove_quiet("b").unwrap());
        cache.remove_all().unwrap();

        assert_eq!(cache.size().unwrap(), 0);
        assert_eq!(
            collector.events(),
            vec![
                CacheEvent::Put(key("a")),
                CacheEvent::Put(key("b")),
                CacheEvent::Put(key("c")),
                CacheEvent::Remove(key("a")),
                CacheEvent::RemoveAll,
            ]
        );
    }

    #[test]
    fn test_loader_fills_misses() {
        use crate::cache::loader::FnLoader;

        let (cache, _) = alive(CacheConfiguration::new("loader", 10));
        cache.set_loader(Some(Arc::new(FnLoader::new(
            |key: &ElementKey| -> std::result::Result<Option<ElementValue>, LoaderError> {
                Ok(key
                    .as_str()
                    .filter(|k| k.starts_with("db-"))
                    .map(|k| ElementValue::from(k.to_uppercase())))
            },
        ))));

        let loaded = cache.get("db-1").unwrap().unwrap();
        assert_eq!(loaded.value().as_text(), Some("DB-1"));
        assert!(cache.is_element_in_memory(&key("db-1")));
        assert!(cache.get("other").unwrap().is_none());

        // quiet reads never load
        assert!(cache.get_quiet("db-2").unwrap().is_none());

        let all = cache.get_all(&[key("db-1"), key("db-3"), key("nope")]).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key(&key("db-3")));
    }

    #[test]
    fn test_loader_error_propagates() {
        use crate::cache::loader::FnLoader;

        let (cache, _) = alive(CacheConfiguration::new("broken", 10));
        cache.set_loader(Some(Arc::new(FnLoader::new(
            |_: &ElementKey| -> std::result::Result<Option<ElementValue>, LoaderError> {
                Err("backend down".into())
            },
        ))));

        assert_matches!(cache.get("a"), Err(Error::Loader { .. }));
    }

    #[test]
    fn test_flush_without_disk_empties_memory() {
        let (cache, _) = alive(CacheConfiguration::new("flush", 10));
        cache.put(Element::new("a", "v")).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.memory_store_size().unwrap(), 0);
    }

    #[test]
    fn test_evict_expired_elements() {
        let config = CacheConfiguration::new("sweep", 10).with_time_to_live(10);
        let (cache, clock) = alive(config);

        cache.put(Element::new("old", "v")).unwrap();
        clock.advance_secs(6);
        cache.put(Element::new("new", "v")).unwrap();
        clock.advance_secs(5);

        assert_eq!(cache.keys().unwrap().len(), 2);
        assert_eq!(cache.keys_with_expiry_check().unwrap(), vec![key("new")]);

        assert_eq!(cache.evict_expired_elements().unwrap(), 1);
        assert_eq!(cache.keys().unwrap(), vec![key("new")]);
        assert_eq!(cache.statistics().expirations, 1);
    }

    #[test]
    fn test_in_memory_size() {
        let (cache, _) = alive(CacheConfiguration::new("size", 10));
        assert_eq!(cache.calculate_in_memory_size().unwrap(), 0);

        cache.put(Element::new("a", vec![0u8; 4096])).unwrap();
        assert!(cache.calculate_in_memory_size().unwrap() >= 4096);
        assert!(cache.is_value_in_cache(&ElementValue::from(vec![0u8; 4096])).unwrap());
        assert!(!cache.is_value_in_cache(&ElementValue::from("x")).unwrap());
    }
}
