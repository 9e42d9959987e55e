//! Disk Tier
//!
//! Overflow store for elements evicted from memory, optionally persistent
//! across restarts.
//!
//! # Design
//!
//! - Evicted elements are queued on the [`spool`] and written by a
//!   dedicated mover thread, so evicting callers never wait on file I/O
//!   (beyond the spool's own bounded enqueue)
//! - Queued elements are served from the spool until written; the mover
//!   pops and writes under the store lock so an element is always in
//!   exactly one of the two places
//! - Lock order is store, then spool
//! - Every slot records its element's absolute expiry instant, so
//!   expired records are found without reading the data file

mod codec;
mod spool;
mod store;

pub use spool::{DropReason, SpoolPolicy};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use self::codec::RecordCodec;
use self::spool::Spool;
use self::store::DataStore;
use super::compression::CompressionAlgorithm;
use super::element::{Element, ElementKey};
use super::expiry::ExpiryPolicy;
use super::statistics::CacheStatistics;
use crate::error::{Error, Result};

/// How long the mover sleeps when the spool is idle
const MOVER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Disk tier configuration
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Directory holding the data and index files
    pub directory: PathBuf,
    /// File name stem, normally the cache name
    pub name: String,
    /// Keep the data across restarts
    pub persistent: bool,
    /// Memory budget of the spool, in estimated element bytes
    pub spool_budget_bytes: u64,
    pub spool_policy: SpoolPolicy,
    pub compression: CompressionAlgorithm,
    /// Expiry defaults used to stamp slot expiry instants
    pub expiry: ExpiryPolicy,
}

/// Disk tier statistics
#[derive(Debug, Clone, Default)]
pub struct DiskStats {
    /// Written elements
    pub entries: usize,
    /// Elements queued but not yet written
    pub spool_entries: usize,
    pub spool_bytes: u64,
    pub data_file_bytes: u64,
    pub used_bytes: u64,
    pub free_blocks: usize,
}

impl DiskStats {
    /// Share of the data file not holding live records
    pub fn sparseness(&self) -> f64 {
        if self.data_file_bytes == 0 {
            0.0
        } else {
            1.0 - self.used_bytes as f64 / self.data_file_bytes as f64
        }
    }
}

/// State shared with the mover thread
struct Shared {
    name: String,
    store: Mutex<DataStore>,
    spool: Spool,
    codec: RecordCodec,
    expiry: ExpiryPolicy,
    statistics: Arc<CacheStatistics>,
}

impl Shared {
    fn write_element(&self, store: &mut DataStore, element: &Element) -> Result<()> {
        let (payload, compression) = self.codec.encode(element)?;
        store.write(
            element.key(),
            &payload,
            self.expiry.expiration_time(element),
            element.version(),
            compression,
        )
    }

    fn read_element(&self, store: &mut DataStore, key: &ElementKey) -> Result<Option<Element>> {
        let Some(slot) = store.slot(key).copied() else {
            return Ok(None);
        };
        let payload = store.read(&slot)?;
        let element = self.codec.decode(payload, slot.compression)?;
        if element.key() != key {
            return Err(Error::Corrupt {
                cache: self.name.clone(),
                reason: format!("record for {} holds key {}", key, element.key()),
            });
        }
        Ok(Some(element))
    }

    /// Write the oldest queued element; `false` if there was none
    fn move_one(&self) -> bool {
        let mut store = self.store.lock();
        let Some(element) = self.spool.pop() else {
            return false;
        };

        match self.write_element(&mut store, &element) {
            Ok(()) => self.statistics.record_overflow_write(),
            Err(e) => {
                self.statistics.record_disk_write_failure();
                // Never leave an older copy readable in place of the lost write
                store.remove(element.key());
                error!(cache = %self.name, key = %element.key(), error = %e, "Failed to write element to disk, dropping it");
            }
        }
        true
    }
}

fn run_mover(shared: Arc<Shared>) {
    debug!(cache = %shared.name, "Disk mover started");
    while shared.spool.wait_for_work(MOVER_POLL_INTERVAL) {
        while shared.move_one() {}
    }
    debug!(cache = %shared.name, "Disk mover stopped");
}

/// Disk tier
pub struct DiskTier {
    shared: Arc<Shared>,
    persistent: bool,
    mover: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl DiskTier {
    /// Open the data files and start the mover thread
    pub fn open(config: DiskConfig, statistics: Arc<CacheStatistics>) -> Result<Self> {
        let store = DataStore::open(&config.directory, &config.name, config.persistent)?;

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            store: Mutex::new(store),
            spool: Spool::new(config.spool_budget_bytes, config.spool_policy),
            codec: RecordCodec::new(config.compression),
            expiry: config.expiry,
            statistics,
        });

        let mover = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{}-disk-mover", config.name))
                .spawn(move || run_mover(shared))?
        };

        info!(
            cache = %config.name,
            directory = %config.directory.display(),
            persistent = config.persistent,
            "Disk tier opened"
        );

        Ok(Self {
            shared,
            persistent: config.persistent,
            mover: Mutex::new(Some(mover)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Queue an evicted element for writing.
    ///
    /// Returns `false` when the element was discarded instead.
    pub fn put(&self, element: Element) -> bool {
        let key = element.key().clone();
        match self.shared.spool.enqueue(element) {
            Ok(()) => true,
            Err(reason) => {
                self.shared.statistics.record_overflow_discard();
                debug!(cache = %self.shared.name, key = %key, reason = %reason, "Element not spooled to disk");
                false
            }
        }
    }

    /// Remove an element from the tier and return it, for promotion to memory
    pub fn get(&self, key: &ElementKey) -> Result<Option<Element>> {
        let mut store = self.shared.store.lock();
        if let Some(element) = self.shared.spool.take(key) {
            // A queued element supersedes any older written copy
            store.remove(key);
            return Ok(Some(element));
        }

        let found = self.shared.read_element(&mut store, key);
        store.remove(key);
        found
    }

    /// Read an element without removing it
    pub fn get_quiet(&self, key: &ElementKey) -> Result<Option<Element>> {
        let mut store = self.shared.store.lock();
        if let Some(element) = self.shared.spool.peek(key) {
            return Ok(Some(element));
        }
        self.shared.read_element(&mut store, key)
    }

    /// Drop an element without reading it, returning its version
    pub fn remove(&self, key: &ElementKey) -> Option<u64> {
        let mut store = self.shared.store.lock();
        let written = store.remove(key).map(|slot| slot.version);
        match self.shared.spool.take(key) {
            Some(element) => Some(element.version()),
            None => written,
        }
    }

    /// Drop every element and truncate the data file
    pub fn remove_all(&self) -> Result<()> {
        let mut store = self.shared.store.lock();
        self.shared.spool.clear();
        store.clear()
    }

    pub fn contains_key(&self, key: &ElementKey) -> bool {
        let store = self.shared.store.lock();
        self.shared.spool.contains_key(key) || store.contains_key(key)
    }

    /// Whether the element under `key` is expired at `now`, `None` if absent
    pub fn is_expired(&self, key: &ElementKey, now: u64) -> Option<bool> {
        let store = self.shared.store.lock();
        if let Some(element) = self.shared.spool.peek(key) {
            return Some(self.shared.expiry.is_expired(&element, now));
        }
        store
            .slot(key)
            .map(|slot| slot.expires_at.is_some_and(|at| now > at))
    }

    pub fn keys(&self) -> Vec<ElementKey> {
        let store = self.shared.store.lock();
        let mut keys: HashSet<ElementKey> = store.keys().cloned().collect();
        keys.extend(self.shared.spool.keys());
        keys.into_iter().collect()
    }

    /// Number of distinct elements, queued or written
    pub fn size(&self) -> usize {
        let store = self.shared.store.lock();
        let queued_only = self
            .shared
            .spool
            .keys()
            .iter()
            .filter(|key| !store.contains_key(key))
            .count();
        store.len() + queued_only
    }

    /// Write an element synchronously, bypassing the spool.
    ///
    /// Returns `false` when the element cannot be serialized.
    pub fn write(&self, element: &Element) -> Result<bool> {
        if !element.is_serializable() {
            self.shared.statistics.record_overflow_discard();
            return Ok(false);
        }

        let mut store = self.shared.store.lock();
        self.shared.spool.take(element.key());
        self.shared.write_element(&mut store, element)?;
        self.shared.statistics.record_overflow_write();
        Ok(true)
    }

    /// Write every queued element now, and the index if persistent
    pub fn flush(&self) -> Result<()> {
        while self.shared.move_one() {}
        if self.persistent {
            self.shared.store.lock().persist_index()?;
        }
        Ok(())
    }

    /// Remove and return every element expired at `now`
    pub fn expire_elements(&self, now: u64) -> Vec<Element> {
        let mut store = self.shared.store.lock();
        let mut expired = self.shared.spool.remove_expired(&self.shared.expiry, now);

        for key in store.expired_keys(now) {
            match self.shared.read_element(&mut store, &key) {
                Ok(Some(element)) => expired.push(element),
                Ok(None) => {}
                Err(e) => {
                    warn!(cache = %self.shared.name, key = %key, error = %e, "Dropping unreadable expired element");
                }
            }
            store.remove(&key);
        }
        expired
    }

    pub fn stats(&self) -> DiskStats {
        let store = self.shared.store.lock();
        DiskStats {
            entries: store.len(),
            spool_entries: self.shared.spool.len(),
            spool_bytes: self.shared.spool.bytes(),
            data_file_bytes: store.file_len(),
            used_bytes: store.used_bytes(),
            free_blocks: store.free_block_count(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Stop the mover and release the files.
    ///
    /// A persistent tier drains its spool and writes the index; a
    /// transient tier discards its spool and deletes its files.
    /// Calling this more than once is a no-op.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.persistent {
            let discarded = self.shared.spool.clear();
            if discarded > 0 {
                debug!(cache = %self.shared.name, discarded, "Discarded spool on shutdown");
            }
        }
        self.shared.spool.close();

        if let Some(handle) = self.mover.lock().take() {
            if handle.join().is_err() {
                error!(cache = %self.shared.name, "Disk mover thread panicked");
            }
        }

        // Anything the mover could not reach before it stopped
        while self.shared.move_one() {}

        let mut store = self.shared.store.lock();
        if self.persistent {
            store.persist_index()?;
        } else {
            store.delete_files()?;
        }

        info!(cache = %self.shared.name, persistent = self.persistent, "Disk tier disposed");
        Ok(())
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            error!(cache = %self.shared.name, error = %e, "Failed to dispose disk tier");
        }
    }
}

impl std::fmt::Debug for DiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTier")
            .field("name", &self.shared.name)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::element::OpaqueValue;
    use std::path::Path;

    fn config(dir: &Path, persistent: bool) -> DiskConfig {
        DiskConfig {
            directory: dir.to_path_buf(),
            name: "disk".into(),
            persistent,
            spool_budget_bytes: 1 << 20,
            spool_policy: SpoolPolicy::Block,
            compression: CompressionAlgorithm::Lz4,
            expiry: ExpiryPolicy::new(false, 10, 0),
        }
    }

    fn open(dir: &Path, persistent: bool) -> DiskTier {
        DiskTier::open(config(dir, persistent), Arc::new(CacheStatistics::new())).unwrap()
    }

    fn key(s: &str) -> ElementKey {
        ElementKey::from(s)
    }

    #[test]
    fn test_put_then_get_moves_out() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open(dir.path(), false);

        assert!(disk.put(Element::new_at("a", "alpha", 1_000)));
        assert_eq!(disk.size(), 1);

        let element = disk.get(&key("a")).unwrap().unwrap();
        assert_eq!(element.value().as_text(), Some("alpha"));
        assert_eq!(element.creation_time(), 1_000);
        assert_eq!(disk.size(), 0);
        assert!(disk.get(&key("a")).unwrap().is_none());
    }

    #[test]
    fn test_flush_writes_spool() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open(dir.path(), false);

        for i in 0..20i64 {
            disk.put(Element::new_at(i, i, 1_000));
        }
        disk.flush().unwrap();

        let stats = disk.stats();
        assert_eq!(stats.entries, 20);
        assert_eq!(stats.spool_entries, 0);
        assert_eq!(disk.size(), 20);

        let quiet = disk.get_quiet(&ElementKey::Int(7)).unwrap().unwrap();
        assert_eq!(quiet.value().as_integer(), Some(7));
        assert!(disk.contains_key(&ElementKey::Int(7)));
    }

    #[test]
    fn test_remove_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open(dir.path(), false);

        disk.put(Element::new_at("a", "v", 1_000).with_version(4));
        disk.flush().unwrap();

        assert_eq!(disk.remove(&key("a")), Some(4));
        assert_eq!(disk.remove(&key("a")), None);
    }

    #[test]
    fn test_non_serializable_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let statistics = Arc::new(CacheStatistics::new());
        let disk = DiskTier::open(config(dir.path(), false), Arc::clone(&statistics)).unwrap();

        assert!(!disk.put(Element::new("a", OpaqueValue::new(1u8))));
        assert_eq!(disk.size(), 0);
        assert_eq!(statistics.overflow_discards(), 1);
    }

    #[test]
    fn test_expire_elements() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open(dir.path(), false);

        disk.put(Element::new_at("written", "v", 1_000));
        disk.flush().unwrap();
        disk.put(Element::new_at("queued", "v", 1_000));
        disk.put(Element::new_at("fresh", "v", 50_000));

        assert_eq!(disk.is_expired(&key("written"), 20_000), Some(true));
        assert_eq!(disk.is_expired(&key("fresh"), 20_000), Some(false));
        assert_eq!(disk.is_expired(&key("missing"), 20_000), None);

        let mut expired: Vec<String> = disk
            .expire_elements(20_000)
            .iter()
            .map(|e| e.key().to_string())
            .collect();
        expired.sort();

        assert_eq!(expired, vec!["queued", "written"]);
        assert_eq!(disk.keys(), vec![key("fresh")]);
    }

    #[test]
    fn test_remove_all() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open(dir.path(), false);

        disk.put(Element::new_at("a", "v", 1_000));
        disk.flush().unwrap();
        disk.put(Element::new_at("b", "v", 1_000));

        disk.remove_all().unwrap();
        assert_eq!(disk.size(), 0);
        assert_eq!(disk.stats().data_file_bytes, 0);
    }

    #[test]
    fn test_persistent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let disk = open(dir.path(), true);
            for i in 0..50i64 {
                disk.put(Element::new_at(i, format!("value-{}", i), 1_000 + i as u64));
            }
            disk.dispose().unwrap();
        }

        let disk = open(dir.path(), true);
        assert_eq!(disk.size(), 50);
        let element = disk.get(&ElementKey::Int(42)).unwrap().unwrap();
        assert_eq!(element.value().as_text(), Some("value-42"));
        assert_eq!(element.creation_time(), 1_042);
    }

    #[test]
    fn test_transient_dispose_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let disk = open(dir.path(), false);
        disk.put(Element::new_at("a", "v", 1_000));
        disk.flush().unwrap();

        disk.dispose().unwrap();
        disk.dispose().unwrap();
        assert!(!dir.path().join("disk.data").exists());
    }

    #[test]
    fn test_sparseness() {
        let stats = DiskStats {
            data_file_bytes: 100,
            used_bytes: 25,
            ..Default::default()
        };
        assert!((stats.sparseness() - 0.75).abs() < f64::EPSILON);
        assert_eq!(DiskStats::default().sparseness(), 0.0);
    }
}
