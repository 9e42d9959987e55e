//! Data file, slot index and free-block list.
//!
//! Records are written first-fit into blocks freed by earlier removals,
//! appending to the file only when no freed block is large enough. Blocks
//! are reused whole, never split.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::compression::CompressionAlgorithm;
use crate::cache::element::ElementKey;
use crate::error::{Error, Result};

/// Bumped whenever the index layout changes
const INDEX_FORMAT_VERSION: u32 = 1;

/// Location and metadata of one record in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DiskSlot {
    pub offset: u64,
    /// Bytes of record payload
    pub len: u64,
    /// Bytes reserved for the slot (>= len when a freed block was reused)
    pub block_size: u64,
    /// Absolute expiry instant in milliseconds, `None` if never
    pub expires_at: Option<u64>,
    pub version: u64,
    pub compression: CompressionAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

/// Index file contents
#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    format_version: u32,
    file_len: u64,
    slots: Vec<(ElementKey, DiskSlot)>,
    free_blocks: Vec<FreeBlock>,
}

pub(crate) struct DataStore {
    cache_name: String,
    data_path: PathBuf,
    index_path: PathBuf,
    file: File,
    slots: HashMap<ElementKey, DiskSlot>,
    free_blocks: Vec<FreeBlock>,
    file_len: u64,
    used_bytes: u64,
    /// An index describing the current layout is on disk and must be
    /// truncated before the next mutation
    index_written: bool,
}

impl DataStore {
    /// Open the store for `cache_name` under `directory`.
    ///
    /// A persistent store reloads the index written at the last clean
    /// shutdown and then truncates the index file, so an unclean shutdown
    /// leaves no index behind and the next start discards the data file.
    /// A transient store always starts empty.
    pub fn open(directory: &Path, cache_name: &str, persistent: bool) -> Result<Self> {
        fs::create_dir_all(directory)?;
        let data_path = directory.join(format!("{}.data", cache_name));
        let index_path = directory.join(format!("{}.index", cache_name));

        let recovered = if persistent {
            let index = read_index(&index_path, &data_path, cache_name);
            // Zero the index: it is only valid until the next mutation
            File::create(&index_path)?;
            index
        } else {
            remove_if_exists(&index_path)?;
            None
        };

        if recovered.is_none() {
            remove_if_exists(&data_path)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;

        let mut store = Self {
            cache_name: cache_name.to_string(),
            data_path,
            index_path,
            file,
            slots: HashMap::new(),
            free_blocks: Vec::new(),
            file_len: 0,
            used_bytes: 0,
            index_written: false,
        };

        if let Some(index) = recovered {
            store.file_len = index.file_len;
            store.used_bytes = index.slots.iter().map(|(_, slot)| slot.len).sum();
            store.slots = index.slots.into_iter().collect();
            store.free_blocks = index.free_blocks;
            info!(
                cache = %store.cache_name,
                elements = store.slots.len(),
                "Recovered persistent disk store"
            );
        }

        Ok(store)
    }

    /// Write `payload` for `key`, replacing any previous record
    pub fn write(
        &mut self,
        key: &ElementKey,
        payload: &[u8],
        expires_at: Option<u64>,
        version: u64,
        compression: CompressionAlgorithm,
    ) -> Result<()> {
        self.invalidate_index()?;
        self.remove(key);

        let len = payload.len() as u64;
        let reused = self.take_free_block(len);
        let (offset, block_size) = match reused {
            Some(block) => (block.offset, block.size),
            None => (self.file_len, len),
        };

        if let Err(e) = self.write_at(offset, payload) {
            if let Some(block) = reused {
                self.free_blocks.push(block);
            }
            return Err(e);
        }
        if reused.is_none() {
            self.file_len += len;
        }

        self.slots.insert(
            key.clone(),
            DiskSlot {
                offset,
                len,
                block_size,
                expires_at,
                version,
                compression,
            },
        );
        self.used_bytes += len;
        Ok(())
    }

    /// Read the payload stored in `slot`
    pub fn read(&mut self, slot: &DiskSlot) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; slot.len as usize];
        self.file.seek(SeekFrom::Start(slot.offset))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    pub fn slot(&self, key: &ElementKey) -> Option<&DiskSlot> {
        self.slots.get(key)
    }

    /// Drop the record for `key`, returning its block to the free list
    pub fn remove(&mut self, key: &ElementKey) -> Option<DiskSlot> {
        let slot = self.slots.remove(key)?;
        if let Err(e) = self.invalidate_index() {
            warn!(cache = %self.cache_name, error = %e, "Failed to truncate disk store index");
        }
        self.used_bytes = self.used_bytes.saturating_sub(slot.len);
        self.free_blocks.push(FreeBlock {
            offset: slot.offset,
            size: slot.block_size,
        });
        Some(slot)
    }

    /// Drop every record and truncate the data file
    pub fn clear(&mut self) -> Result<()> {
        self.invalidate_index()?;
        self.slots.clear();
        self.free_blocks.clear();
        self.file.set_len(0)?;
        self.file_len = 0;
        self.used_bytes = 0;
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &ElementKey> {
        self.slots.keys()
    }

    pub fn contains_key(&self, key: &ElementKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Keys whose recorded expiry instant has passed
    pub fn expired_keys(&self, now: u64) -> Vec<ElementKey> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.expires_at.is_some_and(|at| now > at))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    /// Flush the data file and write the index for the next start
    pub fn persist_index(&mut self) -> Result<()> {
        self.file.sync_all()?;

        let index = PersistedIndex {
            format_version: INDEX_FORMAT_VERSION,
            file_len: self.file_len,
            slots: self
                .slots
                .iter()
                .map(|(key, slot)| (key.clone(), *slot))
                .collect(),
            free_blocks: self.free_blocks.clone(),
        };
        let encoded = bincode::serialize(&index)?;
        fs::write(&self.index_path, encoded)?;
        self.index_written = true;

        debug!(
            cache = %self.cache_name,
            elements = self.slots.len(),
            "Wrote disk store index"
        );
        Ok(())
    }

    /// Remove both files from the directory
    pub fn delete_files(&mut self) -> Result<()> {
        self.slots.clear();
        self.free_blocks.clear();
        self.index_written = false;
        remove_if_exists(&self.data_path)?;
        remove_if_exists(&self.index_path)?;
        Ok(())
    }

    /// Zero an index written earlier, since the layout is about to change
    fn invalidate_index(&mut self) -> Result<()> {
        if self.index_written {
            File::create(&self.index_path)?;
            self.index_written = false;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(payload)?;
        Ok(())
    }

    fn take_free_block(&mut self, len: u64) -> Option<FreeBlock> {
        let position = self.free_blocks.iter().position(|block| block.size >= len)?;
        Some(self.free_blocks.swap_remove(position))
    }
}

fn read_index(index_path: &Path, data_path: &Path, cache_name: &str) -> Option<PersistedIndex> {
    let bytes = match fs::read(index_path) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => {
            if data_path.exists() {
                warn!(cache = %cache_name, "Disk store index is empty, discarding data file from unclean shutdown");
            }
            return None;
        }
        Err(_) => return None,
    };

    let index: PersistedIndex = match bincode::deserialize(&bytes) {
        Ok(index) => index,
        Err(e) => {
            let error = Error::Corrupt {
                cache: cache_name.to_string(),
                reason: e.to_string(),
            };
            warn!(error = %error, "Discarding unreadable disk store index");
            return None;
        }
    };

    if index.format_version != INDEX_FORMAT_VERSION {
        warn!(
            cache = %cache_name,
            found = index.format_version,
            expected = INDEX_FORMAT_VERSION,
            "Disk store index format mismatch, discarding"
        );
        return None;
    }

    let data_len = fs::metadata(data_path).map(|m| m.len()).unwrap_or(0);
    if data_len < index.file_len {
        warn!(
            cache = %cache_name,
            data_len,
            expected = index.file_len,
            "Data file shorter than index claims, discarding"
        );
        return None;
    }

    Some(index)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ElementKey {
        ElementKey::from(s)
    }

    fn write(store: &mut DataStore, k: &str, payload: &[u8]) {
        store
            .write(&key(k), payload, None, 1, CompressionAlgorithm::None)
            .unwrap();
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DataStore::open(dir.path(), "c", false).unwrap();

        write(&mut store, "a", b"hello");
        let slot = *store.slot(&key("a")).unwrap();
        assert_eq!(store.read(&slot).unwrap(), b"hello");
        assert_eq!(store.used_bytes(), 5);

        assert!(store.remove(&key("a")).is_some());
        assert!(store.remove(&key("a")).is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(store.free_block_count(), 1);
    }

    #[test]
    fn test_freed_blocks_reused_first_fit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DataStore::open(dir.path(), "c", false).unwrap();

        write(&mut store, "a", &[1u8; 100]);
        write(&mut store, "b", &[2u8; 10]);
        store.remove(&key("a"));

        write(&mut store, "c", &[3u8; 40]);
        let slot = *store.slot(&key("c")).unwrap();
        assert_eq!(slot.offset, 0);
        assert_eq!(slot.block_size, 100);
        assert_eq!(store.file_len(), 110);

        // Too large for any freed block
        write(&mut store, "d", &[4u8; 200]);
        assert_eq!(store.slot(&key("d")).unwrap().offset, 110);

        let b = *store.slot(&key("b")).unwrap();
        assert_eq!(store.read(&b).unwrap(), vec![2u8; 10]);
    }

    #[test]
    fn test_overwrite_frees_old_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DataStore::open(dir.path(), "c", false).unwrap();

        write(&mut store, "a", b"first");
        write(&mut store, "a", b"second!");
        assert_eq!(store.len(), 1);
        assert_eq!(store.used_bytes(), 7);

        let slot = *store.slot(&key("a")).unwrap();
        assert_eq!(store.read(&slot).unwrap(), b"second!");
    }

    #[test]
    fn test_expired_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DataStore::open(dir.path(), "c", false).unwrap();

        store
            .write(&key("soon"), b"x", Some(1_000), 1, CompressionAlgorithm::None)
            .unwrap();
        store
            .write(&key("never"), b"x", None, 1, CompressionAlgorithm::None)
            .unwrap();

        assert!(store.expired_keys(1_000).is_empty());
        assert_eq!(store.expired_keys(1_001), vec![key("soon")]);
    }

    #[test]
    fn test_persistent_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = DataStore::open(dir.path(), "p", true).unwrap();
            write(&mut store, "a", b"alpha");
            write(&mut store, "b", b"beta");
            store.persist_index().unwrap();
        }

        let mut store = DataStore::open(dir.path(), "p", true).unwrap();
        assert_eq!(store.len(), 2);
        let slot = *store.slot(&key("b")).unwrap();
        assert_eq!(store.read(&slot).unwrap(), b"beta");

        // The index is consumed on open
        assert_eq!(fs::metadata(dir.path().join("p.index")).unwrap().len(), 0);
    }

    #[test]
    fn test_unclean_shutdown_discards_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = DataStore::open(dir.path(), "p", true).unwrap();
            write(&mut store, "a", b"alpha");
            // no persist_index
        }

        let store = DataStore::open(dir.path(), "p", true).unwrap();
        assert_eq!(store.len(), 0);
        assert_eq!(store.file_len(), 0);
    }

    #[test]
    fn test_mutation_after_persist_truncates_index() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("p.index");
        {
            let mut store = DataStore::open(dir.path(), "p", true).unwrap();
            write(&mut store, "a", b"alpha");
            store.persist_index().unwrap();
            assert!(fs::metadata(&index_path).unwrap().len() > 0);

            store.remove(&key("a"));
            assert_eq!(fs::metadata(&index_path).unwrap().len(), 0);

            // Reuses a's freed block
            write(&mut store, "b", b"bravo");
            assert_eq!(store.slot(&key("b")).unwrap().offset, 0);
            // dropped without a second persist_index
        }

        let store = DataStore::open(dir.path(), "p", true).unwrap();
        assert_eq!(store.len(), 0);
        assert!(store.slot(&key("a")).is_none());
    }

    #[test]
    fn test_failed_write_keeps_space_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DataStore::open(dir.path(), "c", false).unwrap();
        write(&mut store, "a", &[1u8; 100]);
        write(&mut store, "b", &[2u8; 10]);
        store.remove(&key("a"));

        // Read-only handle makes every write fail
        store.file = File::open(dir.path().join("c.data")).unwrap();

        assert!(store
            .write(&key("c"), &[3u8; 40], None, 1, CompressionAlgorithm::None)
            .is_err());
        assert_eq!(store.free_block_count(), 1);
        assert_eq!(store.file_len(), 110);

        assert!(store
            .write(&key("d"), &[4u8; 500], None, 1, CompressionAlgorithm::None)
            .is_err());
        assert_eq!(store.file_len(), 110);
        assert!(!store.contains_key(&key("c")));
        assert!(!store.contains_key(&key("d")));

        // Space is still usable once writes succeed again
        store.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("c.data"))
            .unwrap();
        write(&mut store, "c", &[3u8; 40]);
        assert_eq!(store.slot(&key("c")).unwrap().offset, 0);
    }

    #[test]
    fn test_corrupt_index_discarded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("p.data"), b"junk").unwrap();
        fs::write(dir.path().join("p.index"), b"\x01\x02").unwrap();

        let store = DataStore::open(dir.path(), "p", true).unwrap();
        assert_eq!(store.len(), 0);
        assert_eq!(fs::metadata(dir.path().join("p.data")).unwrap().len(), 0);
    }

    #[test]
    fn test_transient_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = DataStore::open(dir.path(), "t", true).unwrap();
            write(&mut store, "a", b"alpha");
            store.persist_index().unwrap();
        }

        let mut store = DataStore::open(dir.path(), "t", false).unwrap();
        assert_eq!(store.len(), 0);

        store.delete_files().unwrap();
        assert!(!dir.path().join("t.data").exists());
    }
}
