//! Persistent record store
//!
//! Every tracking record is an independent JSON document addressed by name.
//! Records are loaded once and written back after each mutation. There is no
//! transaction spanning several records.

pub mod coalesce;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{Error, Result};

pub use coalesce::CacheWriter;

/// Names of the persisted records
pub mod records {
    pub const WATCHED: &str = "watched";
    pub const WATCHLIST: &str = "watchlist";
    pub const FAVORITES: &str = "favorites";
    pub const SERIES_STATUSES: &str = "seriesStatuses";
    pub const LAST_WATCHED: &str = "lastWatched";
    pub const EPISODE_DETAILS: &str = "episodeDetails";
    pub const METADATA_CACHE: &str = "metadataCache";
}

/// Raw key-value storage underneath the record store
pub trait KvBackend: Send {
    fn read(&self, name: &str) -> Result<Option<String>>;

    /// Must return [`Error::StorageFull`] when the write exceeds capacity
    fn write(&mut self, name: &str, contents: &str) -> Result<()>;

    fn remove(&mut self, name: &str) -> Result<()>;
}

/// A secondary cache the store may clear to make room for tracking records
pub trait EvictableRegion: Send + Sync {
    fn name(&self) -> &str;

    fn evict(&self, backend: &mut dyn KvBackend) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    WrittenAfterEviction,
    /// Storage stayed full after eviction; the write was discarded
    Dropped,
}

struct RegisteredRegion {
    priority: u8,
    region: Arc<dyn EvictableRegion>,
}

#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<Mutex<Box<dyn KvBackend>>>,
    regions: Arc<Mutex<Vec<RegisteredRegion>>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordStore {
    pub fn new(backend: impl KvBackend + 'static) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Box::new(backend))),
            regions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Filesystem store rooted at the configured record directory
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let dir = config.records_dir()?;
        std::fs::create_dir_all(&dir)?;
        info!(path = %dir.display(), "Opened record store");
        Ok(Self::new(FsBackend::new(dir, config.quota_bytes)))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }

    /// Load a record, falling back to its empty default when absent or unreadable
    pub fn load<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let contents = match lock(&self.backend).read(name) {
            Ok(Some(contents)) => contents,
            Ok(None) => return T::default(),
            Err(e) => {
                warn!(record = name, error = %e, "Failed to read record");
                return T::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                warn!(record = name, error = %e, "Corrupt record, using empty default");
                T::default()
            }
        }
    }

    pub fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<SaveOutcome> {
        let contents = serde_json::to_string(value)?;
        self.save_raw(name, &contents)
    }

    /// Write a serialized record, evicting secondary caches once if storage is full
    pub fn save_raw(&self, name: &str, contents: &str) -> Result<SaveOutcome> {
        let mut backend = lock(&self.backend);

        match backend.write(name, contents) {
            Ok(()) => return Ok(SaveOutcome::Written),
            Err(Error::StorageFull { .. }) => {}
            Err(e) => return Err(e),
        }

        warn!(record = name, "Storage full, evicting secondary caches");
        self.evict_regions(name, &mut **backend);

        match backend.write(name, contents) {
            Ok(()) => Ok(SaveOutcome::WrittenAfterEviction),
            Err(Error::StorageFull { .. }) => {
                warn!(record = name, "Storage still full after eviction, dropping write");
                Ok(SaveOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        lock(&self.backend).remove(name)
    }

    /// Register a cache that may be cleared on storage exhaustion.
    /// Lower priority values are evicted first.
    pub fn register_evictable(&self, priority: u8, region: Arc<dyn EvictableRegion>) {
        let mut regions = lock(&self.regions);
        regions.push(RegisteredRegion { priority, region });
        regions.sort_by_key(|r| r.priority);
    }

    /// Evict every region except the one backing `record`
    fn evict_regions(&self, record: &str, backend: &mut dyn KvBackend) {
        let regions = lock(&self.regions);
        for registered in regions.iter().filter(|r| r.region.name() != record) {
            match registered.region.evict(backend) {
                Ok(()) => debug!(region = registered.region.name(), "Evicted cache region"),
                Err(e) => warn!(
                    region = registered.region.name(),
                    error = %e,
                    "Failed to evict cache region"
                ),
            }
        }
    }
}

/// One `<name>.json` file per record
pub struct FsBackend {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FsBackend {
    pub fn new(dir: PathBuf, quota_bytes: Option<u64>) -> Self {
        Self { dir, quota_bytes }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn used_bytes_excluding(&self, name: &str) -> Result<u64> {
        let skip = self.path(name);
        let mut total = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path() == skip {
                continue;
            }
            total += entry.metadata()?.len();
        }
        Ok(total)
    }
}

impl KvBackend for FsBackend {
    fn read(&self, name: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(name)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, name: &str, contents: &str) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            if self.used_bytes_excluding(name)? + contents.len() as u64 > quota {
                return Err(Error::StorageFull {
                    record: name.to_string(),
                });
            }
        }

        std::fs::create_dir_all(&self.dir)?;
        match std::fs::write(self.path(name), contents) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::StorageFull => Err(Error::StorageFull {
                record: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<String, String>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            quota_bytes: Some(quota_bytes),
        }
    }
}

impl KvBackend for MemoryBackend {
    fn read(&self, name: &str) -> Result<Option<String>> {
        Ok(self.entries.get(name).cloned())
    }

    fn write(&mut self, name: &str, contents: &str) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let used: usize = self
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != name)
                .map(|(_, v)| v.len())
                .sum();
            if used + contents.len() > quota {
                return Err(Error::StorageFull {
                    record: name.to_string(),
                });
            }
        }
        self.entries.insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        self.entries.remove(name);
        Ok(())
    }
}
