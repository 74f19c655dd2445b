use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metadata::MediaType;
use crate::storage::{CacheWriter, EvictableRegion, KvBackend, RecordStore, records};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    stored_at: i64,
    value: serde_json::Value,
}

/// Response cache shared by every metadata lookup.
///
/// Held in memory and mirrored to the `metadataCache` record through a
/// [`CacheWriter`]. Tracking records never live here, so the whole cache
/// can be dropped at any time.
pub struct MetadataCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl_ms: i64,
    store: RecordStore,
    writer: CacheWriter,
}

pub fn details_key(media_type: MediaType, id: u64, language: &str) -> String {
    format!("{}:{}:{}", media_type, id, language)
}

pub fn season_key(series_id: u64, season_number: u32, language: &str) -> String {
    format!("season:{}:{}:{}", series_id, season_number, language)
}

impl MetadataCache {
    /// Load the persisted cache and register it as the first region to evict
    pub fn open(store: &RecordStore, ttl: Duration, flush_delay: Duration) -> Arc<Self> {
        let entries: HashMap<String, CacheEntry> = store.load(records::METADATA_CACHE);
        debug!(entries = entries.len(), "Loaded metadata cache");

        let cache = Arc::new(Self {
            entries: Mutex::new(entries),
            ttl_ms: ttl.as_millis() as i64,
            store: store.clone(),
            writer: CacheWriter::spawn(store.clone(), flush_delay),
        });
        store.register_evictable(0, cache.clone());
        cache
    }

    pub fn get(&self, key: &str, now_ms: i64) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if now_ms - entry.stored_at < self.ttl_ms => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, value: serde_json::Value, now_ms: i64) {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.insert(
                key,
                CacheEntry {
                    stored_at: now_ms,
                    value,
                },
            );
            serde_json::to_string(&*entries)
        };

        match snapshot {
            Ok(contents) => self.writer.schedule(records::METADATA_CACHE, contents),
            Err(e) => warn!(error = %e, "Failed to serialize metadata cache"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached response, in memory and on disk
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.writer.discard(records::METADATA_CACHE);
        if let Err(e) = self.store.remove(records::METADATA_CACHE) {
            warn!(error = %e, "Failed to remove persisted metadata cache");
        }
        info!("Metadata cache cleared");
    }

    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

impl EvictableRegion for MetadataCache {
    fn name(&self) -> &str {
        records::METADATA_CACHE
    }

    fn evict(&self, backend: &mut dyn KvBackend) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.writer.discard(records::METADATA_CACHE);
        backend.remove(records::METADATA_CACHE)
    }
}
