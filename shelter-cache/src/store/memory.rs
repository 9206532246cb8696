//! In-memory implementation of the `DataStore` trait. Everything lives behind
//! `std::sync::Mutex`es and is lost when the process exits; used by tests and
//! by single-process deployments that accept a cold cache on restart.
use crate::{
    BlobId, BodyRef, CacheEntry, DataStore, EntryId, NewCacheEntry, StoreError,
    TypeSelector, Zone, store::BLOB_PART_SIZE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct BlobPart {
    data_id: BlobId,
    part_number: u32,
    bytes: Vec<u8>,
}

pub struct InMemoryDataStore {
    options: Mutex<HashMap<String, String>>,
    entries: Mutex<Vec<CacheEntry>>,
    blobs: Mutex<Vec<BlobPart>>,
    zones: Mutex<Vec<Zone>>,
    part_size: usize,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::with_part_size(BLOB_PART_SIZE)
    }

    pub fn with_part_size(part_size: usize) -> Self {
        Self {
            options: Mutex::new(HashMap::new()),
            entries: Mutex::new(Vec::new()),
            blobs: Mutex::new(Vec::new()),
            zones: Mutex::new(Vec::new()),
            part_size: part_size.max(1),
        }
    }

    /// Number of stored blob parts, across all blobs.
    pub fn blob_part_count(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or_default()
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_error<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_option(&self, name: &str) -> Result<Option<String>, StoreError> {
        let options = self.options.lock().map_err(lock_error)?;
        Ok(options.get(name).cloned())
    }

    async fn set_option(&self, name: &str, value: &str) -> Result<(), StoreError> {
        let mut options = self.options.lock().map_err(lock_error)?;
        options.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_option(&self, name: &str) -> Result<(), StoreError> {
        let mut options = self.options.lock().map_err(lock_error)?;
        options.remove(name);
        Ok(())
    }

    async fn entry_by_url(&self, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entries = self.entries.lock().map_err(lock_error)?;
        Ok(entries
            .iter()
            .filter(|e| e.url == url)
            .max_by_key(|e| e.timestamp)
            .cloned())
    }

    async fn insert_entry(&self, entry: NewCacheEntry) -> Result<CacheEntry, StoreError> {
        let mut entries = self.entries.lock().map_err(lock_error)?;
        let entry = entry.with_id(Uuid::new_v4().to_string());
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn update_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(lock_error)?;
        let slot = entries
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| StoreError::NotFound(entry.id.clone()))?;
        *slot = entry.clone();
        Ok(())
    }

    async fn delete_entry(&self, id: &EntryId) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(lock_error)?;
        entries.retain(|e| &e.id != id);
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let entries = self.entries.lock().map_err(lock_error)?;
        Ok(entries.clone())
    }

    async fn entries_by_type(&self, selector: &TypeSelector) -> Result<Vec<CacheEntry>, StoreError> {
        let entries = self.entries.lock().map_err(lock_error)?;
        Ok(entries.iter().filter(|e| e.matches(selector)).cloned().collect())
    }

    async fn entries_timed_out_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CacheEntry>, StoreError> {
        let entries = self.entries.lock().map_err(lock_error)?;
        Ok(entries
            .iter()
            .filter(|e| e.timeout_at() < cutoff)
            .cloned()
            .collect())
    }

    async fn timeout_entries_by_type(&self, selector: &TypeSelector) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().map_err(lock_error)?;
        let mut changed = 0;
        for entry in entries.iter_mut().filter(|e| e.matches(selector)) {
            entry.timeout_seconds = 0;
            changed += 1;
        }
        Ok(changed)
    }

    async fn entry_filenames(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(lock_error)?;
        Ok(entries
            .iter()
            .filter_map(|e| e.body.filename().map(str::to_string))
            .collect())
    }

    async fn save_blob(&self, data: &[u8]) -> Result<BlobId, StoreError> {
        let mut blobs = self.blobs.lock().map_err(lock_error)?;
        let data_id = Uuid::new_v4().to_string();
        // An empty body still gets one (empty) part so it can be loaded back.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(self.part_size).collect()
        };
        for (part_number, chunk) in chunks.into_iter().enumerate() {
            blobs.push(BlobPart {
                data_id: data_id.clone(),
                part_number: part_number as u32,
                bytes: chunk.to_vec(),
            });
        }
        Ok(data_id)
    }

    async fn load_blob(&self, id: &BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self.blobs.lock().map_err(lock_error)?;
        let mut parts: Vec<&BlobPart> = blobs.iter().filter(|p| &p.data_id == id).collect();
        if parts.is_empty() {
            return Ok(None);
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(Some(parts.iter().flat_map(|p| p.bytes.iter().copied()).collect()))
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().map_err(lock_error)?;
        blobs.retain(|p| &p.data_id != id);
        Ok(())
    }

    async fn delete_orphan_blobs(&self) -> Result<u64, StoreError> {
        let referenced: HashSet<String> = {
            let entries = self.entries.lock().map_err(lock_error)?;
            entries
                .iter()
                .filter_map(|e| match &e.body {
                    BodyRef::Blob(id) => Some(id.clone()),
                    BodyRef::File(_) => None,
                })
                .collect()
        };
        let mut blobs = self.blobs.lock().map_err(lock_error)?;
        let orphans: HashSet<String> = blobs
            .iter()
            .filter(|p| !referenced.contains(&p.data_id))
            .map(|p| p.data_id.clone())
            .collect();
        blobs.retain(|p| !orphans.contains(&p.data_id));
        Ok(orphans.len() as u64)
    }

    async fn all_zones(&self) -> Result<Vec<Zone>, StoreError> {
        let zones = self.zones.lock().map_err(lock_error)?;
        Ok(zones.clone())
    }

    async fn replace_zones(&self, new_zones: &[Zone]) -> Result<(), StoreError> {
        let mut zones = self.zones.lock().map_err(lock_error)?;
        *zones = new_zones.to_vec();
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        let parts = self.blob_part_count();
        f.debug_struct("InMemoryDataStore")
            .field("entries", &entries)
            .field("blob_parts", &parts)
            .field("part_size", &self.part_size)
            .finish()
    }
}
