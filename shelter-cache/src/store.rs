//! Storage collaborator behind the cache: options, cache entry metadata,
//! chunked byte blobs and the zone list. Backends implement [`DataStore`].
use crate::{BlobId, CacheEntry, EntryId, NewCacheEntry, StoreError, TypeSelector, Zone};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongodb;

/// Default size of one stored blob part, in bytes.
pub const BLOB_PART_SIZE: usize = 1024;

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_option(&self, name: &str) -> Result<Option<String>, StoreError>;

    async fn set_option(&self, name: &str, value: &str) -> Result<(), StoreError>;

    async fn delete_option(&self, name: &str) -> Result<(), StoreError>;

    /// `"true"`/`"1"` and `"false"`/`"0"`, anything else yields `default`.
    async fn get_option_as_bool(&self, name: &str, default: bool) -> Result<bool, StoreError> {
        Ok(match self.get_option(name).await?.as_deref().map(str::trim) {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        })
    }

    /// Options holding timestamps are stored as RFC 3339 text.
    async fn get_option_as_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .get_option(name)
            .await?
            .and_then(|v| DateTime::parse_from_rfc3339(v.trim()).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn set_option_time(&self, name: &str, value: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_option(name, &value.to_rfc3339()).await
    }

    /// Return the counter's current value (`min` when unset) and store the
    /// next one, wrapping from `max` back to `min`.
    async fn increment_counter_option(
        &self,
        name: &str,
        min: i64,
        max: i64,
    ) -> Result<i64, StoreError> {
        let current = self
            .get_option(name)
            .await?
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| (min..=max).contains(v))
            .unwrap_or(min);
        let next = if current >= max { min } else { current + 1 };
        self.set_option(name, &next.to_string()).await?;
        Ok(current)
    }

    /// Latest entry stored for the exact normalised url.
    async fn entry_by_url(&self, url: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn insert_entry(&self, entry: NewCacheEntry) -> Result<CacheEntry, StoreError>;

    async fn update_entry(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    async fn delete_entry(&self, id: &EntryId) -> Result<(), StoreError>;

    async fn all_entries(&self) -> Result<Vec<CacheEntry>, StoreError>;

    async fn entries_by_type(&self, selector: &TypeSelector) -> Result<Vec<CacheEntry>, StoreError>;

    /// Entries whose `timestamp + timeout_seconds` lies before `cutoff`.
    async fn entries_timed_out_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CacheEntry>, StoreError>;

    /// Zero the timeout of every matching entry. Returns how many changed.
    async fn timeout_entries_by_type(&self, selector: &TypeSelector) -> Result<u64, StoreError>;

    /// File names referenced by any entry.
    async fn entry_filenames(&self) -> Result<Vec<String>, StoreError>;

    /// Store `data` as ordered parts; partial writes are removed on failure.
    async fn save_blob(&self, data: &[u8]) -> Result<BlobId, StoreError>;

    async fn load_blob(&self, id: &BlobId) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete_blob(&self, id: &BlobId) -> Result<(), StoreError>;

    /// Remove blobs no entry refers to. Returns how many were removed.
    async fn delete_orphan_blobs(&self) -> Result<u64, StoreError>;

    async fn all_zones(&self) -> Result<Vec<Zone>, StoreError>;

    async fn replace_zones(&self, zones: &[Zone]) -> Result<(), StoreError>;

    async fn clear_zones(&self) -> Result<(), StoreError> {
        self.replace_zones(&[]).await
    }
}
