//! MongoDB implementation of the `DataStore` trait.
//!
//! Collections are named after a prefix: `{prefix}_options`,
//! `{prefix}_entries`, `{prefix}_blobs` and `{prefix}_zones`.
use crate::{
    BlobId, BodyRef, CacheEntry, DataStore, EntryId, NewCacheEntry, StoreError,
    TypeSelector, Zone, store::BLOB_PART_SIZE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    Collection, Database,
    bson::{self, Binary, Document, doc, spec::BinarySubtype},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptionDoc {
    #[serde(rename = "_id")]
    name: String,
    value: String,
}

/// Largest timeout kept in a document. The timed-out query adds
/// `timeout_seconds * 1000` to the timestamp in milliseconds, which must
/// stay inside the range of a BSON date.
const MAX_STORED_TIMEOUT_SECONDS: i64 = 9_000_000_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryDoc {
    #[serde(rename = "_id")]
    id: String,
    url: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    timestamp: DateTime<Utc>,
    timeout_seconds: i64,
    content_type: Option<String>,
    last_modified: Option<String>,
    etag: Option<String>,
    content_length: Option<i64>,
    filename: Option<String>,
    blob_id: Option<String>,
    cache_type: Option<String>,
}

impl EntryDoc {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            id: entry.id.clone(),
            url: entry.url.clone(),
            timestamp: entry.timestamp,
            timeout_seconds: i64::try_from(entry.timeout_seconds)
                .unwrap_or(i64::MAX)
                .min(MAX_STORED_TIMEOUT_SECONDS),
            content_type: entry.content_type.clone(),
            last_modified: entry.last_modified.clone(),
            etag: entry.etag.clone(),
            content_length: entry.content_length.map(|l| i64::try_from(l).unwrap_or(i64::MAX)),
            filename: entry.body.filename().map(str::to_string),
            blob_id: entry.body.blob_id().map(str::to_string),
            cache_type: entry.cache_type.clone(),
        }
    }

    fn into_entry(self) -> Result<CacheEntry, StoreError> {
        let body = match (self.filename, self.blob_id) {
            (Some(name), None) => BodyRef::File(name),
            (None, Some(id)) => BodyRef::Blob(id),
            _ => {
                return Err(StoreError::Serialization(format!(
                    "entry {} must reference exactly one body location",
                    self.id
                )));
            }
        };
        Ok(CacheEntry {
            id: self.id,
            url: self.url,
            timestamp: self.timestamp,
            timeout_seconds: self.timeout_seconds.max(0) as u64,
            content_type: self.content_type,
            last_modified: self.last_modified,
            etag: self.etag,
            content_length: self.content_length.map(|l| l.max(0) as u64),
            body,
            cache_type: self.cache_type,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobPartDoc {
    data_id: String,
    part_number: i32,
    bytes: Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ZoneDoc {
    server_zone_id: i64,
    name: String,
}

pub struct MongoDataStore {
    options: Collection<OptionDoc>,
    entries: Collection<EntryDoc>,
    blobs: Collection<BlobPartDoc>,
    zones: Collection<ZoneDoc>,
    part_size: usize,
}

impl MongoDataStore {
    pub async fn new(database: Database, prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            options: database.collection(&format!("{prefix}_options")),
            entries: database.collection(&format!("{prefix}_entries")),
            blobs: database.collection(&format!("{prefix}_blobs")),
            zones: database.collection(&format!("{prefix}_zones")),
            part_size: BLOB_PART_SIZE,
        })
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    async fn find_entries(&self, filter: Document) -> Result<Vec<CacheEntry>, StoreError> {
        let docs: Vec<EntryDoc> = self.entries.find(filter).await?.try_collect().await?;
        docs.into_iter().map(EntryDoc::into_entry).collect()
    }
}

fn selector_filter(selector: &TypeSelector) -> Document {
    match selector {
        TypeSelector::Any => doc! {},
        TypeSelector::Untagged => doc! { "cache_type": null },
        TypeSelector::Tagged(tag) => doc! { "cache_type": tag.as_str() },
    }
}

#[async_trait]
impl DataStore for MongoDataStore {
    async fn get_option(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .options
            .find_one(doc! { "_id": name })
            .await?
            .map(|o| o.value))
    }

    async fn set_option(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.options
            .update_one(doc! { "_id": name }, doc! { "$set": { "value": value } })
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn delete_option(&self, name: &str) -> Result<(), StoreError> {
        self.options.delete_one(doc! { "_id": name }).await?;
        Ok(())
    }

    async fn entry_by_url(&self, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.entries
            .find_one(doc! { "url": url })
            .sort(doc! { "timestamp": -1 })
            .await?
            .map(EntryDoc::into_entry)
            .transpose()
    }

    async fn insert_entry(&self, entry: NewCacheEntry) -> Result<CacheEntry, StoreError> {
        let entry = entry.with_id(Uuid::new_v4().to_string());
        self.entries.insert_one(EntryDoc::from_entry(&entry)).await?;
        Ok(entry)
    }

    async fn update_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let result = self
            .entries
            .replace_one(doc! { "_id": entry.id.as_str() }, EntryDoc::from_entry(entry))
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound(entry.id.clone()));
        }
        Ok(())
    }

    async fn delete_entry(&self, id: &EntryId) -> Result<(), StoreError> {
        self.entries.delete_one(doc! { "_id": id.as_str() }).await?;
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.find_entries(doc! {}).await
    }

    async fn entries_by_type(&self, selector: &TypeSelector) -> Result<Vec<CacheEntry>, StoreError> {
        self.find_entries(selector_filter(selector)).await
    }

    async fn entries_timed_out_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CacheEntry>, StoreError> {
        let cutoff = bson::DateTime::from_chrono(cutoff);
        self.find_entries(doc! {
            "$expr": {
                "$lt": [
                    { "$add": ["$timestamp", { "$multiply": ["$timeout_seconds", 1000] }] },
                    cutoff,
                ]
            }
        })
        .await
    }

    async fn timeout_entries_by_type(&self, selector: &TypeSelector) -> Result<u64, StoreError> {
        let result = self
            .entries
            .update_many(selector_filter(selector), doc! { "$set": { "timeout_seconds": 0_i64 } })
            .await?;
        Ok(result.matched_count)
    }

    async fn entry_filenames(&self) -> Result<Vec<String>, StoreError> {
        let docs: Vec<EntryDoc> = self
            .entries
            .find(doc! { "filename": { "$ne": null } })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().filter_map(|d| d.filename).collect())
    }

    async fn save_blob(&self, data: &[u8]) -> Result<BlobId, StoreError> {
        let data_id = Uuid::new_v4().to_string();
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(self.part_size).collect()
        };
        for (part_number, chunk) in chunks.into_iter().enumerate() {
            let part = BlobPartDoc {
                data_id: data_id.clone(),
                part_number: part_number as i32,
                bytes: Binary {
                    subtype: BinarySubtype::Generic,
                    bytes: chunk.to_vec(),
                },
            };
            if let Err(e) = self.blobs.insert_one(part).await {
                let rollback = self.blobs.delete_many(doc! { "data_id": data_id.as_str() }).await;
                if let Err(rm) = rollback {
                    warn!(%data_id, error = %rm, "rollback of partial blob failed");
                }
                return Err(e.into());
            }
        }
        Ok(data_id)
    }

    async fn load_blob(&self, id: &BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        let parts: Vec<BlobPartDoc> = self
            .blobs
            .find(doc! { "data_id": id.as_str() })
            .sort(doc! { "part_number": 1 })
            .await?
            .try_collect()
            .await?;
        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(parts.into_iter().flat_map(|p| p.bytes.bytes).collect()))
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<(), StoreError> {
        self.blobs.delete_many(doc! { "data_id": id.as_str() }).await?;
        Ok(())
    }

    async fn delete_orphan_blobs(&self) -> Result<u64, StoreError> {
        let referenced: HashSet<String> = self
            .entries
            .find(doc! { "blob_id": { "$ne": null } })
            .await?
            .try_collect::<Vec<EntryDoc>>()
            .await?
            .into_iter()
            .filter_map(|d| d.blob_id)
            .collect();

        let stored: Vec<bson::Bson> = self
            .blobs
            .distinct("data_id", doc! {})
            .await?;
        let orphans: Vec<String> = stored
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .filter(|id| !referenced.contains(id))
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }

        self.blobs
            .delete_many(doc! { "data_id": { "$in": orphans.clone() } })
            .await?;
        Ok(orphans.len() as u64)
    }

    async fn all_zones(&self) -> Result<Vec<Zone>, StoreError> {
        let docs: Vec<ZoneDoc> = self.zones.find(doc! {}).await?.try_collect().await?;
        Ok(docs
            .into_iter()
            .map(|z| Zone {
                server_zone_id: z.server_zone_id.max(0) as u32,
                name: z.name,
            })
            .collect())
    }

    async fn replace_zones(&self, zones: &[Zone]) -> Result<(), StoreError> {
        self.zones.delete_many(doc! {}).await?;
        if zones.is_empty() {
            return Ok(());
        }
        let docs = zones.iter().map(|z| ZoneDoc {
            server_zone_id: z.server_zone_id as i64,
            name: z.name.clone(),
        });
        self.zones.insert_many(docs).await?;
        Ok(())
    }
}
