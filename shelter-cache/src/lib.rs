//! Response cache for shelter.
//!
//! [`Cache`] keeps one entry per normalised url. Entry metadata, options,
//! zones and fallback body blobs live in a [`DataStore`]; bodies are written
//! to a [`FileBodyStore`] directory whenever possible.
mod cache;
mod entry;
mod error;
mod files;
pub mod store;

pub use cache::{Cache, CacheOptions, CacheOptionsBuilder, LAST_CLEANUP_OPTION};
pub use entry::{
    BlobId, BodyRef, CacheEntry, EntryId, NewCacheEntry, TypeSelector, Zone,
    add_seconds, normalize_type, normalize_url, seconds_delta, sub_seconds,
};
pub use error::{CacheError, StoreError};
pub use files::{FileBodyStore, cache_extension};
#[cfg(feature = "mongodb")]
pub use store::mongodb::MongoDataStore;
pub use store::{DataStore, memory::InMemoryDataStore};
