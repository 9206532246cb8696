use crate::{
    BodyRef, CacheEntry, CacheError, DataStore, FileBodyStore, NewCacheEntry,
    TypeSelector, add_seconds, normalize_type, normalize_url, sub_seconds,
};
use chrono::Utc;
use derive_builder::Builder;
use shelter_http::{Headers, HttpResponse};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Option key holding the time of the last full cleanup.
pub const LAST_CLEANUP_OPTION: &str = "last_cache_cleanup";

#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct CacheOptions {
    /// When false every lookup misses and every put is refused.
    #[builder(default = "true")]
    pub enabled: bool,
    #[builder(default = "PathBuf::from(\"cachedata\")")]
    pub data_dir: PathBuf,
    /// Store bodies in the data store only.
    #[builder(default = "false")]
    pub disable_file_write: bool,
    /// Used when a put asks for a timeout of zero.
    #[builder(default = "14_400")]
    pub default_timeout_secs: u64,
    #[builder(default = "72")]
    pub cleanup_every_hours: u64,
    /// How long a timed-out entry is kept for fallback use before cleanup
    /// removes it.
    #[builder(default = "604_800")]
    pub grace_period_secs: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("cachedata"),
            disable_file_write: false,
            default_timeout_secs: 14_400,
            cleanup_every_hours: 72,
            grace_period_secs: 604_800,
        }
    }
}

/// Response cache keyed by normalised url.
///
/// Metadata lives in a [`DataStore`]; bodies go to files when possible and
/// to chunked blobs in the store otherwise. At most one entry exists per
/// url. Failures never escape: lookups degrade to a miss and writes report
/// `false`, with the cause logged.
pub struct Cache {
    store: Arc<dyn DataStore>,
    files: FileBodyStore,
    options: CacheOptions,
}

impl Cache {
    pub fn new(store: Arc<dyn DataStore>, options: CacheOptions) -> Self {
        let files = FileBodyStore::new(options.data_dir.clone())
            .write_disabled(options.disable_file_write);
        Self {
            store,
            files,
            options,
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn files(&self) -> &FileBodyStore {
        &self.files
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Run [`Cache::cleanup`] if it never ran or the last run is older than
    /// `cleanup_every_hours`. Returns whether a cleanup happened.
    pub async fn init(&self) -> bool {
        let last = match self.store.get_option_as_time(LAST_CLEANUP_OPTION).await {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "could not read last cleanup time");
                None
            }
        };
        let every = self.options.cleanup_every_hours.saturating_mul(3600);
        let due = match last {
            None => true,
            Some(last) => Utc::now() > add_seconds(last, every),
        };
        if due {
            self.cleanup().await;
        }
        due
    }

    /// Latest entry for `url`, regardless of its timeout.
    pub async fn lookup(&self, url: &str) -> Option<CacheEntry> {
        if !self.options.enabled {
            return None;
        }
        let url = normalize_url(url)?;
        match self.store.entry_by_url(&url).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%url, error = %e, "cache lookup failed");
                None
            }
        }
    }

    pub async fn is_fresh(&self, url: &str, ignore_timeout: bool) -> bool {
        match self.lookup(url).await {
            Some(entry) => ignore_timeout || !entry.is_timed_out(Utc::now()),
            None => false,
        }
    }

    /// Rebuild a response from the entry stored for `url`.
    ///
    /// When `request_headers` carry `If-Modified-Since` or `If-None-Match`
    /// and every validator stored on the entry is matched by the request, a
    /// bodyless 304 is returned without touching body storage. An entry whose
    /// body cannot be read is deleted and treated as a miss.
    #[instrument(skip(self, request_headers))]
    pub async fn get(
        &self,
        url: &str,
        request_headers: Option<&Headers>,
        ignore_timeout: bool,
    ) -> Option<HttpResponse> {
        let entry = self.lookup(url).await?;
        let now = Utc::now();
        let timed_out = entry.is_timed_out(now);
        if timed_out && !ignore_timeout {
            return None;
        }

        let not_modified = request_headers.is_some_and(|h| validators_match(&entry, h));
        let body = if not_modified {
            Vec::new()
        } else {
            match self.load_body(&entry).await {
                Some(body) => body,
                None => {
                    warn!(url = %entry.url, body = ?entry.body, "cached body unreadable, dropping entry");
                    self.delete_entry(&entry).await;
                    return None;
                }
            }
        };

        let mut headers = Headers::new();
        if let Some(ct) = &entry.content_type {
            headers.append("Content-Type", ct.as_str());
        }
        if let Some(lm) = &entry.last_modified {
            headers.append("Last-Modified", lm.as_str());
        }
        if let Some(etag) = &entry.etag {
            headers.append("ETag", etag.as_str());
        }

        let status = if not_modified { 304 } else { 200 };
        let mut response = HttpResponse::from_parts(status, headers, body);
        response.cache.from_cache = true;
        response.cache.timed_out = timed_out;
        response.cache.seconds_since_timeout = entry.seconds_since_timeout(now);
        if let Some(lm) = &entry.last_modified {
            response.cache.renew_headers.append("If-Modified-Since", lm.as_str());
        }
        if let Some(etag) = &entry.etag {
            response.cache.renew_headers.append("If-None-Match", etag.as_str());
        }

        debug!(url = %entry.url, status, timed_out, "cache hit");
        Some(response)
    }

    async fn load_body(&self, entry: &CacheEntry) -> Option<Vec<u8>> {
        match &entry.body {
            BodyRef::File(name) => match self.files.load(name).await {
                Ok(body) => Some(body),
                Err(e) => {
                    debug!(file = %name, error = %e, "cache file load failed");
                    None
                }
            },
            BodyRef::Blob(id) => match self.store.load_blob(id).await {
                Ok(body) => body,
                Err(e) => {
                    debug!(blob = %id, error = %e, "cache blob load failed");
                    None
                }
            },
        }
    }

    /// Store `response` under `url`. Returns whether the cache now holds a
    /// valid, retrievable copy.
    ///
    /// - only 200 and 304 responses are accepted, never one that came from
    ///   the cache itself;
    /// - a 304 renews the existing entry when its validators match and
    ///   deletes it when they do not;
    /// - a 200 replaces any existing entry.
    #[instrument(skip(self, response), fields(status = response.status()))]
    pub async fn put(
        &self,
        url: &str,
        response: &HttpResponse,
        timeout_seconds: u64,
        cache_type: Option<&str>,
    ) -> bool {
        if !self.options.enabled || response.cache.from_cache {
            return false;
        }
        let status = response.status();
        if status != 200 && status != 304 {
            return false;
        }
        let Some(url) = normalize_url(url) else {
            return false;
        };
        let cache_type = cache_type.and_then(normalize_type);
        let timeout_seconds = if timeout_seconds == 0 {
            self.options.default_timeout_secs
        } else {
            timeout_seconds
        };

        let existing = match self.store.entry_by_url(&url).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(%url, error = %e, "cache lookup before put failed");
                return false;
            }
        };

        if let Some(mut entry) = existing {
            if status == 304 {
                if same_validator(entry.last_modified.as_deref(), response.last_modified())
                    && same_validator(entry.etag.as_deref(), response.etag())
                {
                    entry.timestamp = Utc::now();
                    entry.timeout_seconds = timeout_seconds;
                    if cache_type.is_some() {
                        entry.cache_type = cache_type;
                    }
                    return match self.store.update_entry(&entry).await {
                        Ok(()) => {
                            debug!(%url, "cache entry renewed");
                            true
                        }
                        Err(e) => {
                            warn!(%url, error = %e, "cache entry renewal failed");
                            false
                        }
                    };
                }
                info!(%url, "validators changed on 304, dropping cache entry");
                self.delete_entry(&entry).await;
                return false;
            }
            self.delete_entry(&entry).await;
        }

        if status != 200 {
            return false;
        }

        let Some(body_ref) = self.save_body(&url, response).await else {
            return false;
        };

        let entry = NewCacheEntry {
            url: url.clone(),
            timestamp: Utc::now(),
            timeout_seconds,
            content_type: response.content_type().map(str::to_string),
            last_modified: response.last_modified().map(str::to_string),
            etag: response.etag().map(str::to_string),
            content_length: Some(response.body().len() as u64),
            body: body_ref.clone(),
            cache_type,
        };

        match self.store.insert_entry(entry).await {
            Ok(entry) => {
                debug!(%url, id = %entry.id, body = ?entry.body, "cache entry stored");
                true
            }
            Err(e) => {
                warn!(%url, error = %e, "cache metadata write failed, removing body");
                self.delete_body(&body_ref).await;
                false
            }
        }
    }

    async fn save_body(&self, url: &str, response: &HttpResponse) -> Option<BodyRef> {
        match self
            .files
            .save(url, response.content_type(), response.body())
            .await
        {
            Ok(name) => return Some(BodyRef::File(name)),
            Err(CacheError::FileWriteDisabled) => {}
            Err(e) => warn!(%url, error = %e, "cache file write failed, using data store"),
        }
        match self.store.save_blob(response.body()).await {
            Ok(id) => Some(BodyRef::Blob(id)),
            Err(e) => {
                warn!(%url, error = %e, "cache blob write failed");
                None
            }
        }
    }

    async fn delete_body(&self, body: &BodyRef) {
        let result = match body {
            BodyRef::File(name) => self.files.delete(name).await,
            BodyRef::Blob(id) => self.store.delete_blob(id).await.map_err(CacheError::from),
        };
        if let Err(e) = result {
            debug!(body = ?body, error = %e, "cache body delete failed");
        }
    }

    /// Remove an entry's metadata and its body, wherever it is stored.
    pub async fn delete_entry(&self, entry: &CacheEntry) {
        if let Err(e) = self.store.delete_entry(&entry.id).await {
            warn!(id = %entry.id, error = %e, "cache entry delete failed");
        }
        self.delete_body(&entry.body).await;
    }

    pub async fn delete_by_url(&self, url: &str) {
        if let Some(entry) = self.lookup(url).await {
            self.delete_entry(&entry).await;
        }
    }

    /// Delete every entry matched by `selector`.
    pub async fn delete_by_type(&self, selector: &TypeSelector) -> usize {
        let entries = match self.store.entries_by_type(selector).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(?selector, error = %e, "cache type query failed");
                return 0;
            }
        };
        for entry in &entries {
            self.delete_entry(entry).await;
        }
        info!(?selector, deleted = entries.len(), "cache entries deleted by type");
        entries.len()
    }

    /// `None` deletes untagged entries; a blank tag deletes nothing.
    pub async fn delete_by_tag(&self, tag: Option<&str>) -> usize {
        match TypeSelector::from_tag(tag) {
            Some(selector) => self.delete_by_type(&selector).await,
            None => 0,
        }
    }

    pub async fn clear(&self) -> usize {
        self.delete_by_type(&TypeSelector::Any).await
    }

    /// Force matching entries stale without deleting them.
    pub async fn timeout_by_type(&self, selector: &TypeSelector) -> u64 {
        match self.store.timeout_entries_by_type(selector).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(?selector, error = %e, "cache timeout by type failed");
                0
            }
        }
    }

    /// Entries matched by `selector`, optionally skipping timed-out ones.
    pub async fn entries_by_type(
        &self,
        selector: &TypeSelector,
        exclude_timed_out: bool,
    ) -> Vec<CacheEntry> {
        if !self.options.enabled {
            return Vec::new();
        }
        let now = Utc::now();
        match self.store.entries_by_type(selector).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| !exclude_timed_out || !e.is_timed_out(now))
                .collect(),
            Err(e) => {
                warn!(?selector, error = %e, "cache type query failed");
                Vec::new()
            }
        }
    }

    /// Delete entries that timed out more than `grace_seconds` ago.
    pub async fn sweep_expired(&self, grace_seconds: u64) -> usize {
        let cutoff = sub_seconds(Utc::now(), grace_seconds);
        let expired = match self.store.entries_timed_out_before(cutoff).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "expired entry query failed");
                return 0;
            }
        };
        for entry in &expired {
            self.delete_entry(entry).await;
        }
        expired.len()
    }

    /// Delete body files and blobs that no entry refers to.
    pub async fn sweep_orphans(&self) -> usize {
        let mut removed = 0;

        match (self.files.list().await, self.store.entry_filenames().await) {
            (Ok(files), Ok(referenced)) => {
                for name in files.iter().filter(|f| !referenced.contains(f)) {
                    match self.files.delete(name).await {
                        Ok(()) => removed += 1,
                        Err(e) => debug!(file = %name, error = %e, "orphan delete failed"),
                    }
                }
            }
            (Err(e), _) => warn!(error = %e, "could not list cache files"),
            (_, Err(e)) => warn!(error = %e, "could not list referenced cache files"),
        }

        match self.store.delete_orphan_blobs().await {
            Ok(count) => removed += count as usize,
            Err(e) => warn!(error = %e, "orphan blob sweep failed"),
        }
        removed
    }

    /// Record the cleanup time, then drop expired entries past the grace
    /// period and finally orphaned bodies.
    pub async fn cleanup(&self) {
        if let Err(e) = self.store.set_option_time(LAST_CLEANUP_OPTION, Utc::now()).await {
            warn!(error = %e, "could not record cleanup time");
        }
        let expired = self.sweep_expired(self.options.grace_period_secs).await;
        let orphans = self.sweep_orphans().await;
        info!(expired, orphans, "cache cleanup finished");
    }
}

fn same_validator(stored: Option<&str>, other: Option<&str>) -> bool {
    let norm = |v: Option<&str>| v.map(|v| v.trim().to_lowercase()).unwrap_or_default();
    norm(stored) == norm(other)
}

/// True when the request carries a conditional header and every validator
/// stored on the entry is matched by the corresponding request header.
fn validators_match(entry: &CacheEntry, request: &Headers) -> bool {
    let since = request.get("If-Modified-Since");
    let none_match = request.get("If-None-Match");
    if since.is_none() && none_match.is_none() {
        return false;
    }
    let matches = |stored: Option<&str>, sent: Option<&str>| match stored {
        None => true,
        Some(stored) => sent.is_some_and(|sent| same_validator(Some(stored), Some(sent))),
    };
    matches(entry.last_modified.as_deref(), since) && matches(entry.etag.as_deref(), none_match)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryDataStore;
    use tempfile::tempdir;

    fn cache_in(dir: &std::path::Path) -> Cache {
        let options = CacheOptionsBuilder::default()
            .data_dir(dir.join("cachedata"))
            .build()
            .unwrap();
        Cache::new(Arc::new(InMemoryDataStore::new()), options)
    }

    fn ok(body: &str, etag: Option<&str>) -> HttpResponse {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/css");
        if let Some(etag) = etag {
            headers.append("ETag", etag);
        }
        HttpResponse::from_parts(200, headers, body)
    }

    #[test]
    fn test_options_builder_defaults() {
        let options = CacheOptionsBuilder::default().build().unwrap();
        assert!(options.enabled);
        assert_eq!(options.default_timeout_secs, 14_400);
        assert_eq!(options.grace_period_secs, 604_800);
        assert_eq!(options.cleanup_every_hours, 72);
    }

    #[test]
    fn test_validators_match_rules() {
        let entry = CacheEntry {
            id: "1".to_string(),
            url: "/a".to_string(),
            timestamp: Utc::now(),
            timeout_seconds: 10,
            content_type: None,
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            etag: Some("\"ABC\"".to_string()),
            content_length: None,
            body: BodyRef::File("f".to_string()),
            cache_type: None,
        };

        let mut both = Headers::new();
        both.append("if-none-match", " \"abc\" ");
        both.append("If-Modified-Since", "mon, 01 jan 2024 00:00:00 gmt");
        assert!(validators_match(&entry, &both));

        let mut etag_only = Headers::new();
        etag_only.append("If-None-Match", "\"abc\"");
        assert!(!validators_match(&entry, &etag_only));

        assert!(!validators_match(&entry, &Headers::new()));
    }

    #[tokio::test]
    async fn test_put_requires_cacheable_status() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());

        let not_found = HttpResponse::from_parts(404, Headers::new(), "nope");
        assert!(!cache.put("/content/a", &not_found, 60, None).await);
        let not_modified = HttpResponse::from_parts(304, Headers::new(), "");
        assert!(!cache.put("/content/a", &not_modified, 60, None).await);
        assert!(!cache.put("   ", &ok("x", None), 60, None).await);
        assert!(cache.lookup("/content/a").await.is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_cached_responses() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(cache.put("/content/a", &ok("a", None), 60, None).await);

        let hit = cache.get("/content/a", None, false).await.unwrap();
        assert!(hit.cache.from_cache);
        assert!(!cache.put("/content/b", &hit, 60, None).await);
    }

    #[tokio::test]
    async fn test_zero_timeout_uses_default() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(cache.put("/content/a", &ok("a", None), 0, Some(" Content ")).await);

        let entry = cache.lookup("/CONTENT/A").await.unwrap();
        assert_eq!(entry.timeout_seconds, 14_400);
        assert_eq!(entry.cache_type.as_deref(), Some("content"));
        assert_eq!(entry.content_length, Some(1));
    }

    #[tokio::test]
    async fn test_disabled_cache_misses() {
        let dir = tempdir().unwrap();
        let options = CacheOptionsBuilder::default()
            .enabled(false)
            .data_dir(dir.path().to_path_buf())
            .build()
            .unwrap();
        let cache = Cache::new(Arc::new(InMemoryDataStore::new()), options);

        assert!(!cache.put("/content/a", &ok("a", None), 60, None).await);
        assert!(cache.get("/content/a", None, true).await.is_none());
        assert!(!cache.is_fresh("/content/a", true).await);
    }

    #[tokio::test]
    async fn test_init_runs_cleanup_once_per_period() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());

        assert!(cache.init().await);
        assert!(!cache.init().await);

        let stale = Utc::now() - chrono::Duration::hours(73);
        cache.store().set_option_time(LAST_CLEANUP_OPTION, stale).await.unwrap();
        assert!(cache.init().await);
    }

    #[tokio::test]
    async fn test_huge_timeouts_stay_fresh() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());

        assert!(cache.put("/content/forever", &ok("f", None), u64::MAX, None).await);
        assert!(cache.put("/content/far", &ok("g", None), 10_000_000_000_000, None).await);
        assert!(cache.is_fresh("/content/forever", false).await);
        assert!(cache.is_fresh("/content/far", false).await);

        assert_eq!(cache.sweep_expired(0).await, 0);
        assert_eq!(cache.sweep_expired(u64::MAX).await, 0);
        assert!(cache.get("/content/far", None, true).await.is_some());
    }

    #[tokio::test]
    async fn test_init_with_huge_period() {
        let dir = tempdir().unwrap();
        let options = CacheOptionsBuilder::default()
            .data_dir(dir.path().join("cachedata"))
            .cleanup_every_hours(u64::MAX)
            .build()
            .unwrap();
        let cache = Cache::new(Arc::new(InMemoryDataStore::new()), options);

        assert!(cache.init().await);
        assert!(!cache.init().await);
    }
}
