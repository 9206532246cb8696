use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub type EntryId = String;
pub type BlobId = String;

/// Where the body of a cache entry lives. Exactly one location per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum BodyRef {
    /// File name relative to the cache data directory.
    File(String),
    /// Id of a chunked blob in the data store.
    Blob(BlobId),
}

impl BodyRef {
    pub fn filename(&self) -> Option<&str> {
        match self {
            BodyRef::File(name) => Some(name),
            BodyRef::Blob(_) => None,
        }
    }

    pub fn blob_id(&self) -> Option<&str> {
        match self {
            BodyRef::File(_) => None,
            BodyRef::Blob(id) => Some(id),
        }
    }
}

/// Metadata for one locally stored copy of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: EntryId,
    /// Normalised (trimmed, lowercased) key, possibly prefixed.
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub body: BodyRef,
    pub cache_type: Option<String>,
}

impl CacheEntry {
    /// Saturates at the latest representable instant for huge timeouts.
    pub fn timeout_at(&self) -> DateTime<Utc> {
        add_seconds(self.timestamp, self.timeout_seconds)
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        now > self.timeout_at()
    }

    /// Whole seconds elapsed since the entry timed out, zero while fresh.
    pub fn seconds_since_timeout(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from(now.signed_duration_since(self.timeout_at()).num_seconds()).unwrap_or(0)
    }

    /// True once the entry is past its timeout plus `grace_seconds`.
    pub fn is_expired(&self, now: DateTime<Utc>, grace_seconds: u64) -> bool {
        now > add_seconds(self.timeout_at(), grace_seconds)
    }

    pub fn matches(&self, selector: &TypeSelector) -> bool {
        match selector {
            TypeSelector::Any => true,
            TypeSelector::Untagged => self.cache_type.is_none(),
            TypeSelector::Tagged(tag) => self.cache_type.as_deref() == Some(tag.as_str()),
        }
    }
}

/// `seconds` as a [`TimeDelta`], clamped to the largest delta chrono can hold.
pub fn seconds_delta(seconds: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(seconds).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

/// `at + seconds`, saturating at [`DateTime::<Utc>::MAX_UTC`].
pub fn add_seconds(at: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    at.checked_add_signed(seconds_delta(seconds)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - seconds`, saturating at [`DateTime::<Utc>::MIN_UTC`].
pub fn sub_seconds(at: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    at.checked_sub_signed(seconds_delta(seconds)).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A cache entry before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCacheEntry {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub body: BodyRef,
    pub cache_type: Option<String>,
}

impl NewCacheEntry {
    pub fn with_id(self, id: EntryId) -> CacheEntry {
        CacheEntry {
            id,
            url: self.url,
            timestamp: self.timestamp,
            timeout_seconds: self.timeout_seconds,
            content_type: self.content_type,
            last_modified: self.last_modified,
            etag: self.etag,
            content_length: self.content_length,
            body: self.body,
            cache_type: self.cache_type,
        }
    }
}

/// Selects entries by cache type tag.
///
/// `Untagged` and `Any` are distinct: the first matches only entries stored
/// without a tag, the second matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSelector {
    Any,
    Untagged,
    Tagged(String),
}

impl TypeSelector {
    /// `None` selects untagged entries. The tag is trimmed and lowercased;
    /// a blank tag yields `None`.
    pub fn from_tag(tag: Option<&str>) -> Option<Self> {
        match tag {
            None => Some(TypeSelector::Untagged),
            Some(tag) => normalize_type(tag).map(TypeSelector::Tagged),
        }
    }
}

/// Trim and lowercase a cache type tag, `None` when blank.
pub fn normalize_type(tag: &str) -> Option<String> {
    let tag = tag.trim().to_lowercase();
    (!tag.is_empty()).then_some(tag)
}

/// Trim and lowercase a cache key, `None` when blank.
pub fn normalize_url(url: &str) -> Option<String> {
    let url = url.trim().to_lowercase();
    (!url.is_empty()).then_some(url)
}

/// An ad zone known to the embedding site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub server_zone_id: u32,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(timeout_seconds: u64, age_seconds: i64, cache_type: Option<&str>) -> CacheEntry {
        CacheEntry {
            id: "1".to_string(),
            url: "/content/a".to_string(),
            timestamp: Utc::now() - TimeDelta::seconds(age_seconds),
            timeout_seconds,
            content_type: None,
            last_modified: None,
            etag: None,
            content_length: Some(0),
            body: BodyRef::File("f".to_string()),
            cache_type: cache_type.map(str::to_string),
        }
    }

    #[test]
    fn test_timeout_and_grace() {
        let now = Utc::now();
        let fresh = entry(100, 10, None);
        assert!(!fresh.is_timed_out(now));
        assert_eq!(fresh.seconds_since_timeout(now), 0);

        let stale = entry(100, 150, None);
        assert!(stale.is_timed_out(now));
        assert!(stale.seconds_since_timeout(now) >= 49);
        assert!(!stale.is_expired(now, 100));
        assert!(stale.is_expired(now, 10));
    }

    #[test]
    fn test_huge_timeouts_saturate() {
        let now = Utc::now();
        let forever = entry(u64::MAX, 0, None);
        assert_eq!(forever.timeout_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!forever.is_timed_out(now));
        assert!(!forever.is_expired(now, u64::MAX));
        assert_eq!(forever.seconds_since_timeout(now), 0);

        let far = entry(10_000_000_000_000, 0, None);
        assert!(!far.is_timed_out(now));
        assert!(!far.is_expired(now, 10_000_000_000_000));

        assert_eq!(sub_seconds(now, u64::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(add_seconds(now, 60), now + TimeDelta::seconds(60));
    }

    #[test]
    fn test_selector_matching() {
        let untagged = entry(1, 0, None);
        let zone = entry(1, 0, Some("zone"));

        assert!(untagged.matches(&TypeSelector::Any));
        assert!(untagged.matches(&TypeSelector::Untagged));
        assert!(!untagged.matches(&TypeSelector::Tagged("zone".to_string())));
        assert!(zone.matches(&TypeSelector::Tagged("zone".to_string())));
        assert!(!zone.matches(&TypeSelector::Untagged));
    }

    #[test]
    fn test_normalisation() {
        assert_eq!(
            TypeSelector::from_tag(Some("  Zone ")),
            Some(TypeSelector::Tagged("zone".to_string()))
        );
        assert_eq!(TypeSelector::from_tag(None), Some(TypeSelector::Untagged));
        assert_eq!(TypeSelector::from_tag(Some("  ")), None);
        assert_eq!(normalize_url(" /Content/A.PNG "), Some("/content/a.png".to_string()));
        assert_eq!(normalize_url("   "), None);
    }
}
