bitflags::bitflags! {
    /// Cache behaviour modifiers for [`crate::Proxy::get_remote_content`].
    /// Any combination may be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CacheBehaviour: u8 {
        /// Never write `text/html` responses to the cache, and ignore cached ones.
        const DO_NOT_CACHE_HTML = 1;
        /// Only the cache may answer; the origin is never called.
        const DO_NOT_MAKE_REQUEST_TO_SERVER = 1 << 1;
        /// A timed-out cache entry is served without revalidation.
        const IGNORE_CACHE_TIMEOUT = 1 << 2;
        /// Serve the cached copy, even a timed-out one, when the origin fails.
        const USE_TIMED_OUT_CACHE_AS_FALLBACK = 1 << 3;
        /// Rewrite content-url placeholders before the response is stored.
        const REWRITE_PLACEHOLDERS_BEFORE_CACHING = 1 << 4;
    }
}

impl CacheBehaviour {
    /// No modifiers.
    pub const DEFAULT: Self = Self::empty();
}

impl Default for CacheBehaviour {
    fn default() -> Self {
        Self::DEFAULT
    }
}
