use crate::flags::CacheBehaviour;
use crate::placeholders::{CONTENT_URL_PLACEHOLDER, replace_url_placeholder};
use derive_builder::Builder;
use shelter_cache::Cache;
use shelter_http::{
    FormFields, Headers, HttpResponse, OriginClient, OriginRequest, PostFiles,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const SITE_ID_HEADER: &str = "X-Client-Site-Id";
pub const VERSION_HEADER: &str = "X-Client-Version";
pub const PUBLIC_ONLY_HEADER: &str = "X-Client-Public-Content-Only";
pub const SOURCE_IP_HEADER: &str = "X-Client-Source-IP";
pub const SOURCE_USER_AGENT_HEADER: &str = "X-Client-Source-UserAgent";

const STANDARD_REQUEST_HEADERS: [&str; 3] = ["Cache-Control", "If-Modified-Since", "If-None-Match"];

/// What the embedding application knows about the request it is serving.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Full url of the inbound request, used for action placeholders.
    pub url: Option<String>,
    pub client_ip: Option<String>,
    /// Inbound headers (`User-Agent`, `Cookie`, conditional headers).
    pub headers: Headers,
    pub post_fields: FormFields,
    pub post_files: PostFiles,
}

impl InboundRequest {
    pub fn has_post_data(&self) -> bool {
        !self.post_fields.is_empty() || !self.post_files.is_empty()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("User-Agent")
    }

    pub fn cookie(&self) -> Option<&str> {
        self.headers.get("Cookie")
    }
}

/// One call of [`Proxy::get_remote_content`].
#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct RemoteRequest {
    /// Path on the origin; must fall under an allowed prefix.
    pub path: String,
    /// Forward inbound post fields and files. A request that forwards post
    /// data is never cached.
    #[builder(default = "true")]
    pub forward_post_data: bool,
    /// Copy `Cache-Control`, `If-Modified-Since` and `If-None-Match` from the
    /// inbound request.
    #[builder(default = "true")]
    pub forward_standard_headers: bool,
    /// `None` disables caching; `Some(0)` uses the cache default timeout.
    #[builder(default = "None")]
    pub cache_seconds: Option<u64>,
    #[builder(default = "3")]
    pub max_redirects: u32,
    #[builder(default = "false")]
    pub forward_cookies: bool,
    /// Ask the origin for content that is safe to show to anyone.
    #[builder(default = "false")]
    pub flag_as_public: bool,
    #[builder(default)]
    pub extra_headers: Headers,
    #[builder(default)]
    pub behaviour: CacheBehaviour,
    /// Prepended to the path to form the cache key, so one path can have
    /// several cached variants.
    #[builder(default = "None")]
    pub cache_prefix: Option<String>,
    #[builder(default = "None")]
    pub cache_type: Option<String>,
}

impl RemoteRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            forward_post_data: true,
            forward_standard_headers: true,
            cache_seconds: None,
            max_redirects: 3,
            forward_cookies: false,
            flag_as_public: false,
            extra_headers: Headers::new(),
            behaviour: CacheBehaviour::DEFAULT,
            cache_prefix: None,
            cache_type: None,
        }
    }
}

#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct ProxyOptions {
    #[builder(default = "vec![\"/content\".to_string(), \"/plugin\".to_string()]")]
    pub allowed_prefixes: Vec<String>,
    #[builder(default = "false")]
    pub use_tls: bool,
    #[builder(default = "env!(\"CARGO_PKG_VERSION\").to_string()")]
    pub version: String,
    #[builder(default = "None")]
    pub site_id: Option<String>,
    /// Target of content-url placeholders rewritten before caching.
    #[builder(default = "\"/shelter/content\".to_string()")]
    pub content_endpoint: String,
}

/// Fetches origin content through the cache.
///
/// Absence of usable content is `None`; no error escapes this boundary.
pub struct Proxy {
    origin: Arc<dyn OriginClient>,
    cache: Arc<Cache>,
    options: ProxyOptions,
}

impl Proxy {
    pub fn new(origin: Arc<dyn OriginClient>, cache: Arc<Cache>, options: ProxyOptions) -> Self {
        Self {
            origin,
            cache,
            options,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Origin path of a plugin controller action: `"x"` and `"/x"` both map
    /// to `/plugin/x`.
    pub fn action_url(controller_action: &str) -> String {
        if controller_action.starts_with('/') {
            format!("/plugin{controller_action}")
        } else {
            format!("/plugin/{controller_action}")
        }
    }

    /// Leading slash enforced, then checked against the allowed prefixes.
    fn checked_path(&self, path: &str) -> Option<String> {
        if path.is_empty() {
            return None;
        }
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let lower = path.to_lowercase();
        self.options
            .allowed_prefixes
            .iter()
            .any(|prefix| lower.starts_with(&prefix.to_lowercase()))
            .then_some(path)
    }

    fn build_headers(&self, request: &RemoteRequest, inbound: &InboundRequest) -> Headers {
        let mut headers = request.extra_headers.clone();
        headers.set("User-Agent", format!("shelter/{}", self.options.version));
        headers.set(
            SITE_ID_HEADER,
            self.options.site_id.as_deref().unwrap_or("none"),
        );
        headers.set(VERSION_HEADER, self.options.version.as_str());

        if request.forward_cookies {
            if let Some(cookie) = inbound.cookie() {
                headers.set("Cookie", cookie);
            }
        }
        if request.flag_as_public {
            headers.set(PUBLIC_ONLY_HEADER, "true");
        }
        if request.forward_standard_headers {
            for name in STANDARD_REQUEST_HEADERS {
                if let Some(value) = inbound.headers.get(name) {
                    headers.insert_if_absent(name, value);
                }
            }
        }
        if let Some(ip) = &inbound.client_ip {
            headers.set(SOURCE_IP_HEADER, ip.as_str());
        }
        if let Some(ua) = inbound.user_agent() {
            headers.set(SOURCE_USER_AGENT_HEADER, ua);
        }
        headers
    }

    async fn call_origin(&self, request: OriginRequest) -> Option<HttpResponse> {
        match self.origin.make_request(request).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(error = %e, code = e.code(), "origin call failed");
                None
            }
        }
    }

    /// Fetch `request.path` from the origin, through the cache when
    /// `cache_seconds` is set and no post data is forwarded.
    #[instrument(skip_all, fields(path = %request.path, behaviour = ?request.behaviour))]
    pub async fn get_remote_content(
        &self,
        request: &RemoteRequest,
        inbound: &InboundRequest,
    ) -> Option<HttpResponse> {
        let Some(path) = self.checked_path(&request.path) else {
            info!(path = %request.path, "refusing path outside allowed prefixes");
            return None;
        };
        let headers = self.build_headers(request, inbound);
        let origin_request = OriginRequest::get(path.as_str())
            .with_tls(self.options.use_tls)
            .with_redirects(request.max_redirects);

        if request.forward_post_data && inbound.has_post_data() {
            let origin_request = origin_request
                .with_post(inbound.post_fields.clone(), inbound.post_files.clone())
                .with_headers(headers);
            return self.call_origin(origin_request).await;
        }

        let Some(cache_seconds) = request.cache_seconds else {
            return self.call_origin(origin_request.with_headers(headers)).await;
        };

        let flags = request.behaviour;
        let cache_url = match &request.cache_prefix {
            Some(prefix) => format!("{prefix}{path}"),
            None => path.clone(),
        };

        let cached = self
            .cache
            .get(&cache_url, Some(&headers), true)
            .await
            .filter(|c| !(flags.contains(CacheBehaviour::DO_NOT_CACHE_HTML) && c.is_html()));

        let needs_origin = match &cached {
            None => true,
            Some(c) => c.cache.timed_out && !flags.contains(CacheBehaviour::IGNORE_CACHE_TIMEOUT),
        };
        if !needs_origin {
            debug!(%cache_url, "serving from cache");
            return cached;
        }

        let mut renew_headers = headers.clone();
        if let Some(c) = &cached {
            renew_headers.merge(&c.cache.renew_headers);
        }

        let fetched = if flags.contains(CacheBehaviour::DO_NOT_MAKE_REQUEST_TO_SERVER) {
            None
        } else {
            self.call_origin(origin_request.with_headers(renew_headers))
                .await
        };

        let fallback = |reason: &str| {
            if flags.contains(CacheBehaviour::USE_TIMED_OUT_CACHE_AS_FALLBACK) {
                if let Some(c) = &cached {
                    info!(%cache_url, reason, "serving timed-out cache copy");
                    return Some(c.clone());
                }
            }
            None
        };

        let Some(mut response) = fetched else {
            return fallback("no origin response");
        };

        match response.status() {
            200 | 304 => {
                if flags.contains(CacheBehaviour::DO_NOT_CACHE_HTML) && response.is_html() {
                    return Some(response);
                }
                if flags.contains(CacheBehaviour::REWRITE_PLACEHOLDERS_BEFORE_CACHING) {
                    if let Some(text) = response.body_text() {
                        let rewritten = replace_url_placeholder(
                            text,
                            CONTENT_URL_PLACEHOLDER,
                            &self.options.content_endpoint,
                        );
                        response.set_body(rewritten);
                    }
                }

                let stored = self
                    .cache
                    .put(&cache_url, &response, cache_seconds, request.cache_type.as_deref())
                    .await;
                debug!(%cache_url, stored, status = response.status(), "origin response cached");

                let revalidated = cached
                    .as_ref()
                    .is_some_and(|c| !c.cache.renew_headers.is_empty());
                if revalidated {
                    if let Some(fresh) = self.cache.get(&cache_url, Some(&headers), true).await {
                        return Some(fresh);
                    }
                }
                Some(response)
            }
            301 | 302 => Some(response),
            status => {
                warn!(%cache_url, status, "unexpected origin status");
                fallback("unexpected origin status")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shelter_cache::{CacheOptionsBuilder, InMemoryDataStore};
    use shelter_http::OriginError;

    struct Unreachable;

    #[async_trait]
    impl OriginClient for Unreachable {
        async fn make_request(&self, _request: OriginRequest) -> Result<HttpResponse, OriginError> {
            Err(OriginError::EmptyResponse)
        }
    }

    fn proxy() -> Proxy {
        let options = CacheOptionsBuilder::default()
            .data_dir(std::env::temp_dir().join("shelter-proxy-unit"))
            .build()
            .unwrap();
        let cache = Arc::new(Cache::new(Arc::new(InMemoryDataStore::new()), options));
        let options = ProxyOptionsBuilder::default()
            .version("1.2.3")
            .site_id(Some("site-7".to_string()))
            .build()
            .unwrap();
        Proxy::new(Arc::new(Unreachable), cache, options)
    }

    #[test]
    fn test_action_url() {
        assert_eq!(Proxy::action_url("adserver/zone?zoneId=3"), "/plugin/adserver/zone?zoneId=3");
        assert_eq!(Proxy::action_url("/settings"), "/plugin/settings");
        assert_eq!(Proxy::action_url(""), "/plugin/");
    }

    #[test]
    fn test_checked_path() {
        let proxy = proxy();
        assert_eq!(proxy.checked_path("Content/x.css"), Some("/Content/x.css".to_string()));
        assert_eq!(proxy.checked_path("/PLUGIN/zone"), Some("/PLUGIN/zone".to_string()));
        assert_eq!(proxy.checked_path("/admin"), None);
        assert_eq!(proxy.checked_path(""), None);
    }

    #[test]
    fn test_identifying_headers() {
        let proxy = proxy();
        let mut inbound = InboundRequest {
            client_ip: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        inbound.headers.append("User-Agent", "Browser/1");
        inbound.headers.append("Cookie", "a=1");
        inbound.headers.append("If-None-Match", "\"inbound\"");
        inbound.headers.append("Cache-Control", "no-cache");

        let mut request = RemoteRequest::get("/content/x");
        request.forward_cookies = true;
        request.flag_as_public = true;
        request.extra_headers.append("If-None-Match", "\"explicit\"");

        let headers = proxy.build_headers(&request, &inbound);
        assert_eq!(headers.get("User-Agent"), Some("shelter/1.2.3"));
        assert_eq!(headers.get(SITE_ID_HEADER), Some("site-7"));
        assert_eq!(headers.get(VERSION_HEADER), Some("1.2.3"));
        assert_eq!(headers.get("Cookie"), Some("a=1"));
        assert_eq!(headers.get(PUBLIC_ONLY_HEADER), Some("true"));
        assert_eq!(headers.get("If-None-Match"), Some("\"explicit\""));
        assert_eq!(headers.get("Cache-Control"), Some("no-cache"));
        assert_eq!(headers.get(SOURCE_IP_HEADER), Some("10.0.0.1"));
        assert_eq!(headers.get(SOURCE_USER_AGENT_HEADER), Some("Browser/1"));

        request.forward_cookies = false;
        request.forward_standard_headers = false;
        let headers = proxy.build_headers(&request, &InboundRequest::default());
        assert!(!headers.contains("Cookie"));
        assert!(!headers.contains("Cache-Control"));
        assert!(!headers.contains(SOURCE_IP_HEADER));
    }

    #[tokio::test]
    async fn test_rejected_path_returns_none() {
        let proxy = proxy();
        let request = RemoteRequest::get("/wp-admin/secret");
        assert!(proxy.get_remote_content(&request, &InboundRequest::default()).await.is_none());
    }
}
