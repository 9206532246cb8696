use crate::flags::CacheBehaviour;
use crate::placeholders::{Rewriter, RewriterOptions};
use crate::proxy::{InboundRequest, Proxy, ProxyOptions, RemoteRequest};
use crate::zones::ZoneFeed;
use shelter_cache::{Cache, CacheOptions, DataStore, InMemoryDataStore};
use shelter_config::http::{HttpClientParams, build_http_client};
use shelter_config::{AppConfig, ConfigError, Configurable, Settings, TransportKind};
use shelter_http::{HttpOrigin, HttpResponse, OriginClient, RawTransport, ReqwestTransport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ShelterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Everything a request handler needs, built once at startup and shared.
pub struct ShelterContext {
    config: AppConfig,
    store: Arc<dyn DataStore>,
    cache: Arc<Cache>,
    proxy: Arc<Proxy>,
    rewriter: Arc<Rewriter>,
    zones: ZoneFeed,
}

impl Configurable for ShelterContext {
    fn config(&self) -> &serde_yaml::Value {
        self.config.config()
    }
}

impl ShelterContext {
    /// In-memory store and the origin transport named in the configuration.
    pub fn new(config: AppConfig) -> Result<Self, ShelterError> {
        let store = Arc::new(InMemoryDataStore::with_part_size(
            config.settings.cache.blob_part_size,
        ));
        Self::with_store(config, store)
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn DataStore>) -> Result<Self, ShelterError> {
        let origin = build_origin(&config.settings)?;
        Ok(Self::with_parts(config, store, origin))
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn DataStore>,
        origin: Arc<dyn OriginClient>,
    ) -> Self {
        let settings = &config.settings;
        let cache = Arc::new(Cache::new(store.clone(), cache_options(settings)));

        let proxy_options = ProxyOptions {
            allowed_prefixes: settings.origin.allowed_prefixes.clone(),
            use_tls: settings.origin.use_tls,
            version: settings.client.version.clone(),
            site_id: settings.client.site_id.clone(),
            content_endpoint: settings.client.content_endpoint.clone(),
        };
        let proxy = Arc::new(Proxy::new(origin, cache.clone(), proxy_options));

        let rewriter_options = RewriterOptions {
            content_endpoint: settings.client.content_endpoint.clone(),
            public_base_url: settings.cache.public_base_url.clone(),
            site_url: settings.client.site_url.clone(),
            page_id: settings.client.page_id.clone(),
            page_url: settings.client.page_url.clone(),
        };
        let rewriter = Arc::new(Rewriter::new(cache.clone(), rewriter_options));

        let zones = ZoneFeed::new(
            proxy.clone(),
            rewriter.clone(),
            settings.zones.cache_timeout_secs,
            settings.zones.copies,
        );

        Self {
            config,
            store,
            cache,
            proxy,
            rewriter,
            zones,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn rewriter(&self) -> &Arc<Rewriter> {
        &self.rewriter
    }

    pub fn zones(&self) -> &ZoneFeed {
        &self.zones
    }

    /// Startup hook: runs a cache cleanup when one is due.
    pub async fn init(&self) {
        if self.cache.init().await {
            info!("cache cleanup ran at startup");
        }
    }

    /// Proxy a content request for the presentation layer.
    ///
    /// Html is never cached, a timed-out copy is served when the origin
    /// fails, and a 200 response has all placeholders replaced.
    pub async fn serve_content(
        &self,
        path: &str,
        inbound: &InboundRequest,
        cache_seconds: Option<u64>,
    ) -> Option<HttpResponse> {
        let request = RemoteRequest {
            cache_seconds,
            max_redirects: 0,
            forward_cookies: true,
            flag_as_public: true,
            behaviour: CacheBehaviour::DO_NOT_CACHE_HTML
                | CacheBehaviour::USE_TIMED_OUT_CACHE_AS_FALLBACK
                | CacheBehaviour::REWRITE_PLACEHOLDERS_BEFORE_CACHING,
            cache_type: Some("content".to_string()),
            ..RemoteRequest::get(path)
        };
        let mut response = self.proxy.get_remote_content(&request, inbound).await?;
        if response.status() == 200 {
            self.rewriter.replace_all(&mut response, None, inbound).await;
        }
        Some(response)
    }
}

fn cache_options(settings: &Settings) -> CacheOptions {
    CacheOptions {
        enabled: settings.cache.enabled,
        data_dir: settings.cache.data_dir.clone(),
        disable_file_write: settings.cache.disable_file_write,
        default_timeout_secs: settings.cache.default_timeout_secs,
        cleanup_every_hours: settings.cache.cleanup_every_hours,
        grace_period_secs: settings.cache.grace_period_secs,
    }
}

fn build_origin(settings: &Settings) -> Result<Arc<dyn OriginClient>, ShelterError> {
    let origin = &settings.origin;
    let timeout = Duration::from_secs(origin.timeout_secs);
    Ok(match origin.transport {
        TransportKind::Reqwest => {
            let user_agent = format!("shelter/{}", settings.client.version);
            let client = build_http_client(HttpClientParams::from_settings(origin, user_agent))?;
            let transport = ReqwestTransport::new(client, origin.host.clone(), timeout)
                .underscore_to_period(origin.underscore_to_period);
            Arc::new(HttpOrigin::new(transport))
        }
        TransportKind::Raw => {
            let transport = RawTransport::new(origin.host.clone(), timeout)
                .debug_proxy(origin.debug_proxy.clone())
                .underscore_to_period(origin.underscore_to_period);
            Arc::new(HttpOrigin::new(transport))
        }
    })
}
