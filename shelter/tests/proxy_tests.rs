mod common;

use common::{StubOrigin, ok};
use shelter::cache::{Cache, CacheOptionsBuilder, DataStore, InMemoryDataStore};
use shelter::http::{FormValue, Headers, HttpResponse, OriginError};
use shelter::placeholders::CONTENT_URL_PLACEHOLDER;
use shelter::{
    CacheBehaviour, InboundRequest, Proxy, ProxyOptionsBuilder, RemoteRequest,
    RemoteRequestBuilder,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    origin: Arc<StubOrigin>,
    store: Arc<InMemoryDataStore>,
    cache: Arc<Cache>,
    proxy: Proxy,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryDataStore::new());
    let options = CacheOptionsBuilder::default()
        .data_dir(dir.path().join("cachedata"))
        .build()
        .unwrap();
    let cache = Arc::new(Cache::new(store.clone(), options));
    let origin = Arc::new(StubOrigin::default());
    let proxy_options = ProxyOptionsBuilder::default()
        .version("2.0")
        .content_endpoint("/serve?action=content")
        .build()
        .unwrap();
    let proxy = Proxy::new(origin.clone(), cache.clone(), proxy_options);
    Harness {
        _dir: dir,
        origin,
        store,
        cache,
        proxy,
    }
}

fn cached_request(path: &str, behaviour: CacheBehaviour) -> RemoteRequest {
    RemoteRequestBuilder::default()
        .path(path)
        .cache_seconds(60)
        .behaviour(behaviour)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_cache_only_request_never_calls_origin() {
    let h = harness();
    let request = cached_request(
        "/content/x.css",
        CacheBehaviour::DO_NOT_MAKE_REQUEST_TO_SERVER,
    );

    let result = h.proxy.get_remote_content(&request, &InboundRequest::default()).await;
    assert!(result.is_none());
    assert_eq!(h.origin.calls(), 0);
}

#[tokio::test]
async fn test_fresh_cache_hit_skips_origin() {
    let h = harness();
    h.origin.reply(Ok(ok("text/css", "a{}", None)));
    let request = cached_request("/content/a.css", CacheBehaviour::DEFAULT);

    let first = h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();
    assert!(!first.cache.from_cache);
    let second = h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();
    assert!(second.cache.from_cache);
    assert_eq!(second.body(), b"a{}");
    assert_eq!(h.origin.calls(), 1);
}

#[tokio::test]
async fn test_stale_entry_revalidates_with_validators() {
    let h = harness();
    h.origin.reply(Ok(ok("text/css", "body v1", Some("\"v1\""))));
    let request = cached_request("/content/r.css", CacheBehaviour::DEFAULT);
    h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();

    let selector = shelter::cache::TypeSelector::Untagged;
    assert_eq!(h.cache.timeout_by_type(&selector).await, 1);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let mut not_modified = Headers::new();
    not_modified.append("ETag", "\"v1\"");
    h.origin.reply(Ok(HttpResponse::from_parts(304, not_modified, "")));

    let result = h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();
    assert_eq!(h.origin.calls(), 2);
    assert_eq!(h.origin.last_request().headers.get("If-None-Match"), Some("\"v1\""));
    assert_eq!(result.status(), 200);
    assert_eq!(result.body(), b"body v1");
    assert!(result.cache.from_cache);
    assert!(!result.cache.timed_out);
}

#[tokio::test]
async fn test_fallback_to_timed_out_copy_on_origin_error() {
    let h = harness();
    h.origin.reply(Ok(ok("text/css", "old", None)));
    let plain = cached_request("/content/f.css", CacheBehaviour::DEFAULT);
    h.proxy.get_remote_content(&plain, &InboundRequest::default()).await.unwrap();
    h.cache.timeout_by_type(&shelter::cache::TypeSelector::Any).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    h.origin.reply(Ok(HttpResponse::from_parts(500, Headers::new(), "boom")));
    assert!(h.proxy.get_remote_content(&plain, &InboundRequest::default()).await.is_none());

    let with_fallback = cached_request(
        "/content/f.css",
        CacheBehaviour::USE_TIMED_OUT_CACHE_AS_FALLBACK,
    );
    h.origin.reply(Err(OriginError::Timeout(120_000)));
    let served = h
        .proxy
        .get_remote_content(&with_fallback, &InboundRequest::default())
        .await
        .unwrap();
    assert_eq!(served.body(), b"old");
    assert!(served.cache.timed_out);

    let ignore = cached_request("/content/f.css", CacheBehaviour::IGNORE_CACHE_TIMEOUT);
    let calls = h.origin.calls();
    let served = h.proxy.get_remote_content(&ignore, &InboundRequest::default()).await.unwrap();
    assert_eq!(served.body(), b"old");
    assert_eq!(h.origin.calls(), calls);
}

#[tokio::test]
async fn test_html_is_not_cached_when_excluded() {
    let h = harness();
    h.origin.reply(Ok(ok("text/html; charset=utf-8", "<p>hi</p>", None)));
    let request = cached_request("/plugin/page", CacheBehaviour::DO_NOT_CACHE_HTML);

    let result = h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();
    assert_eq!(result.body(), b"<p>hi</p>");
    assert!(h.store.all_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redirects_pass_through_uncached() {
    let h = harness();
    let mut headers = Headers::new();
    headers.append("Location", "/content/elsewhere");
    h.origin.reply(Ok(HttpResponse::from_parts(302, headers, "")));
    let request = cached_request("/content/moved", CacheBehaviour::DEFAULT);

    let result = h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();
    assert_eq!(result.status(), 302);
    assert_eq!(result.location(), Some("/content/elsewhere"));
    assert!(h.store.all_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_post_data_goes_straight_to_origin() {
    let h = harness();
    h.origin.reply(Ok(ok("text/plain", "posted", None)));
    h.origin.reply(Ok(ok("text/plain", "posted again", None)));
    let inbound = InboundRequest {
        post_fields: vec![("name".to_string(), FormValue::from("value"))],
        ..Default::default()
    };
    let request = cached_request("/plugin/form", CacheBehaviour::DEFAULT);

    let first = h.proxy.get_remote_content(&request, &inbound).await.unwrap();
    let second = h.proxy.get_remote_content(&request, &inbound).await.unwrap();
    assert_eq!(first.body(), b"posted");
    assert_eq!(second.body(), b"posted again");
    assert_eq!(h.origin.calls(), 2);
    assert!(h.origin.last_request().is_post());
    assert!(h.store.all_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cache_prefix_and_type() {
    let h = harness();
    h.origin.reply(Ok(ok("text/plain", "one", None)));
    let request = RemoteRequest {
        cache_prefix: Some("variant-1://".to_string()),
        cache_type: Some("Zone".to_string()),
        ..cached_request("plugin/feed", CacheBehaviour::DEFAULT)
    };
    h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();

    assert_eq!(h.origin.last_request().path, "/plugin/feed");
    let entry = h.cache.lookup("variant-1:///plugin/feed").await.unwrap();
    assert_eq!(entry.cache_type.as_deref(), Some("zone"));
    assert!(h.cache.lookup("/plugin/feed").await.is_none());
}

#[tokio::test]
async fn test_placeholders_rewritten_before_caching() {
    let h = harness();
    let body = format!("url({CONTENT_URL_PLACEHOLDER}?serverurl=/content/bg.png)");
    h.origin.reply(Ok(ok("text/css", &body, None)));
    let request = cached_request(
        "/content/site.css",
        CacheBehaviour::REWRITE_PLACEHOLDERS_BEFORE_CACHING,
    );

    let result = h.proxy.get_remote_content(&request, &InboundRequest::default()).await.unwrap();
    assert_eq!(result.body_text(), Some("url(/serve?action=content&serverurl=/content/bg.png)"));
    let cached = h.cache.get("/content/site.css", None, false).await.unwrap();
    assert_eq!(cached.body(), result.body());
}

#[tokio::test]
async fn test_uncached_request_forwards_headers() {
    let h = harness();
    h.origin.reply(Ok(ok("text/plain", "direct", None)));
    let mut inbound = InboundRequest {
        client_ip: Some("192.0.2.4".to_string()),
        ..Default::default()
    };
    inbound.headers.append("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT");

    let request = RemoteRequest::get("/content/direct");
    let result = h.proxy.get_remote_content(&request, &inbound).await.unwrap();
    assert_eq!(result.body(), b"direct");

    let sent = h.origin.last_request();
    assert_eq!(sent.headers.get("User-Agent"), Some("shelter/2.0"));
    assert_eq!(sent.headers.get(shelter::SITE_ID_HEADER), Some("none"));
    assert_eq!(sent.headers.get(shelter::SOURCE_IP_HEADER), Some("192.0.2.4"));
    assert_eq!(
        sent.headers.get("If-Modified-Since"),
        Some("Mon, 01 Jan 2024 00:00:00 GMT")
    );
    assert!(h.store.all_entries().await.unwrap().is_empty());
}
