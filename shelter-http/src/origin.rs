use crate::{FormFields, Headers, HttpResponse, OriginError, PostFiles};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{debug, instrument, warn};

/// One outbound request against the fixed origin host.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub use_tls: bool,
    /// Path relative to the origin host. A leading `/` is added if missing.
    pub path: String,
    pub post_fields: Option<FormFields>,
    pub post_files: Option<PostFiles>,
    pub max_redirects: u32,
    pub headers: Headers,
}

impl OriginRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            use_tls: false,
            path: path.into(),
            post_fields: None,
            post_files: None,
            max_redirects: 3,
            headers: Headers::new(),
        }
    }

    /// Requests carrying fields or files are sent as POST.
    pub fn is_post(&self) -> bool {
        self.post_fields.is_some() || self.post_files.as_ref().is_some_and(|f| !f.is_empty())
    }

    pub fn with_post(mut self, fields: FormFields, files: PostFiles) -> Self {
        self.post_fields = Some(fields);
        self.post_files = Some(files);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Absolute url of this request on `host`.
    pub fn url(&self, host: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        let slash = if self.path.starts_with('/') { "" } else { "/" };
        format!("{scheme}://{host}{slash}{}", self.path)
    }
}

/// The seam the proxy talks to. Implemented by [`HttpOrigin`] and by test
/// stubs.
#[async_trait]
pub trait OriginClient: Send + Sync {
    async fn make_request(&self, request: OriginRequest) -> Result<HttpResponse, OriginError>;
}

/// A single request/response exchange, without redirect handling.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &OriginRequest) -> Result<HttpResponse, OriginError>;
}

/// Origin client that follows 301/302 redirects itself, up to the request's
/// redirect budget, and remembers the last failure for diagnostics.
///
/// A redirected POST is re-issued with its original body. Cookies set by a
/// redirect response are sent on to the next hop.
pub struct HttpOrigin<T: Transport> {
    transport: T,
    last_error: Mutex<Option<(i32, String)>>,
}

impl<T: Transport> HttpOrigin<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            last_error: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Code and message of the most recent failed request.
    pub fn last_error(&self) -> Option<(i32, String)> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn record_error(&self, error: &OriginError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some((error.code(), error.to_string()));
        }
    }
}

#[async_trait]
impl<T: Transport> OriginClient for HttpOrigin<T> {
    #[instrument(skip_all, fields(path = %request.path, post = request.is_post()))]
    async fn make_request(&self, mut request: OriginRequest) -> Result<HttpResponse, OriginError> {
        loop {
            let response = match self.transport.execute(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, path = %request.path, "origin request failed");
                    self.record_error(&e);
                    return Err(e);
                }
            };

            if request.max_redirects == 0 || !response.is_redirect() {
                return Ok(response);
            }
            let Some(location) = response.location().map(redirect_path) else {
                return Ok(response);
            };

            debug!(from = %request.path, to = %location, "following redirect");
            if let Some(cookie) = response.merge_set_cookies(request.headers.get("Cookie")) {
                request.headers.set("Cookie", cookie);
            }
            request.path = location;
            request.max_redirects -= 1;
        }
    }
}

/// The origin host is fixed, so absolute redirect targets are reduced to
/// their path and query.
fn redirect_path(location: &str) -> String {
    match url::Url::parse(location) {
        Ok(url) => match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        },
        Err(_) => location.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        responses: Mutex<Vec<HttpResponse>>,
        seen: Mutex<Vec<(String, bool)>>,
        cookies: Mutex<Vec<Option<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(mut responses: Vec<HttpResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
                cookies: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, request: &OriginRequest) -> Result<HttpResponse, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((request.path.clone(), request.is_post()));
            self.cookies
                .lock()
                .unwrap()
                .push(request.headers.get("Cookie").map(str::to_string));
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or(OriginError::EmptyResponse)
        }
    }

    fn redirect(to: &str) -> HttpResponse {
        HttpResponse::from_parts(302, vec![("Location", to)].into_iter().collect(), "")
    }

    #[test]
    fn test_url_building() {
        assert_eq!(
            OriginRequest::get("content/a.css").url("origin.test"),
            "http://origin.test/content/a.css"
        );
        assert_eq!(
            OriginRequest::get("/plugin/x").with_tls(true).url("origin.test"),
            "https://origin.test/plugin/x"
        );
    }

    #[test]
    fn test_redirect_path() {
        assert_eq!(redirect_path("/content/b"), "/content/b");
        assert_eq!(redirect_path("http://origin.test/plugin/y?a=1"), "/plugin/y?a=1");
    }

    #[tokio::test]
    async fn test_follows_redirects_and_repeats_post() {
        let transport = ScriptedTransport::new(vec![
            redirect("/plugin/step2"),
            redirect("http://origin.test/plugin/step3"),
            HttpResponse::from_parts(200, Headers::new(), "done"),
        ]);
        let origin = HttpOrigin::new(transport);

        let request = OriginRequest::get("/plugin/step1")
            .with_post(vec![("a".to_string(), "1".into())], Vec::new());
        let response = origin.make_request(request).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"done");
        let seen = origin.transport().seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("/plugin/step1".to_string(), true),
                ("/plugin/step2".to_string(), true),
                ("/plugin/step3".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_redirect_carries_set_cookies() {
        let login = HttpResponse::from_parts(
            302,
            vec![
                ("Location", "/plugin/home"),
                ("Set-Cookie", "session=new; Path=/"),
                ("Set-Cookie", "seen=1"),
            ]
            .into_iter()
            .collect(),
            "",
        );
        let transport = ScriptedTransport::new(vec![
            login,
            HttpResponse::from_parts(200, Headers::new(), "home"),
        ]);
        let origin = HttpOrigin::new(transport);

        let mut headers = Headers::new();
        headers.append("Cookie", "session=old; lang=en");
        let response = origin
            .make_request(OriginRequest::get("/plugin/login").with_headers(headers))
            .await
            .unwrap();

        assert_eq!(response.body(), b"home");
        let cookies = origin.transport().cookies.lock().unwrap().clone();
        assert_eq!(
            cookies,
            vec![
                Some("session=old; lang=en".to_string()),
                Some("session=new; lang=en; seen=1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_redirect_budget_is_respected() {
        let transport = ScriptedTransport::new(vec![redirect("/a"), redirect("/b")]);
        let origin = HttpOrigin::new(transport);

        let response = origin
            .make_request(OriginRequest::get("/start").with_redirects(1))
            .await
            .unwrap();

        assert_eq!(response.status(), 302);
        assert_eq!(response.location(), Some("/b"));
        assert_eq!(origin.transport().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_budget_returns_redirect_as_is() {
        let transport = ScriptedTransport::new(vec![redirect("/a")]);
        let origin = HttpOrigin::new(transport);

        let response = origin
            .make_request(OriginRequest::get("/start").with_redirects(0))
            .await
            .unwrap();
        assert_eq!(response.status(), 302);
        assert_eq!(origin.transport().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let origin = HttpOrigin::new(ScriptedTransport::new(Vec::new()));
        let result = origin.make_request(OriginRequest::get("/x")).await;

        assert!(matches!(result, Err(OriginError::EmptyResponse)));
        assert_eq!(
            origin.last_error(),
            Some((-1, "Did not receive data".to_string()))
        );
    }
}
