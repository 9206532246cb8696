use async_trait::async_trait;
use shelter::http::{Headers, HttpResponse, OriginClient, OriginError, OriginRequest};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Replays scripted results and records every request it receives.
#[derive(Default)]
pub struct StubOrigin {
    calls: AtomicUsize,
    replies: Mutex<VecDeque<Result<HttpResponse, OriginError>>>,
    seen: Mutex<Vec<OriginRequest>>,
}

impl StubOrigin {
    pub fn reply(&self, reply: Result<HttpResponse, OriginError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> OriginRequest {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl OriginClient for StubOrigin {
    async fn make_request(&self, request: OriginRequest) -> Result<HttpResponse, OriginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(OriginError::EmptyResponse))
    }
}

#[allow(dead_code)]
pub fn ok(content_type: &str, body: &str, etag: Option<&str>) -> HttpResponse {
    let mut headers = Headers::new();
    headers.append("Content-Type", content_type);
    if let Some(etag) = etag {
        headers.append("ETag", etag);
    }
    HttpResponse::from_parts(200, headers, body)
}
