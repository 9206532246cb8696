use crate::{
    HttpResponse, OriginError, OriginRequest, Transport, form::encode_body,
};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

/// Transport backed by a `reqwest::Client`.
///
/// The client must be built with redirects disabled; redirects are followed
/// by [`crate::HttpOrigin`] so that POST bodies are re-sent.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    host: String,
    timeout: Duration,
    underscore_to_period: bool,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            host: host.into(),
            timeout,
            underscore_to_period: true,
        }
    }

    /// Whether `_` in top-level post keys is rewritten to `.` (default on).
    pub fn underscore_to_period(mut self, enabled: bool) -> Self {
        self.underscore_to_period = enabled;
        self
    }

    fn map_error(&self, error: reqwest::Error) -> OriginError {
        if error.is_timeout() {
            OriginError::Timeout(self.timeout.as_millis() as u64)
        } else if error.is_connect() {
            OriginError::Connect(error.to_string())
        } else if error.is_builder() {
            OriginError::InvalidUrl(error.to_string())
        } else {
            OriginError::Transport(error)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &OriginRequest) -> Result<HttpResponse, OriginError> {
        let url = request.url(&self.host);
        let mut builder = if request.is_post() {
            let fields = request.post_fields.clone().unwrap_or_default();
            let files = request.post_files.clone().unwrap_or_default();
            let body = encode_body(&fields, &files, self.underscore_to_period);
            self.client
                .post(&url)
                .header(CONTENT_TYPE, body.content_type)
                .body(body.bytes)
        } else {
            self.client.get(&url)
        };

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        Ok(HttpResponse::from_parts(status, headers, body.to_vec()))
    }
}
