use crate::{Headers, ParseError};
use reqwest::StatusCode;

/// Header the origin uses to ask the embedding application to act
/// (clear a cache type, resync zones, ...). May repeat.
pub const NOTIFICATION_HEADER: &str = "X-Client-Notification";
/// Origin-specific content marker, independent of `Content-Type`.
pub const CONTENT_MARKER_HEADER: &str = "X-Client-Content-Type";

/// Cache-state annotations attached by the cache store when a response is
/// rebuilt from a stored entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheAnnotations {
    pub from_cache: bool,
    pub timed_out: bool,
    pub seconds_since_timeout: u64,
    /// Conditional headers (`If-Modified-Since` / `If-None-Match`) to send
    /// upstream when renewing the entry this response was built from.
    pub renew_headers: Headers,
}

/// A single origin notification, `name[;value]*` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub name: String,
    pub values: Vec<String>,
}

impl Notification {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';').map(str::trim);
        let name = parts.next().filter(|n| !n.is_empty())?.to_string();
        let values = parts.map(str::to_string).collect();
        Some(Self { name, values })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    status_line: String,
    headers: Headers,
    body: Vec<u8>,
    content_type: Option<String>,
    content_marker: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    date: Option<String>,
    location: Option<String>,
    set_cookies: Vec<String>,
    notifications: Vec<String>,
    pub cache: CacheAnnotations,
}

impl HttpResponse {
    /// Build a response from already separated parts. The status line is
    /// synthesised as `HTTP/1.1 <code> <reason>`.
    pub fn from_parts(status: u16, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        let status_line = synthesize_status_line(status);
        Self::assemble(status, status_line, headers, body.into())
    }

    /// Parse a raw HTTP response (status line, headers, blank line, body).
    ///
    /// Interim `100 Continue` blocks are skipped: the parser keeps scanning
    /// header blocks until it finds one whose status is not 100.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let mut offset = 0;
        loop {
            let end = find_header_end(&raw[offset..])
                .ok_or(ParseError::NoHeaderTerminator)?
                + offset;
            let block = String::from_utf8_lossy(&raw[offset..end]);
            let mut lines = block.split("\r\n");
            let status_line = lines.next().unwrap_or_default().trim().to_string();
            let status = parse_status_code(&status_line)?;
            offset = end + 4;

            if status == 100 {
                continue;
            }

            let mut headers = Headers::new();
            for line in lines {
                if let Some((name, value)) = line.split_once(':') {
                    headers.append(name.trim(), value.trim());
                }
            }

            return Ok(Self::assemble(
                status,
                status_line,
                headers,
                raw[offset..].to_vec(),
            ));
        }
    }

    fn assemble(
        status: u16,
        status_line: String,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        let mut response = Self {
            status,
            status_line,
            headers,
            body,
            content_type: None,
            content_marker: None,
            etag: None,
            last_modified: None,
            date: None,
            location: None,
            set_cookies: Vec::new(),
            notifications: Vec::new(),
            cache: CacheAnnotations::default(),
        };
        response.process_special_headers();
        response
    }

    // Single-valued headers keep the last occurrence.
    fn process_special_headers(&mut self) {
        for (name, value) in self.headers.iter() {
            match name.to_ascii_lowercase().as_str() {
                "location" => self.location = Some(value.to_string()),
                "set-cookie" => self.set_cookies.push(value.to_string()),
                "content-type" => self.content_type = Some(value.to_lowercase()),
                "last-modified" => self.last_modified = Some(value.to_string()),
                "etag" => self.etag = Some(value.to_string()),
                "date" => self.date = Some(value.to_string()),
                n if n.eq_ignore_ascii_case(CONTENT_MARKER_HEADER) => {
                    self.content_marker = Some(value.to_lowercase())
                }
                n if n.eq_ignore_ascii_case(NOTIFICATION_HEADER) => {
                    self.notifications.push(value.to_lowercase())
                }
                _ => {}
            }
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Lowercased `Content-Type`.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_marker(&self) -> Option<&str> {
        self.content_marker.as_deref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn set_cookies(&self) -> &[String] {
        &self.set_cookies
    }

    /// Notification header values, lowercased, in arrival order.
    pub fn raw_notifications(&self) -> &[String] {
        &self.notifications
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .iter()
            .filter_map(|n| Notification::parse(n))
            .collect()
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("text/html"))
    }

    pub fn is_text(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("text/"))
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302)
    }

    /// Headers a presentation layer copies onto its own outbound response.
    ///
    /// `Content-Type` is left out for `text/html` since the embedding page
    /// already sets it, and `Location` is never copied because it is relative
    /// to the origin rather than to the client.
    pub fn standard_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some(ct) = self.content_type.as_deref().filter(|ct| !ct.contains("text/html")) {
            headers.append("Content-Type", ct);
        }
        if let Some(lm) = &self.last_modified {
            headers.append("Last-Modified", lm.as_str());
        }
        if let Some(etag) = &self.etag {
            headers.append("ETag", etag.as_str());
        }
        if let Some(date) = &self.date {
            headers.append("Date", date.as_str());
        }
        for cookie in &self.set_cookies {
            headers.append("Set-Cookie", cookie.as_str());
        }
        headers
    }

    /// Merge the `name=value` part of every `Set-Cookie` header into an
    /// existing `Cookie` header value.
    ///
    /// Unnamed fragments are kept first, in order. Named cookies follow and a
    /// cookie set by this response replaces one with the same name.
    pub fn merge_set_cookies(&self, cookie: Option<&str>) -> Option<String> {
        if self.set_cookies.is_empty() {
            return cookie.map(str::to_string);
        }

        let existing = cookie.into_iter().flat_map(|c| c.split(';'));
        let incoming = self
            .set_cookies
            .iter()
            .map(|sc| sc.split(';').next().unwrap_or_default());

        let mut unnamed: Vec<String> = Vec::new();
        let mut named: Vec<(String, String)> = Vec::new();
        for fragment in existing.chain(incoming) {
            match fragment.split_once('=') {
                Some((name, value)) => {
                    let (name, value) = (name.trim(), value.trim());
                    match named.iter_mut().find(|(n, _)| n == name) {
                        Some(slot) => slot.1 = value.to_string(),
                        None => named.push((name.to_string(), value.to_string())),
                    }
                }
                None => {
                    let fragment = fragment.trim();
                    if !fragment.is_empty() {
                        unnamed.push(fragment.to_string());
                    }
                }
            }
        }

        let merged: Vec<String> = unnamed
            .into_iter()
            .chain(named.into_iter().map(|(n, v)| format!("{n}={v}")))
            .collect();
        Some(merged.join("; "))
    }
}

fn synthesize_status_line(status: u16) -> String {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default();
    format!("HTTP/1.1 {status} {reason}").trim_end().to_string()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_code(status_line: &str) -> Result<u16, ParseError> {
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ParseError::BadStatusLine(status_line.to_string()))
}
