use crate::{
    HttpResponse, OriginError, OriginRequest, Transport, form::encode_body,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

/// Plain TCP transport speaking HTTP/1.0 and reading until the origin closes
/// the connection. TLS is not available on this path.
#[derive(Debug, Clone)]
pub struct RawTransport {
    host: String,
    timeout: Duration,
    /// `host:port` of an inspecting proxy. When set the request line carries
    /// the absolute url.
    debug_proxy: Option<String>,
    underscore_to_period: bool,
}

impl RawTransport {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
            debug_proxy: None,
            underscore_to_period: true,
        }
    }

    pub fn debug_proxy(mut self, proxy: Option<String>) -> Self {
        self.debug_proxy = proxy;
        self
    }

    pub fn underscore_to_period(mut self, enabled: bool) -> Self {
        self.underscore_to_period = enabled;
        self
    }

    fn connect_target(&self) -> String {
        match &self.debug_proxy {
            Some(proxy) => proxy.clone(),
            None if self.host.contains(':') => self.host.clone(),
            None => format!("{}:80", self.host),
        }
    }

    /// Serialise the request as an HTTP/1.0 packet.
    pub fn build_packet(&self, request: &OriginRequest) -> Vec<u8> {
        let target = if self.debug_proxy.is_some() {
            request.url(&self.host)
        } else if request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };

        let body = request.is_post().then(|| {
            let fields = request.post_fields.clone().unwrap_or_default();
            let files = request.post_files.clone().unwrap_or_default();
            encode_body(&fields, &files, self.underscore_to_period)
        });

        let method = if body.is_some() { "POST" } else { "GET" };
        let mut head = format!("{method} {target} HTTP/1.0\r\nHost: {}\r\n", self.host);
        if let Some(body) = &body {
            head.push_str(&format!(
                "Content-Type: {}\r\nContent-Length: {}\r\n",
                body.content_type,
                body.bytes.len()
            ));
        }
        for (name, value) in request.headers.iter() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");

        let mut packet = head.into_bytes();
        if let Some(body) = body {
            packet.extend_from_slice(&body.bytes);
        }
        packet
    }
}

#[async_trait]
impl Transport for RawTransport {
    async fn execute(&self, request: &OriginRequest) -> Result<HttpResponse, OriginError> {
        if request.use_tls {
            return Err(OriginError::TlsUnsupported);
        }

        let target = self.connect_target();
        let packet = self.build_packet(request);
        debug!(%target, bytes = packet.len(), "raw origin exchange");

        let exchange = async {
            let mut stream = TcpStream::connect(&target)
                .await
                .map_err(|e| OriginError::Connect(e.to_string()))?;
            stream.write_all(&packet).await?;
            stream.flush().await?;
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await?;
            Ok::<_, OriginError>(raw)
        };

        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| OriginError::Timeout(self.timeout.as_millis() as u64))??;

        if raw.is_empty() {
            return Err(OriginError::EmptyResponse);
        }
        Ok(HttpResponse::parse(&raw)?)
    }
}
