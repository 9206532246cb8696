//! Outbound HTTP client construction for the origin transport.
//!
//! # Example
//! ```no_run
//! use shelter_config::http::{HttpClientParams, build_http_client};
//! use shelter_config::AppConfig;
//!
//! let config = AppConfig::from_yaml_str(r#"
//! origin:
//!     host: origin.example.com
//!     timeout_secs: 30
//!     debug_proxy: http://127.0.0.1:8888
//! "#).unwrap();
//!
//! let params = HttpClientParams::from_settings(&config.settings.origin, "shelter/0.1");
//! let client = build_http_client(params).unwrap();
//! ```
use crate::config::OriginSettings;
use std::time::Duration;

/// Parameters for configuring the origin HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientParams {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl HttpClientParams {
    pub fn from_settings(origin: &OriginSettings, user_agent: impl Into<String>) -> Self {
        Self {
            timeout: Duration::from_secs(origin.timeout_secs),
            connect_timeout: Duration::from_secs(origin.connect_timeout_secs),
            proxy: origin.debug_proxy.clone(),
            user_agent: user_agent.into(),
        }
    }
}

/// Builds a reqwest client with rustls, the configured timeouts and user
/// agent, an optional proxy, and automatic redirects turned off.
pub fn build_http_client(
    params: HttpClientParams,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut client_builder = reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .timeout(params.timeout)
        .connect_timeout(params.connect_timeout)
        .user_agent(params.user_agent)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_uri) = params.proxy {
        client_builder = client_builder.proxy(reqwest::Proxy::all(&proxy_uri)?);
    }

    client_builder.build()
}
