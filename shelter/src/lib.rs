//! # shelter
//!
//! A caching proxy that sits between web pages and a third-party content
//! origin so that pages never block on the origin's availability.
//!
//! - [`Proxy`] fetches content, deciding per request whether a cached copy
//!   is good enough, revalidating with conditional headers and falling back
//!   to stale copies when the origin fails ([`CacheBehaviour`]).
//! - [`Rewriter`] replaces the placeholder tokens the origin embeds in
//!   bodies, linking straight to cached files where possible.
//! - [`ZoneFeed`] serves ad zones as several cached permutations.
//! - [`ShelterContext`] wires all of it from an [`config::AppConfig`].
//!
//! The member crates are re-exported as [`cache`], [`config`] and [`http`].
mod context;
mod flags;
mod logging;
pub mod placeholders;
mod proxy;
mod zones;

pub use context::{ShelterContext, ShelterError};
pub use flags::CacheBehaviour;
pub use logging::init_tracing;
pub use placeholders::{Rewriter, RewriterOptions, RewriterOptionsBuilder};
pub use proxy::{
    InboundRequest, PUBLIC_ONLY_HEADER, Proxy, ProxyOptions, ProxyOptionsBuilder,
    RemoteRequest, RemoteRequestBuilder, SITE_ID_HEADER, SOURCE_IP_HEADER,
    SOURCE_USER_AGENT_HEADER, VERSION_HEADER,
};
pub use zones::{ZONE_CACHE_TYPE, ZoneContent, ZoneFeed};

pub use shelter_cache as cache;
pub use shelter_config as config;
pub use shelter_http as http;

// re-export
pub use async_trait;
pub use tracing;
pub use tracing_subscriber;
