pub mod config;
#[cfg(feature = "http")]
pub mod http;

pub use config::{
    AppConfig, CacheSettings, ClientSettings, ConfigError, Configurable,
    LoggingSettings, OriginSettings, Settings, TransportKind, ZoneSettings,
};
