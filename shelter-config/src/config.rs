use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{self, PathBuf},
};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub trait Configurable {
    fn config(&self) -> &serde_yaml::Value;

    // read configuration from yaml config
    fn load_config(
        config_file_path: impl AsRef<path::Path>,
    ) -> Result<serde_yaml::Value, ConfigError> {
        let content: String = fs::read_to_string(config_file_path)?;
        let config: serde_yaml::Value = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Extract Value from config using dot notation i.e. "cache.data_dir"
    fn get_config_value(&self, key: &str) -> Option<&serde_yaml::Value> {
        let keys: Vec<&str> = key.split('.').collect();
        Self::get_value_recursive(self.config(), &keys)
    }

    fn get_value_recursive<'a>(
        config: &'a serde_yaml::Value,
        keys: &[&str],
    ) -> Option<&'a serde_yaml::Value> {
        let (key, remaining_keys) = keys.split_first()?;
        if key.is_empty() {
            return None;
        }

        match config {
            serde_yaml::Value::Mapping(map) => {
                let value = map.get(serde_yaml::Value::String(key.to_string()))?;
                if remaining_keys.is_empty() {
                    Some(value)
                } else {
                    Self::get_value_recursive(value, remaining_keys)
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Reqwest,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginSettings {
    /// `host[:port]` of the origin.
    pub host: String,
    pub use_tls: bool,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_redirects: u32,
    pub transport: TransportKind,
    /// Upstream proxy used to inspect origin traffic during development.
    pub debug_proxy: Option<String>,
    /// Path prefixes the origin serves; anything else is refused.
    pub allowed_prefixes: Vec<String>,
    pub underscore_to_period: bool,
}

impl Default for OriginSettings {
    fn default() -> Self {
        Self {
            host: "www.example.com".to_string(),
            use_tls: false,
            timeout_secs: 120,
            connect_timeout_secs: 30,
            max_redirects: 3,
            transport: TransportKind::Reqwest,
            debug_proxy: None,
            allowed_prefixes: vec!["/content".to_string(), "/plugin".to_string()],
            underscore_to_period: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub data_dir: PathBuf,
    pub disable_file_write: bool,
    pub default_timeout_secs: u64,
    pub cleanup_every_hours: u64,
    pub grace_period_secs: u64,
    pub blob_part_size: usize,
    /// Url under which `data_dir` is served to browsers.
    pub public_base_url: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("cachedata"),
            disable_file_write: false,
            default_timeout_secs: 14_400,
            cleanup_every_hours: 72,
            grace_period_secs: 604_800,
            blob_part_size: 1024,
            public_base_url: "/cachedata".to_string(),
        }
    }
}

/// Identity of the embedding site, sent to the origin and substituted into
/// placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub version: String,
    pub site_id: Option<String>,
    pub site_url: String,
    /// Local endpoint that serves proxied content (`?serverurl=` is appended).
    pub content_endpoint: String,
    pub page_id: Option<String>,
    pub page_url: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            site_id: None,
            site_url: "http://localhost".to_string(),
            content_endpoint: "/shelter/content".to_string(),
            page_id: None,
            page_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneSettings {
    pub cache_timeout_secs: u64,
    /// Number of independently cached copies per zone.
    pub copies: u32,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            cache_timeout_secs: 900,
            copies: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub client: ClientSettings,
    pub zones: ZoneSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn from_value(value: &serde_yaml::Value) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_value(value.clone())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.origin.host.trim().is_empty() {
            return Err(ConfigError::Invalid("origin.host is empty".to_string()));
        }
        if self.cache.blob_part_size == 0 {
            return Err(ConfigError::Invalid(
                "cache.blob_part_size must be positive".to_string(),
            ));
        }
        if self.zones.copies == 0 {
            return Err(ConfigError::Invalid(
                "zones.copies must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Raw YAML document plus the typed settings parsed from it.
#[derive(Debug, Clone)]
pub struct AppConfig {
    raw: serde_yaml::Value,
    pub settings: Settings,
}

impl Configurable for AppConfig {
    fn config(&self) -> &serde_yaml::Value {
        &self.raw
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<path::Path>) -> Result<Self, ConfigError> {
        let raw = Self::load_config(path)?;
        Self::from_value(raw)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: serde_yaml::Value) -> Result<Self, ConfigError> {
        // An empty document means "all defaults".
        let raw = match raw {
            serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
            other => other,
        };
        let settings = Settings::from_value(&raw)?;
        Ok(Self { raw, settings })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            raw: serde_yaml::Value::Mapping(Default::default()),
            settings: Settings::default(),
        }
    }
}
