use roadscan_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Storage service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    pub database: DatabaseConfig,
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// trace, debug, info, warn or error; RUST_LOG takes precedence
    pub log_level: String,
    /// json or pretty
    pub log_format: String,
    pub metrics_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "roadscan-storage".to_string(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_port: 9091,
        }
    }
}

/// PostgreSQL pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "DatabaseConfig::default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "DatabaseConfig::default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "DatabaseConfig::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "DatabaseConfig::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Apply bundled migrations at startup
    #[serde(default = "DatabaseConfig::default_run_migrations")]
    pub run_migrations: bool,
}

impl DatabaseConfig {
    fn default_max_connections() -> u32 {
        10
    }

    fn default_min_connections() -> u32 {
        2
    }

    fn default_connect_timeout_secs() -> u64 {
        30
    }

    fn default_idle_timeout_secs() -> u64 {
        600
    }

    fn default_run_migrations() -> bool {
        true
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Reverse geocoding client settings
#[derive(Debug, Clone, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "GeocoderConfig::default_base_url")]
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "GeocoderConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum lookups in flight
    #[serde(default = "GeocoderConfig::default_concurrency")]
    pub concurrency: usize,
}

impl GeocoderConfig {
    fn default_base_url() -> String {
        "https://api.vworld.kr".to_string()
    }

    fn default_timeout_secs() -> u64 {
        10
    }

    fn default_concurrency() -> usize {
        8
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Consumer group for processed capture events
    pub group_id: String,
    /// Prefix joined with the storage key to form a capture's image URL.
    /// Empty stores the bare key.
    pub image_base_url: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            group_id: "processed-group".to_string(),
            image_base_url: String::new(),
        }
    }
}

impl Config {
    /// Load from `config/storage`, `/etc/roadscan/storage`, then `STORAGE__*`
    /// environment variables (`STORAGE__DATABASE__URL` -> `database.url`).
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/roadscan/storage").required(false))
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Check values that deserialization cannot
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let invalid = |message: &str| Err(config::ConfigError::Message(message.to_string()));

        if self.database.url.trim().is_empty() {
            return invalid("database.url must be set");
        }
        if self.database.min_connections > self.database.max_connections {
            return invalid("database.min_connections exceeds database.max_connections");
        }
        if self.geocoder.api_key.trim().is_empty() {
            return invalid("geocoder.api_key must be set");
        }
        if self.geocoder.concurrency == 0 {
            return invalid("geocoder.concurrency must be at least 1");
        }

        self.kafka
            .validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))
    }
}
