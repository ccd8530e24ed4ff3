//! Configuration management for the ingest service.
//!
//! Loaded from optional configuration files and then environment variables
//! prefixed with `INGEST__` (for example `INGEST__S3__BUCKET`).

use config::{Config, ConfigError, Environment, File};
use roadscan_pipeline::KafkaConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Upload endpoint settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Local image buffer settings
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Object storage settings
    pub s3: S3Config,

    /// Presign stage settings
    #[serde(default)]
    pub presign: PresignConfig,

    /// Kafka connection and topics
    #[serde(default)]
    pub kafka: KafkaConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Upload endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Largest accepted image in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

/// Local image buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Directory uploaded images are written to
    #[serde(default = "default_buffer_dir")]
    pub dir: PathBuf,
}

/// S3 configuration used for presigning uploads.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket images are uploaded to
    pub bucket: String,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Lifetime of an issued upload URL in seconds
    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,

    /// Maximum presign calls in flight
    #[serde(default = "default_presign_concurrency")]
    pub presign_concurrency: usize,
}

/// Presign stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresignConfig {
    /// Run the presign stage in this process
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consumer group for raw capture events
    #[serde(default = "default_presign_group")]
    pub group_id: String,

    /// Worker threads of the presign runtime
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

// Default value functions
fn default_service_name() -> String {
    "roadscan-ingest".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_max_upload_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_buffer_dir() -> PathBuf {
    PathBuf::from("/mnt/image-buffer")
}
fn default_region() -> String {
    "ap-northeast-2".to_string()
}
fn default_presign_expiry_secs() -> u64 {
    600
}
fn default_presign_concurrency() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_presign_group() -> String {
    "presigned-group".to_string()
}
fn default_worker_threads() -> usize {
    4
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            dir: default_buffer_dir(),
        }
    }
}

impl Default for PresignConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group_id: default_presign_group(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/ingest)
    /// 2. Environment-specific config (config/ingest.{env})
    /// 3. System config (/etc/roadscan/ingest)
    /// 4. Environment variables (prefixed with INGEST__)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name(&format!("config/ingest.{}", run_mode)).required(false))
            .add_source(File::with_name("/etc/roadscan/ingest").required(false))
            // INGEST__S3__BUCKET -> s3.bucket
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.s3.presign_expiry_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.presign_expiry_secs".to_string(),
                message: "Expiry must be greater than 0".to_string(),
            });
        }

        if self.s3.presign_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.presign_concurrency".to_string(),
                message: "Concurrency must be at least 1".to_string(),
            });
        }

        if self.presign.worker_threads == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "presign.worker_threads".to_string(),
                message: "Worker threads must be at least 1".to_string(),
            });
        }

        if self.http.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "http.max_upload_bytes".to_string(),
                message: "Upload limit must be greater than 0".to_string(),
            });
        }

        self.listen_addr()?;

        self.kafka
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "kafka".to_string(),
                message: e.to_string(),
            })
    }

    /// Socket address the upload endpoint binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigValidationError> {
        format!("{}:{}", self.http.host, self.http.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigValidationError::InvalidValue {
                field: "http.host".to_string(),
                message: e.to_string(),
            })
    }
}

impl S3Config {
    /// Get upload URL lifetime as Duration.
    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> IngestConfig {
        IngestConfig {
            service: ServiceConfig::default(),
            http: HttpConfig::default(),
            buffer: BufferConfig::default(),
            s3: S3Config {
                bucket: "road-images".to_string(),
                region: default_region(),
                endpoint_url: Some("http://minio:9000".to_string()),
                force_path_style: true,
                presign_expiry_secs: 600,
                presign_concurrency: 8,
            },
            presign: PresignConfig::default(),
            kafka: KafkaConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.s3.presign_expiry(), Duration::from_secs(600));
        assert_eq!(config.buffer.dir, PathBuf::from("/mnt/image-buffer"));
    }

    #[test]
    fn test_missing_bucket() {
        let mut config = create_test_config();
        config.s3.bucket = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_zero_worker_threads() {
        let mut config = create_test_config();
        config.presign.worker_threads = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_listen_host() {
        let mut config = create_test_config();
        config.http.host = "not a host".to_string();
        assert!(config.listen_addr().is_err());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: IngestConfig = serde_json::from_value(serde_json::json!({
            "s3": { "bucket": "road-images" }
        }))
        .unwrap();

        assert_eq!(config.presign.group_id, "presigned-group");
        assert_eq!(config.kafka.topics.raw, "raw-topic");
        assert_eq!(config.http.port, 8080);
        assert!(config.presign.enabled);
    }
}
