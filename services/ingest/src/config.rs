use serde::Deserialize;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Main configuration for the ingest service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Request size ceilings
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Photo storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Session store configuration
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Database configuration (required for the postgres session backend)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Size ceilings for multipart intake
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Per-photo ceiling of the streaming endpoint
    #[serde(default = "default_upload_max_photo_bytes")]
    pub upload_max_photo_bytes: usize,
    /// Per-photo ceiling of the buffered endpoint
    #[serde(default = "default_submit_max_photo_bytes")]
    pub submit_max_photo_bytes: usize,
    /// Ceiling for a non-file form field
    #[serde(default = "default_max_field_bytes")]
    pub max_field_bytes: usize,
    /// Allowance for scalar fields and multipart framing on top of four photos
    #[serde(default = "default_form_overhead_bytes")]
    pub form_overhead_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Memory,
}

/// Photo storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Bucket name reported by the memory backend
    #[serde(default = "default_memory_bucket")]
    pub memory_bucket: String,
    /// S3 settings (required for the s3 backend)
    #[serde(default)]
    pub s3: Option<S3Config>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for photo storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Postgres,
    Memory,
}

/// Session store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_backend")]
    pub backend: SessionBackend,
    /// Lifetime of sessions held by the memory backend
    #[serde(default = "default_memory_ttl_secs")]
    pub memory_ttl_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

// Default value functions
fn default_service_name() -> String {
    "bodyscan-ingest".to_string()
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

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_upload_max_photo_bytes() -> usize {
    12 * MIB
}

fn default_submit_max_photo_bytes() -> usize {
    2 * MIB
}

fn default_max_field_bytes() -> usize {
    64 * 1024
}

fn default_form_overhead_bytes() -> usize {
    MIB
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_presigned_url_expiry_secs() -> u64 {
    900
}

fn default_memory_bucket() -> String {
    "bodyscan-local".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_session_backend() -> SessionBackend {
    SessionBackend::Memory
}

fn default_memory_ttl_secs() -> u64 {
    24 * 60 * 60
}

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

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "bodyscan-ingest")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/ingest").required(false))
            .add_source(config::File::with_name("/etc/bodyscan/ingest").required(false))
            // Override with environment variables
            // INGEST__STORAGE__S3__BUCKET -> storage.s3.bucket
            .add_source(
                config::Environment::with_prefix("INGEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every selected backend has its settings.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.backend == StorageBackend::S3 {
            match &self.storage.s3 {
                None => return Err(ConfigValidationError::MissingField("storage.s3".to_string())),
                Some(s3) if s3.bucket.is_empty() => {
                    return Err(ConfigValidationError::MissingField("storage.s3.bucket".to_string()))
                }
                Some(_) => {}
            }
        }

        if self.sessions.backend == SessionBackend::Postgres && self.database.is_none() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.limits.upload_max_photo_bytes == 0 || self.limits.submit_max_photo_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "limits".to_string(),
                message: "Photo ceilings must be greater than 0".to_string(),
            });
        }

        if self.sessions.memory_ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sessions.memory_ttl_secs".to_string(),
                message: "TTL must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }

    /// Get memory session TTL as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.memory_ttl_secs)
    }
}

impl LimitsConfig {
    /// Whole-request ceiling for a form carrying four photos of `per_photo` bytes.
    pub fn form_limit(&self, per_photo: usize) -> usize {
        per_photo
            .saturating_mul(4)
            .saturating_add(self.form_overhead_bytes)
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
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

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            upload_max_photo_bytes: default_upload_max_photo_bytes(),
            submit_max_photo_bytes: default_submit_max_photo_bytes(),
            max_field_bytes: default_max_field_bytes(),
            form_overhead_bytes: default_form_overhead_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            memory_bucket: default_memory_bucket(),
            s3: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            memory_ttl_secs: default_memory_ttl_secs(),
        }
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

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.limits.upload_max_photo_bytes, 12 * 1024 * 1024);
        assert_eq!(config.limits.submit_max_photo_bytes, 2 * 1024 * 1024);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::S3;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));

        config.storage.s3 = Some(S3Config {
            bucket: "scans".to_string(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_postgres_backend_requires_database() {
        let mut config = Config::default();
        config.sessions.backend = SessionBackend::Postgres;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_form_limit() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.form_limit(2 * MIB), 9 * MIB);
    }

    #[test]
    fn test_backends_parse_from_toml() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                "[storage]\nbackend = \"s3\"\n[storage.s3]\nbucket = \"scans\"\n[sessions]\nbackend = \"memory\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.s3.unwrap().region, "us-east-1");
    }
}
