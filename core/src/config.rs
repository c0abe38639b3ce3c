use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MirrorError, Result};

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Name of this instance, recorded as the exporter of every archive
    pub instance_name: String,

    /// Object storage configuration
    pub storage: StorageConfig,

    /// Container registry configuration
    pub registry: RegistryConfig,

    /// Archive signing configuration
    pub signing: SigningConfig,

    /// Receiving instance (export side only)
    pub remote: Option<RemoteConfig>,

    /// Streaming pipeline tuning
    pub pipeline: PipelineConfig,

    /// Deadlines
    pub timeouts: TimeoutConfig,

    /// Local model store
    pub store: StoreConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            instance_name: "model-mirror".to_string(),
            storage: StorageConfig::default(),
            registry: RegistryConfig::default(),
            signing: SigningConfig::default(),
            remote: None,
            pipeline: PipelineConfig::default(),
            timeouts: TimeoutConfig::default(),
            store: StoreConfig::default(),
            log_level: LogLevel::Info,
        }
    }
}

impl MirrorConfig {
    /// Load configuration from a YAML file, then apply `MIRROR_*` overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: MirrorConfig = serde_yaml::from_str(&data)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `MIRROR_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("MIRROR_INSTANCE_NAME") {
            self.instance_name = name;
        }
        if let Ok(bucket) = std::env::var("MIRROR_S3_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Ok(endpoint) = std::env::var("MIRROR_S3_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        }
        if let Ok(url) = std::env::var("MIRROR_REGISTRY_URL") {
            self.registry.url = url;
        }
        if let Ok(key_id) = std::env::var("MIRROR_SIGNING_KEY_ID") {
            self.signing.key_id = Some(key_id);
        }
        if let Ok(url) = std::env::var("MIRROR_REMOTE_URL") {
            let auth_token = std::env::var("MIRROR_REMOTE_TOKEN").ok();
            self.remote = Some(RemoteConfig { url, auth_token });
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.trim().is_empty() {
            return Err(MirrorError::ConfigError(
                "instance_name must not be empty".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.trim().is_empty() {
            return Err(MirrorError::ConfigError(
                "storage.bucket is required for the s3 backend".to_string(),
            ));
        }
        match self.signing.backend {
            SigningBackend::None => {}
            SigningBackend::Kms if self.signing.key_id.is_none() => {
                return Err(MirrorError::ConfigError(
                    "signing.key_id is required for the kms backend".to_string(),
                ));
            }
            SigningBackend::Local if self.signing.local_key_path.is_none() => {
                return Err(MirrorError::ConfigError(
                    "signing.local_key_path is required for the local backend".to_string(),
                ));
            }
            _ => {}
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(MirrorError::ConfigError(
                "pipeline.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.pipeline.part_size < MIN_PART_SIZE {
            return Err(MirrorError::ConfigError(format!(
                "pipeline.part_size must be at least {} bytes",
                MIN_PART_SIZE
            )));
        }
        if self.registry.concurrency == 0 {
            return Err(MirrorError::ConfigError(
                "registry.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Smallest multipart part size accepted by S3.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Object storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Memory,
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Bucket holding exports and imported blobs
    pub bucket: String,

    /// Region (falls back to the AWS default chain)
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,

    /// Use path-style addressing
    pub force_path_style: bool,

    /// Lifetime of pre-signed payload URLs in seconds
    pub presign_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            bucket: "uploads".to_string(),
            region: None,
            endpoint: None,
            force_path_style: false,
            presign_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Container registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL, e.g. `https://registry.example.com`
    pub url: String,

    /// Token service name
    pub service: String,

    /// Token endpoint; a static `token` is used when unset
    pub token_url: Option<String>,

    /// Static bearer token
    pub token: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Concurrent layer fetches per image
    pub concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".to_string(),
            service: "RegistryAuth".to_string(),
            token_url: None,
            token: None,
            username: None,
            password: None,
            concurrency: 2,
        }
    }
}

/// Signing backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningBackend {
    /// Do not sign exports
    None,
    /// AWS KMS asymmetric key
    Kms,
    /// In-process P-256 key loaded from disk
    Local,
}

/// Archive signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub backend: SigningBackend,
    pub key_id: Option<String>,
    pub region: Option<String>,
    pub local_key_path: Option<PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            backend: SigningBackend::None,
            key_id: None,
            region: None,
            local_key_path: None,
        }
    }
}

/// Receiving instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the receiving instance
    pub url: String,

    /// Bearer token presented to the import endpoint
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Streaming pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded channel capacity between pipeline stages (in messages)
    pub channel_capacity: usize,

    /// Size of chunks emitted by the compressor
    pub chunk_size: usize,

    /// Multipart upload part size
    pub part_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4,
            chunk_size: 64 * 1024,
            part_size: 8 * 1024 * 1024,
        }
    }
}

/// Deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole export or import
    pub operation_secs: u64,

    /// Single HTTP request (connect + headers)
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_secs: 60 * 60,
            request_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn operation(&self) -> Duration {
        Duration::from_secs(self.operation_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

/// Local model store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot path; in-memory only when unset
    pub path: Option<PathBuf>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = MirrorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.signing.backend, SigningBackend::None);
    }

    #[test]
    fn test_kms_requires_key_id() {
        let mut config = MirrorConfig::default();
        config.signing.backend = SigningBackend::Kms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("signing.key_id"));

        config.signing.key_id = Some("alias/mirror".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_part_size_lower_bound() {
        let mut config = MirrorConfig::default();
        config.pipeline.part_size = 1024;
        assert!(matches!(
            config.validate(),
            Err(MirrorError::ConfigError(_))
        ));
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mirror.yaml");
        std::fs::write(
            &path,
            r#"
instance_name: instance-a
storage:
  backend: s3
  bucket: exports
  force_path_style: true
signing:
  backend: local
  local_key_path: /etc/mirror/key.hex
remote:
  url: https://receiver.example
log_level: debug
"#,
        )
        .unwrap();

        let config = MirrorConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.bucket, "exports");
        assert!(config.storage.force_path_style);
        assert_eq!(config.signing.backend, SigningBackend::Local);
        assert_eq!(config.pipeline.channel_capacity, 4);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(config.remote.unwrap().auth_token.is_none());
    }

    #[test]
    fn test_from_file_missing() {
        let err = MirrorConfig::from_file(Path::new("/nonexistent/mirror.yaml")).unwrap_err();
        assert!(matches!(err, MirrorError::ConfigError(_)));
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
    }
}
