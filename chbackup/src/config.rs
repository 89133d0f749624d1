//! Configuration management for chbackup.
//!
//! Loads configuration from a TOML file, then applies environment variable
//! overrides. [`Config::validate`] must pass before any I/O is attempted.

use crate::backup::shard::ShardMode;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub clickhouse: ClickHouseConfig,
    pub s3: S3Config,
    pub gcs: GcsConfig,
    pub azblob: AzblobConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// none, custom, s3, gcs, azblob
    pub remote_storage: String,

    /// Upper bound in bytes for the uncompressed content of one data archive
    pub max_file_size: u64,

    /// Remote backups to keep after an upload (0 keeps everything)
    pub backups_to_keep_remote: usize,

    /// Maximum concurrent network operations against the remote store
    pub upload_concurrency: usize,

    /// Shard policy name; empty disables sharded operation
    pub sharded_operation_mode: String,

    /// Record finished units so an interrupted upload can be resumed
    pub use_resumable_state: bool,

    /// How often buffered resumable marks are flushed to disk
    pub resumable_flush_interval_ms: u64,

    /// `db.table` glob patterns that are never uploaded
    pub skip_tables: Vec<String>,

    /// Archive format for data batches (zstd, tar)
    pub compression_format: String,

    /// zstd compression level (1-22)
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    /// HTTP interface URL
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,

    /// Backups are produced by the server's own BACKUP command
    pub use_embedded_backup_restore: bool,

    /// Disk declared in the server's `<backups>` section for embedded backups
    pub embedded_backup_disk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub force_path_style: bool,
    pub disable_ssl: bool,

    /// Key prefix for backups inside the bucket
    pub path: String,

    /// Key prefix for object disk data; may contain server macros
    pub object_disk_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    pub bucket: String,
    pub endpoint: String,
    pub path: String,
    pub object_disk_path: String,

    /// HMAC key pair, used both for transfers and embedded locations
    pub embedded_access_key: String,
    pub embedded_secret_key: String,
    pub force_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzblobConfig {
    pub account_name: String,
    pub account_key: String,
    pub endpoint_suffix: String,
    pub endpoint_schema: String,
    pub container: String,
    pub path: String,
    pub object_disk_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

/// Remote storage selected by `general.remote_storage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStorageKind {
    None,
    Custom,
    S3,
    Gcs,
    AzBlob,
}

impl RemoteStorageKind {
    /// `none` and `custom` are managed outside of this process.
    pub fn is_managed(self) -> bool {
        !matches!(self, RemoteStorageKind::None | RemoteStorageKind::Custom)
    }
}

impl FromStr for RemoteStorageKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(RemoteStorageKind::None),
            "custom" => Ok(RemoteStorageKind::Custom),
            "s3" => Ok(RemoteStorageKind::S3),
            "gcs" => Ok(RemoteStorageKind::Gcs),
            "azblob" => Ok(RemoteStorageKind::AzBlob),
            other => Err(BackupError::Config(format!(
                "invalid general->remote_storage: '{}', expected one of none, custom, s3, gcs, azblob",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Tar,
    Zstd,
}

impl CompressionFormat {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Tar => "tar",
            CompressionFormat::Zstd => "tar.zst",
        }
    }
}

impl FromStr for CompressionFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tar" => Ok(CompressionFormat::Tar),
            "zstd" => Ok(CompressionFormat::Zstd),
            other => Err(BackupError::Config(format!(
                "unsupported general->compression_format: '{}'",
                other
            ))),
        }
    }
}

// Default values
fn default_skip_tables() -> Vec<String> {
    [
        "system.*",
        "INFORMATION_SCHEMA.*",
        "information_schema.*",
        "_temporary_and_external_tables.*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            remote_storage: "none".to_string(),
            max_file_size: 1024 * 1024 * 1024,
            backups_to_keep_remote: 0,
            upload_concurrency: 4,
            sharded_operation_mode: String::new(),
            use_resumable_state: false,
            resumable_flush_interval_ms: 1000,
            skip_tables: default_skip_tables(),
            compression_format: "zstd".to_string(),
            compression_level: 3,
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            username: "default".to_string(),
            password: String::new(),
            timeout_secs: 300,
            use_embedded_backup_restore: false,
            embedded_backup_disk: String::new(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: String::new(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            force_path_style: false,
            disable_ssl: false,
            path: String::new(),
            object_disk_path: String::new(),
        }
    }
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: String::new(),
            path: String::new(),
            object_disk_path: String::new(),
            embedded_access_key: String::new(),
            embedded_secret_key: String::new(),
            force_http: false,
        }
    }
}

impl Default for AzblobConfig {
    fn default() -> Self {
        Self {
            account_name: String::new(),
            account_key: String::new(),
            endpoint_suffix: "core.windows.net".to_string(),
            endpoint_schema: "https".to_string(),
            container: String::new(),
            path: String::new(),
            object_disk_path: String::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content).map_err(|e| {
            BackupError::Config(format!("can't parse {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Override individual options from environment-style variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };

        set(&mut self.general.remote_storage, "REMOTE_STORAGE");
        set(&mut self.general.sharded_operation_mode, "SHARDED_OPERATION_MODE");
        if let Some(size) = lookup("MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
            self.general.max_file_size = size;
        }
        if let Some(keep) = lookup("BACKUPS_TO_KEEP_REMOTE").and_then(|v| v.parse().ok()) {
            self.general.backups_to_keep_remote = keep;
        }
        if let Some(n) = lookup("UPLOAD_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.general.upload_concurrency = n;
        }

        set(&mut self.clickhouse.url, "CLICKHOUSE_URL");
        set(&mut self.clickhouse.username, "CLICKHOUSE_USERNAME");
        set(&mut self.clickhouse.password, "CLICKHOUSE_PASSWORD");
        set(&mut self.clickhouse.embedded_backup_disk, "CLICKHOUSE_EMBEDDED_BACKUP_DISK");
        if let Some(flag) = lookup("CLICKHOUSE_USE_EMBEDDED_BACKUP_RESTORE") {
            self.clickhouse.use_embedded_backup_restore = flag == "true" || flag == "1";
        }

        set(&mut self.s3.bucket, "S3_BUCKET");
        set(&mut self.s3.endpoint, "S3_ENDPOINT");
        set(&mut self.s3.region, "S3_REGION");
        set(&mut self.s3.access_key, "S3_ACCESS_KEY");
        set(&mut self.s3.secret_key, "S3_SECRET_KEY");
        set(&mut self.s3.path, "S3_PATH");
        set(&mut self.s3.object_disk_path, "S3_OBJECT_DISK_PATH");

        set(&mut self.gcs.bucket, "GCS_BUCKET");
        set(&mut self.gcs.path, "GCS_PATH");
        set(&mut self.gcs.object_disk_path, "GCS_OBJECT_DISK_PATH");

        set(&mut self.azblob.account_name, "AZBLOB_ACCOUNT_NAME");
        set(&mut self.azblob.account_key, "AZBLOB_ACCOUNT_KEY");
        set(&mut self.azblob.container, "AZBLOB_CONTAINER");
        set(&mut self.azblob.object_disk_path, "AZBLOB_OBJECT_DISK_PATH");

        set(&mut self.log.level, "LOG_LEVEL");
    }

    /// Fail fast on option values that can never work.
    pub fn validate(&self) -> Result<()> {
        self.remote_storage()?;
        self.compression_format()?;
        ShardMode::from_config(&self.general.sharded_operation_mode)?;
        if self.general.max_file_size == 0 {
            return Err(BackupError::Config(
                "general->max_file_size must be greater than 0".to_string(),
            ));
        }
        if self.general.upload_concurrency == 0 {
            return Err(BackupError::Config(
                "general->upload_concurrency must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn remote_storage(&self) -> Result<RemoteStorageKind> {
        self.general.remote_storage.parse()
    }

    pub fn compression_format(&self) -> Result<CompressionFormat> {
        self.general.compression_format.parse()
    }

    /// Object disk prefix of the active provider.
    pub fn object_disk_path(&self) -> Result<&str> {
        match self.remote_storage()? {
            RemoteStorageKind::S3 => Ok(&self.s3.object_disk_path),
            RemoteStorageKind::Gcs => Ok(&self.gcs.object_disk_path),
            RemoteStorageKind::AzBlob => Ok(&self.azblob.object_disk_path),
            _ => Err(BackupError::Config(format!(
                "object disk path requested but general->remote_storage is '{}'",
                self.general.remote_storage
            ))),
        }
    }
}
