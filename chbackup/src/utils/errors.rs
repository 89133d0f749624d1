//! Error types for the upload pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("backup '{0}' not found in local backups")]
    LocalBackupNotFound(String),

    #[error("{0} not found on remote storage")]
    RemoteBackupNotFound(String),

    #[error("'{0}' already exists on remote storage")]
    RemoteBackupExists(String),

    #[error("sharded operations are not supported: {0}")]
    ShardOperationUnsupported(String),

    #[error("can't determine ClickHouse data path, no 'default' disk found")]
    UnknownDataPath,

    #[error("ClickHouse error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("upload cancelled")]
    Cancelled,

    #[error("{phase} failed for {table}: {source}")]
    Table {
        phase: &'static str,
        table: String,
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    /// Wrap an error with the table and pipeline phase it happened in.
    pub fn in_table(self, phase: &'static str, table: impl Into<String>) -> Self {
        BackupError::Table {
            phase,
            table: table.into(),
            source: Box::new(self),
        }
    }

    /// True when the error (or the error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            BackupError::Cancelled => true,
            BackupError::Table { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
