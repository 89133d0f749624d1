//! Backup manifests.
//!
//! A backup is described by a root manifest (`<backup>/metadata.json`) and
//! one metadata object per table. The root manifest is written last: its
//! presence is what marks a backup as complete.

pub mod pattern;
pub mod table;

use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub use pattern::TablePattern;
pub use table::{list_local_tables, table_path_encode, Part, TableMetadata};

/// Identity of a table across backups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableTitle {
    pub database: String,
    pub table: String,
}

impl TableTitle {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`", self.database, self.table)
    }
}

/// Root manifest of one backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_name: String,

    /// disk name -> path on the server that produced the backup
    #[serde(default)]
    pub disks: BTreeMap<String, String>,

    /// disk name -> disk type
    #[serde(default)]
    pub disk_types: BTreeMap<String, String>,

    #[serde(default)]
    pub version: String,

    pub creation_date: DateTime<Utc>,

    #[serde(default)]
    pub tags: String,

    #[serde(default)]
    pub data_size: u64,

    #[serde(default)]
    pub metadata_size: u64,

    #[serde(default)]
    pub compressed_size: u64,

    #[serde(default)]
    pub tables: Vec<TableTitle>,

    #[serde(default)]
    pub data_format: String,

    /// Backup this one was diffed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_backup: Option<String>,
}

impl BackupMetadata {
    pub fn new(backup_name: impl Into<String>) -> Self {
        Self {
            backup_name: backup_name.into(),
            disks: BTreeMap::new(),
            disk_types: BTreeMap::new(),
            version: String::new(),
            creation_date: Utc::now(),
            tags: String::new(),
            data_size: 0,
            metadata_size: 0,
            compressed_size: 0,
            tables: Vec::new(),
            data_format: String::new(),
            required_backup: None,
        }
    }

    /// Read `<data_path>/backup/<name>/metadata.json`.
    pub fn read_local(default_data_path: &Path, backup_name: &str) -> Result<Self> {
        Self::read_from_dir(&local_backup_path(default_data_path, backup_name), backup_name)
    }

    /// Read `metadata.json` of the backup stored in `backup_dir`.
    pub fn read_from_dir(backup_dir: &Path, backup_name: &str) -> Result<Self> {
        let path = backup_dir.join("metadata.json");
        match std::fs::read(&path) {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::LocalBackupNotFound(backup_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remote key of the root manifest.
    pub fn remote_key(backup_name: &str) -> String {
        format!("{}/metadata.json", backup_name)
    }

    pub fn total_size(&self) -> u64 {
        self.compressed_size + self.metadata_size
    }
}

/// `<data_path>/backup/<name>`
pub fn local_backup_path(default_data_path: &Path, backup_name: &str) -> PathBuf {
    default_data_path.join("backup").join(backup_name)
}
