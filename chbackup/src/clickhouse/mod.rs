//! Database collaborator: everything the upload core needs to ask the
//! ClickHouse server.

pub mod http;

use crate::metadata::{TablePattern, TableMetadata};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use http::ClickHouseHttp;

/// First server version whose `system.replicas` exposes `replica_is_active`.
pub const MIN_SHARD_OPERATION_VERSION: u64 = 21_009_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DiskType {
    Local,
    S3,
    AzureBlob,
    Encrypted,
    Other(String),
}

impl From<String> for DiskType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "local" => DiskType::Local,
            "s3" => DiskType::S3,
            "azure_blob_storage" | "azure" => DiskType::AzureBlob,
            "encrypted" => DiskType::Encrypted,
            _ => DiskType::Other(s),
        }
    }
}

impl From<DiskType> for String {
    fn from(t: DiskType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskType::Local => f.write_str("local"),
            DiskType::S3 => f.write_str("s3"),
            DiskType::AzureBlob => f.write_str("azure_blob_storage"),
            DiskType::Encrypted => f.write_str("encrypted"),
            DiskType::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    #[serde(default)]
    pub is_backup: bool,
}

impl Disk {
    pub fn new(name: &str, path: &str, disk_type: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            disk_type: DiskType::from(disk_type.to_string()),
            is_backup: false,
        }
    }
}

/// One row of this server's view of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplicaStatus {
    pub database: String,
    pub table: String,
    /// Name of the replica running on this server
    pub replica_name: String,
    /// Replicas currently reported active, this one included when healthy
    pub active_replicas: Vec<String>,
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn list_disks(&self) -> Result<Vec<Disk>>;

    /// Path of the `default` disk.
    fn default_data_path(&self, disks: &[Disk]) -> Result<String> {
        disks
            .iter()
            .find(|d| d.name == "default")
            .map(|d| d.path.clone())
            .ok_or(BackupError::UnknownDataPath)
    }

    async fn list_tables(&self, pattern: &TablePattern, with_parts: bool) -> Result<Vec<TableMetadata>>;

    /// Substitute `{macro}` placeholders using the server's macros.
    async fn apply_macros(&self, template: &str) -> Result<String>;

    /// Ok when the server can tell us which replicas are active.
    async fn can_shard_operation(&self) -> Result<()>;

    async fn replica_view(&self) -> Result<Vec<ReplicaStatus>>;
}

/// `23.8.2.7` -> 23_008_002
pub fn parse_version(version: &str) -> Result<u64> {
    let mut parts = version.trim().split('.');
    let mut next = || -> Result<u64> {
        parts
            .next()
            .unwrap_or("0")
            .parse::<u64>()
            .map_err(|e| BackupError::Database(format!("can't parse version '{}': {}", version, e)))
    };
    let (major, minor, patch) = (next()?, next()?, next()?);
    Ok(major * 1_000_000 + minor * 1_000 + patch)
}

/// Replace `{name}` with its substitution for every known macro.
pub fn substitute_macros<'a, I>(template: &str, macros: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = template.to_string();
    for (name, value) in macros {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}
