//! Per-table metadata stored as `metadata/<db>/<table>.json`.

use super::pattern::TablePattern;
use super::TableTitle;
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// One on-disk part directory inside a table's shadow copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub name: String,

    #[serde(default)]
    pub size: u64,

    /// Part data lives in the `required_backup`, not in this one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

impl Part {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    pub database: String,
    pub table: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<uuid::Uuid>,

    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub total_bytes: u64,

    /// disk name -> parts
    #[serde(default)]
    pub parts: BTreeMap<String, Vec<Part>>,

    /// disk name -> uploaded archive names
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub metadata_only: bool,
}

impl TableMetadata {
    pub fn title(&self) -> TableTitle {
        TableTitle::new(&self.database, &self.table)
    }

    /// `db/table` (encoded) or `uuid[0..3]/uuid` for Atomic databases.
    pub fn data_path(&self) -> String {
        match &self.uuid {
            Some(uuid) => {
                let uuid = uuid.to_string();
                format!("{}/{}", &uuid[..3], uuid)
            }
            None => format!(
                "{}/{}",
                table_path_encode(&self.database),
                table_path_encode(&self.table)
            ),
        }
    }

    /// Remote key of this table's metadata object.
    pub fn remote_metadata_key(&self, backup_name: &str) -> String {
        format!(
            "{}/metadata/{}/{}.json",
            backup_name,
            table_path_encode(&self.database),
            table_path_encode(&self.table)
        )
    }

    /// Remote key of one data archive of this table.
    pub fn remote_archive_key(&self, backup_name: &str, archive_name: &str) -> String {
        format!(
            "{}/shadow/{}/{}/{}",
            backup_name,
            table_path_encode(&self.database),
            table_path_encode(&self.table),
            archive_name
        )
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Escape a database or table name the way ClickHouse names its data
/// directories: `[A-Za-z0-9_]` stay, every other byte becomes `%XX`.
pub fn table_path_encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Read every `<db>/<table>.json` under a backup's metadata directory whose
/// identity matches `pattern`. Files that don't parse are skipped with a
/// warning so one broken table doesn't hide the rest.
pub fn list_local_tables(metadata_dir: &Path, pattern: &TablePattern) -> Result<Vec<TableMetadata>> {
    let mut tables = Vec::new();
    if !metadata_dir.exists() {
        return Ok(tables);
    }

    let walker = WalkDir::new(metadata_dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|e| e.to_str()) != Some("json")
        {
            continue;
        }
        match TableMetadata::read_from(entry.path()) {
            Ok(table) => {
                if pattern.matches(&table.database, &table.table) {
                    tables.push(table);
                }
            }
            Err(e) => warn!("skip unreadable table metadata {}: {}", entry.path().display(), e),
        }
    }

    Ok(tables)
}
