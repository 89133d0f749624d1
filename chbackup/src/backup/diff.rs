//! Tables of a diff-from backup, used to skip parts that are already stored.

use crate::metadata::{list_local_tables, BackupMetadata, TablePattern, TableMetadata, TableTitle};
use crate::storage::BackupDestination;
use crate::utils::{BackupError, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

pub type DiffTables = HashMap<TableTitle, TableMetadata>;

/// Where the diff-from backup lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffSource {
    Local(String),
    Remote(String),
}

impl DiffSource {
    /// From the two mutually exclusive upload options.
    pub fn from_options(local: Option<&str>, remote: Option<&str>) -> Result<Option<Self>> {
        let local = local.filter(|s| !s.is_empty());
        let remote = remote.filter(|s| !s.is_empty());
        match (local, remote) {
            (Some(_), Some(_)) => Err(BackupError::Config(
                "--diff-from and --diff-from-remote can't be used together".to_string(),
            )),
            (Some(name), None) => Ok(Some(DiffSource::Local(name.to_string()))),
            (None, Some(name)) => Ok(Some(DiffSource::Remote(name.to_string()))),
            (None, None) => Ok(None),
        }
    }

    pub fn backup_name(&self) -> &str {
        match self {
            DiffSource::Local(name) | DiffSource::Remote(name) => name,
        }
    }
}

/// Tables of the local backup `diff_from` stored in `backup_dir`, read from
/// its metadata directory.
pub fn tables_diff_from_local(
    backup_dir: &Path,
    diff_from: &str,
    pattern: &TablePattern,
) -> Result<DiffTables> {
    let manifest = BackupMetadata::read_from_dir(backup_dir, diff_from)?;
    if manifest.tables.is_empty() {
        info!("diff-from backup {} has no tables", diff_from);
        return Ok(DiffTables::new());
    }

    let tables = list_local_tables(&backup_dir.join("metadata"), pattern)?;
    debug!("{} tables in local diff-from backup {}", tables.len(), diff_from);
    Ok(tables.into_iter().map(|t| (t.title(), t)).collect())
}

/// Tables of a backup that is already on remote storage.
pub async fn tables_diff_from_remote(
    dst: &BackupDestination,
    diff_from: &str,
    pattern: &TablePattern,
) -> Result<DiffTables> {
    let manifest = dst
        .backup_list(true, diff_from)
        .await?
        .into_iter()
        .find(|b| b.name == diff_from)
        .and_then(|b| b.metadata)
        .ok_or_else(|| BackupError::RemoteBackupNotFound(diff_from.to_string()))?;

    let mut diff = DiffTables::new();
    for title in manifest
        .tables
        .iter()
        .filter(|t| pattern.matches(&t.database, &t.table))
    {
        let lookup = TableMetadata {
            database: title.database.clone(),
            table: title.table.clone(),
            ..Default::default()
        };
        let key = lookup.remote_metadata_key(diff_from);
        let table: TableMetadata = dst.get_json(&key).await?.ok_or_else(|| {
            BackupError::Storage(format!("{} is listed in {} but missing", key, diff_from))
        })?;
        diff.insert(title.clone(), table);
    }
    debug!("{} tables in remote diff-from backup {}", diff.len(), diff_from);
    Ok(diff)
}

/// Mark parts of `table` that the diff-from backup already stores on the
/// same disk as `required`. Returns how many parts were marked.
pub fn mark_required_parts(table: &mut TableMetadata, diff: &DiffTables) -> usize {
    let Some(base) = diff.get(&table.title()) else {
        return 0;
    };
    let mut marked = 0;
    for (disk, parts) in table.parts.iter_mut() {
        let Some(base_parts) = base.parts.get(disk) else {
            continue;
        };
        for part in parts.iter_mut() {
            if base_parts.iter().any(|p| p.name == part.name) {
                part.required = true;
                marked += 1;
            }
        }
    }
    marked
}
