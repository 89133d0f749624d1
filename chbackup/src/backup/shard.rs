//! Per-replica backup type assignment for sharded operation.
//!
//! Every replica of a replicated table computes the same owner from the same
//! inputs (table identity and the sorted set of active replicas), so exactly
//! one replica uploads the table's data and the others upload its schema.

use super::Table;
use crate::clickhouse::{Database, ReplicaStatus};
use crate::metadata::TableTitle;
use crate::utils::{BackupError, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupType {
    #[default]
    Full,
    SchemaOnly,
    None,
}

/// Named strategies selectable by `general.sharded_operation_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardMode {
    /// Owner chosen by a hash of `database.table`
    Table,
    /// Owner chosen by a hash of the database name
    Database,
    /// First active replica in sorted order owns every table
    FirstReplica,
    /// Every replica owns every table
    None,
}

impl ShardMode {
    /// `None` when sharded operation is disabled.
    pub fn from_config(mode: &str) -> Result<Option<ShardMode>> {
        match mode {
            "" => Ok(None),
            "table" => Ok(Some(ShardMode::Table)),
            "database" => Ok(Some(ShardMode::Database)),
            "first-replica" => Ok(Some(ShardMode::FirstReplica)),
            "none" => Ok(Some(ShardMode::None)),
            other => Err(BackupError::Config(format!(
                "unknown general->sharded_operation_mode '{}', expected table, database, first-replica or none",
                other
            ))),
        }
    }

    /// Does `replica` own the full copy of `title`, given the active replicas?
    pub fn owns_full_copy(&self, title: &TableTitle, replica: &str, active: &[String]) -> Result<bool> {
        if active.is_empty() {
            return Err(BackupError::Database(format!(
                "no active replicas reported for {}",
                title
            )));
        }
        let mut active = active.to_vec();
        active.sort();

        let owner = match self {
            ShardMode::None => return Ok(true),
            ShardMode::FirstReplica => &active[0],
            ShardMode::Table => {
                let key = format!("{}.{}", title.database, title.table);
                &active[owner_index(&key, active.len())]
            }
            ShardMode::Database => &active[owner_index(&title.database, active.len())],
        };
        Ok(owner == replica)
    }
}

impl fmt::Display for ShardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardMode::Table => "table",
            ShardMode::Database => "database",
            ShardMode::FirstReplica => "first-replica",
            ShardMode::None => "none",
        };
        f.write_str(name)
    }
}

fn owner_index(key: &str, replicas: usize) -> usize {
    crc32fast::hash(key.as_bytes()) as usize % replicas
}

/// Ownership decisions for one run. Tables absent from the replica view are
/// not replicated and are always owned.
#[derive(Debug, Clone, Default)]
pub struct ShardAssignment {
    owned: HashMap<TableTitle, bool>,
}

impl ShardAssignment {
    pub fn compute(mode: ShardMode, view: &[ReplicaStatus]) -> Result<Self> {
        let mut owned = HashMap::with_capacity(view.len());
        for row in view {
            let title = TableTitle::new(&row.database, &row.table);
            let full = mode.owns_full_copy(&title, &row.replica_name, &row.active_replicas)?;
            owned.insert(title, full);
        }
        Ok(Self { owned })
    }

    pub fn in_shard(&self, title: &TableTitle) -> bool {
        self.owned.get(title).copied().unwrap_or(true)
    }
}

/// Set `backup_type` on every table: `None` for skipped tables, `Full`
/// otherwise, downgraded to `SchemaOnly` where another replica owns the data.
pub async fn populate_backup_type(
    db: &dyn Database,
    mode: Option<ShardMode>,
    tables: &mut [Table],
) -> Result<()> {
    for table in tables.iter_mut() {
        table.backup_type = if table.skip {
            BackupType::None
        } else {
            BackupType::Full
        };
    }

    let Some(mode) = mode else {
        return Ok(());
    };

    db.can_shard_operation().await?;
    let view = db.replica_view().await?;
    let assignment = ShardAssignment::compute(mode, &view)?;

    let mut schema_only = 0;
    for table in tables.iter_mut().filter(|t| !t.skip) {
        let title = table.meta.title();
        if !assignment.in_shard(&title) {
            debug!("{} is owned by another replica, uploading schema only", title);
            table.backup_type = BackupType::SchemaOnly;
            schema_only += 1;
        }
    }
    info!(
        "Sharded operation mode '{}': {} of {} tables schema only",
        mode,
        schema_only,
        tables.len()
    );
    Ok(())
}
