//! ClickHouse over its HTTP interface, rows as JSONEachRow.

use super::{
    parse_version, substitute_macros, Database, Disk, ReplicaStatus, MIN_SHARD_OPERATION_VERSION,
};
use crate::config::ClickHouseConfig;
use crate::metadata::{Part, TablePattern, TableMetadata};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub struct ClickHouseHttp {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
    embedded_backup_disk: String,
}

#[derive(Deserialize)]
struct DiskRow {
    name: String,
    path: String,
    #[serde(rename = "type")]
    disk_type: String,
}

#[derive(Deserialize)]
struct TableRow {
    database: String,
    name: String,
    uuid: String,
    create_table_query: String,
    total_bytes: Option<u64>,
}

#[derive(Deserialize)]
struct PartRow {
    database: String,
    table: String,
    name: String,
    disk_name: String,
    bytes_on_disk: u64,
}

#[derive(Deserialize)]
struct MacroRow {
    #[serde(rename = "macro")]
    name: String,
    substitution: String,
}

#[derive(Deserialize)]
struct VersionRow {
    version: String,
}

impl ClickHouseHttp {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackupError::Database(format!("can't build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            embedded_backup_disk: config.embedded_backup_disk.clone(),
        })
    }

    async fn query<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        debug!("clickhouse query: {}", sql);
        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("default_format", "JSONEachRow"),
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| BackupError::Database(format!("request to {} failed: {}", self.url, e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BackupError::Database(format!("can't read response: {}", e)))?;
        if !status.is_success() {
            return Err(BackupError::Database(format!("{}: {}", status, body.trim())));
        }

        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(BackupError::from))
            .collect()
    }
}

#[async_trait]
impl Database for ClickHouseHttp {
    async fn list_disks(&self) -> Result<Vec<Disk>> {
        let rows: Vec<DiskRow> = self
            .query("SELECT name, path, type FROM system.disks ORDER BY name")
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut disk = Disk::new(&row.name, &row.path, &row.disk_type);
                disk.is_backup = !self.embedded_backup_disk.is_empty()
                    && row.name == self.embedded_backup_disk;
                disk
            })
            .collect())
    }

    async fn list_tables(&self, pattern: &TablePattern, with_parts: bool) -> Result<Vec<TableMetadata>> {
        let rows: Vec<TableRow> = self
            .query(
                "SELECT database, name, toString(uuid) AS uuid, create_table_query, total_bytes \
                 FROM system.tables WHERE is_temporary = 0 ORDER BY database, name",
            )
            .await?;

        let mut tables: Vec<TableMetadata> = rows
            .into_iter()
            .filter(|row| pattern.matches(&row.database, &row.name))
            .map(|row| TableMetadata {
                uuid: uuid::Uuid::parse_str(&row.uuid).ok().filter(|u| !u.is_nil()),
                database: row.database,
                table: row.name,
                query: row.create_table_query,
                total_bytes: row.total_bytes.unwrap_or(0),
                ..Default::default()
            })
            .collect();

        if with_parts && !tables.is_empty() {
            let rows: Vec<PartRow> = self
                .query(
                    "SELECT database, table, name, disk_name, bytes_on_disk \
                     FROM system.parts WHERE active ORDER BY database, table, disk_name, name",
                )
                .await?;
            let index: HashMap<(String, String), usize> = tables
                .iter()
                .enumerate()
                .map(|(i, t)| ((t.database.clone(), t.table.clone()), i))
                .collect();
            for row in rows {
                if let Some(&i) = index.get(&(row.database, row.table)) {
                    tables[i]
                        .parts
                        .entry(row.disk_name)
                        .or_default()
                        .push(Part::new(row.name, row.bytes_on_disk));
                }
            }
        }

        Ok(tables)
    }

    async fn apply_macros(&self, template: &str) -> Result<String> {
        if !template.contains('{') {
            return Ok(template.to_string());
        }
        let rows: Vec<MacroRow> = self
            .query("SELECT macro, substitution FROM system.macros")
            .await?;
        Ok(substitute_macros(
            template,
            rows.iter().map(|r| (r.name.as_str(), r.substitution.as_str())),
        ))
    }

    async fn can_shard_operation(&self) -> Result<()> {
        let rows: Vec<VersionRow> = self.query("SELECT version() AS version").await?;
        let version = rows
            .first()
            .ok_or_else(|| BackupError::Database("version() returned no rows".to_string()))?;
        if parse_version(&version.version)? < MIN_SHARD_OPERATION_VERSION {
            return Err(BackupError::ShardOperationUnsupported(format!(
                "ClickHouse {} does not report active replicas, 21.9 or newer is required",
                version.version
            )));
        }
        Ok(())
    }

    async fn replica_view(&self) -> Result<Vec<ReplicaStatus>> {
        self.query(
            "SELECT database, table, replica_name, \
             arraySort(mapKeys(mapFilter((k, v) -> v = 1, replica_is_active))) AS active_replicas \
             FROM system.replicas",
        )
        .await
    }
}
