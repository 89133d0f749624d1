//! The upload pipeline.

use super::batch::{separate_parts, Batch};
use super::diff::{
    mark_required_parts, tables_diff_from_local, tables_diff_from_remote, DiffSource, DiffTables,
};
use super::disks::DiskSnapshot;
use super::location::{embedded_location, redact_location};
use super::shard::{populate_backup_type, BackupType};
use super::{Backuper, Table};
use crate::config::{Config, RemoteStorageKind};
use crate::metadata::{
    list_local_tables, BackupMetadata, Part, TablePattern, TableMetadata, TableTitle,
};
use crate::resumable::ResumableState;
use crate::storage::BackupDestination;
use crate::transfer::progress::{UploadStats, UploadSummary};
use crate::utils::{BackupError, Result};
use futures_util::future::try_join_all;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub backup_name: String,
    /// `db.table` globs, empty for every table
    pub tables: String,
    pub diff_from: Option<String>,
    pub diff_from_remote: Option<String>,
    /// Upload table definitions only
    pub schema_only: bool,
    pub resumable: bool,
}

impl UploadOptions {
    /// Parameters a resumable ledger must match to be reused. Anything that
    /// changes how parts are grouped into archives or which tables are
    /// uploaded belongs here.
    fn ledger_params(&self, config: &Config) -> serde_json::Value {
        json!({
            "backup": self.backup_name,
            "tables": self.tables,
            "diff_from": self.diff_from,
            "diff_from_remote": self.diff_from_remote,
            "schema": self.schema_only,
            "max_file_size": config.general.max_file_size,
            "compression_format": config.general.compression_format,
            "compression_level": config.general.compression_level,
            "sharded_operation_mode": config.general.sharded_operation_mode,
            "skip_tables": config.general.skip_tables,
        })
    }
}

/// State shared by the per-table upload tasks of one run.
struct TableUploader {
    backup_name: String,
    dst: Arc<BackupDestination>,
    disks: Arc<DiskSnapshot>,
    diff: DiffTables,
    resumable: Option<Arc<ResumableState>>,
    semaphore: Semaphore,
    cancel: CancellationToken,
    stats: UploadStats,
    max_file_size: u64,
    embedded: bool,
    upload_data: bool,
    object_disk_path: String,
}

impl Backuper {
    /// Upload the local backup `opts.backup_name`.
    pub async fn upload(&mut self, opts: UploadOptions) -> Result<UploadSummary> {
        let name = opts.backup_name.clone();
        match self.config.remote_storage()? {
            RemoteStorageKind::None => {
                warn!("upload of {} aborted: general->remote_storage is 'none'", name);
                return Ok(UploadSummary {
                    backup_name: name,
                    ..Default::default()
                });
            }
            RemoteStorageKind::Custom => {
                return Err(BackupError::Config(
                    "general->remote_storage 'custom' is uploaded by its own commands".to_string(),
                ))
            }
            _ => {}
        }
        if name.is_empty() {
            return Err(BackupError::Config("select backup for upload".to_string()));
        }
        let diff_source =
            DiffSource::from_options(opts.diff_from.as_deref(), opts.diff_from_remote.as_deref())?;
        if diff_source.as_ref().map(|d| d.backup_name() == name).unwrap_or(false) {
            return Err(BackupError::Config(format!(
                "{} can't be uploaded as a diff of itself",
                name
            )));
        }
        let pattern = TablePattern::parse(&opts.tables)?;
        let skip = TablePattern::from_list(&self.config.general.skip_tables)?;

        // DiskResolution
        let disks = self.resolve_disks().await?;
        let backup_dir = disks.local_backup_dir(&name);
        let mut manifest = BackupMetadata::read_from_dir(&backup_dir, &name)?;
        let dst = self.connect_destination().await?;
        if dst
            .backup_list(true, &name)
            .await?
            .iter()
            .any(|b| b.name == name && b.is_complete())
        {
            return Err(BackupError::RemoteBackupExists(name));
        }

        let mut tables: Vec<Table> = list_local_tables(&backup_dir.join("metadata"), &pattern)?
            .into_iter()
            .map(|meta| {
                let skipped = skip.matches_any(&meta.database, &meta.table);
                Table::new(meta, skipped)
            })
            .collect();
        if tables.is_empty() {
            warn!("no tables matching '{}' in local backup {}", opts.tables, name);
        }

        // DiffResolution
        let diff = match &diff_source {
            Some(DiffSource::Local(base)) => {
                tables_diff_from_local(&disks.local_backup_dir(base), base, &pattern)?
            }
            Some(DiffSource::Remote(base)) => tables_diff_from_remote(&dst, base, &pattern).await?,
            None => DiffTables::new(),
        };

        // ShardAssignment
        populate_backup_type(self.db.as_ref(), self.shard_mode, &mut tables).await?;

        let embedded = self.config.clickhouse.use_embedded_backup_restore;
        let mut upload_data = !opts.schema_only;
        if embedded && self.config.clickhouse.embedded_backup_disk.is_empty() {
            let location =
                embedded_location(&self.config, self.db.as_ref(), &name, |k| std::env::var(k).ok())
                    .await?;
            info!(
                "data of {} was written to {}, uploading metadata only",
                name,
                redact_location(&location)
            );
            upload_data = false;
        }

        let resumable = if opts.resumable || self.config.general.use_resumable_state {
            let state = ResumableState::open(
                &backup_dir,
                opts.ledger_params(&self.config),
                Duration::from_millis(self.config.general.resumable_flush_interval_ms),
            )
            .await?;
            Some(Arc::new(state))
        } else {
            None
        };
        let flush_stop = CancellationToken::new();
        let flusher = resumable
            .as_ref()
            .and_then(|state| state.spawn_flusher(flush_stop.clone()));

        let uploader = Arc::new(TableUploader {
            backup_name: name.clone(),
            dst: dst.clone(),
            disks: disks.clone(),
            diff,
            resumable: resumable.clone(),
            semaphore: Semaphore::new(self.config.general.upload_concurrency),
            cancel: self.cancel_token.child_token(),
            stats: UploadStats::new(),
            max_file_size: self.config.general.max_file_size,
            embedded,
            upload_data,
            object_disk_path: self
                .config
                .object_disk_path()
                .map(str::to_string)
                .unwrap_or_default(),
        });

        // PerTablePartBatchAndUpload
        let result = uploader.clone().upload_tables(tables).await;
        let result = match result {
            Ok(_) if self.cancel_token.is_cancelled() => Err(BackupError::Cancelled),
            other => other,
        };
        flush_stop.cancel();
        if let Some(flusher) = flusher {
            if let Err(e) = flusher.await {
                warn!("resumable flusher failed: {}", e);
            }
        }
        let uploaded = match result {
            Ok(uploaded) => uploaded,
            Err(e) => {
                if let Some(state) = &resumable {
                    if let Err(flush_err) = state.flush().await {
                        warn!("can't flush {}: {}", state.path().display(), flush_err);
                    }
                }
                return Err(e);
            }
        };

        // MetadataPublish
        let summary = uploader.stats.summary(&name, uploaded.len());
        manifest.tables = uploaded;
        manifest.disks = disks.paths();
        manifest.disk_types = disks.types();
        manifest.compressed_size = summary.compressed_size;
        manifest.metadata_size = summary.metadata_size;
        if upload_data {
            manifest.data_size = summary.data_size;
            manifest.data_format = dst.data_format().to_string();
        }
        manifest.required_backup = diff_source.map(|d| d.backup_name().to_string());
        dst.put_json(&BackupMetadata::remote_key(&name), &manifest)
            .await
            .map_err(|e| e.in_table("publish manifest", format!("backup {}", name)))?;
        info!("Published manifest of {}", name);

        drop(uploader);
        if let Some(state) = resumable {
            match Arc::try_unwrap(state) {
                Ok(state) => state.close(true).await?,
                Err(state) => state.flush().await?,
            }
        }

        // RetentionEnforcement
        let removed = dst
            .remove_old_backups(self.config.general.backups_to_keep_remote)
            .await?;
        if !removed.is_empty() {
            info!("Removed {} old remote backups: {}", removed.len(), removed.join(", "));
        }

        info!("Upload done: {}", summary);
        Ok(summary)
    }
}

impl TableUploader {
    /// Upload every non-skipped table concurrently. The first failure cancels
    /// the remaining tables.
    async fn upload_tables(self: Arc<Self>, tables: Vec<Table>) -> Result<Vec<TableTitle>> {
        let mut handles = Vec::new();
        for table in tables {
            if table.backup_type == BackupType::None {
                debug!("skip {}", table.title());
                continue;
            }
            let uploader = self.clone();
            handles.push(tokio::spawn(async move {
                let title = table.title();
                let result = uploader.upload_table(table).await;
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        error!("{}", e);
                    }
                    uploader.cancel.cancel();
                }
                (title, result)
            }));
        }

        let mut uploaded = Vec::with_capacity(handles.len());
        let mut failure: Option<BackupError> = None;
        for handle in handles {
            match handle.await {
                Ok((title, Ok(()))) => uploaded.push(title),
                Ok((_, Err(e))) => keep_root_cause(&mut failure, e),
                Err(e) => keep_root_cause(
                    &mut failure,
                    BackupError::Storage(format!("upload task failed: {}", e)),
                ),
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        uploaded.sort();
        Ok(uploaded)
    }

    async fn upload_table(&self, table: Table) -> Result<()> {
        let title = table.title();
        let mut meta = table.meta;

        if self.upload_data && table.backup_type == BackupType::Full {
            let required = mark_required_parts(&mut meta, &self.diff);
            if required > 0 {
                debug!("{}: {} parts already in diff-from backup", title, required);
                self.stats.record_required(required);
            }
            let disks: Vec<String> = meta.parts.keys().cloned().collect();
            for disk in disks {
                let archives = self
                    .upload_disk(&meta, &disk)
                    .await
                    .map_err(|e| e.in_table("upload data", format!("{} disk {}", title, disk)))?;
                if !archives.is_empty() {
                    meta.files.insert(disk, archives);
                }
            }
        } else {
            meta.parts.clear();
            meta.files.clear();
            meta.metadata_only = true;
        }

        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled.in_table("upload metadata", title.to_string()));
        }
        self.upload_table_metadata(&meta)
            .await
            .map_err(|e| e.in_table("upload metadata", title.to_string()))?;
        info!("Uploaded {}", title);
        Ok(())
    }

    /// Batch and upload the parts of one disk, returning the archive names.
    async fn upload_disk(&self, meta: &TableMetadata, disk: &str) -> Result<Vec<String>> {
        let parts: Vec<Part> = meta
            .parts
            .get(disk)
            .map(|parts| parts.iter().filter(|p| !p.required).cloned().collect())
            .unwrap_or_default();
        if parts.is_empty() {
            return Ok(Vec::new());
        }
        if self.disks.is_object_disk(disk) && self.object_disk_path.is_empty() {
            return Err(BackupError::Config(format!(
                "disk '{}' is an object disk, set object_disk_path for the configured remote_storage",
                disk
            )));
        }

        let base = self
            .disks
            .table_data_path(disk, &self.backup_name, &meta.data_path(), self.embedded)?;
        let walk_base = base.clone();
        let max_file_size = self.max_file_size;
        let batches = tokio::task::spawn_blocking(move || {
            separate_parts(&walk_base, &parts, max_file_size)
        })
        .await
        .map_err(|e| BackupError::Storage(format!("part walk failed: {}", e)))??;
        debug!("{} parts of disk {} packed into {} batches", meta.title(), disk, batches.len());

        let extension = self.dst.extension();
        let uploads = batches.into_iter().enumerate().map(|(i, batch)| {
            let archive = format!("{}_{}.{}", disk, i + 1, extension);
            let key = meta.remote_archive_key(&self.backup_name, &archive);
            let base = &base;
            async move {
                self.upload_batch(base, batch, &key).await?;
                Ok::<_, BackupError>(archive)
            }
        });
        try_join_all(uploads).await
    }

    async fn upload_batch(&self, base: &Path, batch: Batch, key: &str) -> Result<()> {
        let data_size = batch.size;
        if let Some(state) = &self.resumable {
            if let Some(size) = state.is_done(key).await {
                debug!("{} already uploaded, skipping", key);
                self.stats.record_resumed(size, data_size);
                return Ok(());
            }
        }

        let _permit = self.acquire().await?;
        let size = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
            result = self.dst.compressed_stream_upload(base, batch.files, key) => result?,
        };

        if let Some(state) = &self.resumable {
            state.mark_done(key, size).await?;
        }
        self.stats.record_archive(size, data_size);
        debug!("uploaded {} ({} bytes)", key, size);
        Ok(())
    }

    async fn upload_table_metadata(&self, meta: &TableMetadata) -> Result<()> {
        let key = meta.remote_metadata_key(&self.backup_name);
        if let Some(state) = &self.resumable {
            if let Some(size) = state.is_done(&key).await {
                self.stats.record_metadata(size);
                return Ok(());
            }
        }

        let _permit = self.acquire().await?;
        let size = self.dst.put_json(&key, meta).await?;
        if let Some(state) = &self.resumable {
            state.mark_done(&key, size).await?;
        }
        self.stats.record_metadata(size);
        Ok(())
    }

    /// One permit per network operation, abandoned on cancellation.
    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
            permit = self.semaphore.acquire() => permit.map_err(|_| BackupError::Cancelled)?,
        };
        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        Ok(permit)
    }
}

/// Keep the first real failure; a cancellation caused by it is secondary.
fn keep_root_cause(slot: &mut Option<BackupError>, err: BackupError) {
    let replace = match slot {
        None => true,
        Some(current) => current.is_cancelled() && !err.is_cancelled(),
    };
    if replace {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionFormat, Config};
    use crate::clickhouse::Disk;
    use crate::metadata::{local_backup_path, table_path_encode};
    use crate::storage::archive::read_entries;
    use crate::testing::{MemoryStorage, MockDatabase};
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A local backup on disk: manifest, table metadata and shadow parts.
    struct Fixture {
        dir: TempDir,
        storage: Arc<MemoryStorage>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                storage: Arc::new(MemoryStorage::new()),
            }
        }

        fn data_path(&self) -> &Path {
            self.dir.path()
        }

        /// `parts` as (part name, [(file, size)]) on the `default` disk.
        fn add_backup(&self, name: &str, tables: &[(&str, &str, Vec<(&str, Vec<(&str, usize)>)>)]) {
            let backup_dir = local_backup_path(self.data_path(), name);
            let shadow = backup_dir.join("shadow");
            self.write_backup(&backup_dir, "default", |table| shadow.join(table).join("default"), name, tables);
        }

        /// Manifest and table metadata in `backup_dir`; parts keyed on `disk`
        /// with their files under `data_dir(<table data path>)`.
        fn write_backup(
            &self,
            backup_dir: &Path,
            disk: &str,
            data_dir: impl Fn(&str) -> PathBuf,
            name: &str,
            tables: &[(&str, &str, Vec<(&str, Vec<(&str, usize)>)>)],
        ) {
            let mut manifest = BackupMetadata::new(name);
            for (db, table, parts) in tables {
                let mut meta = TableMetadata {
                    database: db.to_string(),
                    table: table.to_string(),
                    query: format!("CREATE TABLE {}.{} (x UInt64) ENGINE = MergeTree ORDER BY x", db, table),
                    ..Default::default()
                };
                let part_root = data_dir(meta.data_path().as_str());
                let mut disk_parts = Vec::new();
                for (part, files) in parts {
                    fs::create_dir_all(part_root.join(part)).unwrap();
                    let mut size = 0;
                    for (file, len) in files {
                        fs::write(part_root.join(part).join(file), vec![b'z'; *len]).unwrap();
                        size += *len as u64;
                    }
                    disk_parts.push(Part::new(*part, size));
                }
                meta.parts.insert(disk.to_string(), disk_parts);

                let db_dir = backup_dir.join("metadata").join(table_path_encode(db));
                fs::create_dir_all(&db_dir).unwrap();
                fs::write(
                    db_dir.join(format!("{}.json", table_path_encode(table))),
                    serde_json::to_vec(&meta).unwrap(),
                )
                .unwrap();
                manifest.tables.push(meta.title());
            }
            fs::create_dir_all(&backup_dir).unwrap();
            fs::write(
                backup_dir.join("metadata.json"),
                serde_json::to_vec(&manifest).unwrap(),
            )
            .unwrap();
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config.general.remote_storage = "s3".to_string();
            config.general.upload_concurrency = 1;
            config.general.max_file_size = 100;
            config
        }

        fn backuper(&self, config: Config, db: MockDatabase) -> Backuper {
            let dst = BackupDestination::new(self.storage.clone(), CompressionFormat::Zstd, 3);
            Backuper::new(config, Arc::new(db))
                .unwrap()
                .with_destination(dst)
        }

        fn database(&self) -> MockDatabase {
            MockDatabase::with_default_disk(self.data_path())
        }

        fn remote_table(&self, backup: &str, db: &str, table: &str) -> Option<TableMetadata> {
            let title = TableMetadata {
                database: db.to_string(),
                table: table.to_string(),
                ..Default::default()
            };
            self.storage
                .object(&title.remote_metadata_key(backup))
                .map(|body| serde_json::from_slice(&body).unwrap())
        }

        fn remote_manifest(&self, backup: &str) -> Option<BackupMetadata> {
            self.storage
                .object(&BackupMetadata::remote_key(backup))
                .map(|body| serde_json::from_slice(&body).unwrap())
        }

        fn archive_files(&self, key: &str) -> Vec<String> {
            let body = self.storage.object(key).unwrap();
            read_entries(&body, CompressionFormat::Zstd)
                .into_iter()
                .map(|(name, _)| name)
                .collect()
        }
    }

    fn options(name: &str) -> UploadOptions {
        UploadOptions {
            backup_name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upload_full_backup() {
        let fx = Fixture::new();
        fx.add_backup(
            "b1",
            &[
                ("db", "events", vec![("all_1_1_0", vec![("data.bin", 60), ("idx", 30)])]),
                ("system", "parts", vec![("all_1_1_0", vec![("data.bin", 10)])]),
            ],
        );
        let mut backuper = fx.backuper(fx.config(), fx.database());

        let summary = backuper.upload(options("b1")).await.unwrap();
        assert_eq!(summary.tables, 1);
        assert_eq!(summary.archives_uploaded, 1);

        let table = fx.remote_table("b1", "db", "events").unwrap();
        assert_eq!(table.files["default"], vec!["default_1.tar.zst"]);
        assert_eq!(
            fx.archive_files("b1/shadow/db/events/default_1.tar.zst"),
            vec!["all_1_1_0/data.bin", "all_1_1_0/idx"]
        );
        assert!(fx.remote_table("b1", "system", "parts").is_none());

        let manifest = fx.remote_manifest("b1").unwrap();
        assert_eq!(manifest.tables, vec![TableTitle::new("db", "events")]);
        assert_eq!(manifest.data_format, "zstd");
        assert_eq!(manifest.data_size, 90);
        assert!(manifest.compressed_size > 0);
        assert!(manifest.metadata_size > 0);
        assert!(manifest.required_backup.is_none());
        assert_eq!(manifest.disk_types["default"], "local");
    }

    #[tokio::test]
    async fn test_batches_are_numbered_per_disk() {
        let fx = Fixture::new();
        fx.add_backup(
            "b1",
            &[(
                "db",
                "t",
                vec![
                    ("all_1_1_0", vec![("a", 80)]),
                    ("all_2_2_0", vec![("a", 80)]),
                    ("all_3_3_0", vec![("a", 10)]),
                ],
            )],
        );
        let mut backuper = fx.backuper(fx.config(), fx.database());
        backuper.upload(options("b1")).await.unwrap();

        let table = fx.remote_table("b1", "db", "t").unwrap();
        assert_eq!(
            table.files["default"],
            vec!["default_1.tar.zst", "default_2.tar.zst"]
        );
        assert_eq!(
            fx.archive_files("b1/shadow/db/t/default_2.tar.zst"),
            vec!["all_2_2_0/a", "all_3_3_0/a"]
        );
    }

    #[tokio::test]
    async fn test_diff_from_local_uploads_only_new_parts() {
        let fx = Fixture::new();
        fx.add_backup("base", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        fx.add_backup(
            "incr",
            &[(
                "db",
                "t",
                vec![("P", vec![("data.bin", 20)]), ("Q", vec![("data.bin", 20)])],
            )],
        );
        let mut backuper = fx.backuper(fx.config(), fx.database());
        let mut opts = options("incr");
        opts.diff_from = Some("base".to_string());

        let summary = backuper.upload(opts).await.unwrap();
        assert_eq!(summary.required_parts, 1);

        let uploaded: Vec<String> = fx
            .storage
            .file_puts()
            .iter()
            .flat_map(|key| fx.archive_files(key))
            .collect();
        assert_eq!(uploaded, vec!["Q/data.bin"]);

        let table = fx.remote_table("incr", "db", "t").unwrap();
        let parts = &table.parts["default"];
        assert!(parts.iter().find(|p| p.name == "P").unwrap().required);
        assert!(!parts.iter().find(|p| p.name == "Q").unwrap().required);
        assert_eq!(
            fx.remote_manifest("incr").unwrap().required_backup.as_deref(),
            Some("base")
        );
    }

    #[tokio::test]
    async fn test_diff_from_remote_uploads_only_new_parts() {
        let fx = Fixture::new();
        fx.add_backup("base", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        fx.add_backup(
            "incr",
            &[(
                "db",
                "t",
                vec![("P", vec![("data.bin", 20)]), ("Q", vec![("data.bin", 20)])],
            )],
        );
        let mut backuper = fx.backuper(fx.config(), fx.database());
        backuper.upload(options("base")).await.unwrap();
        let base_puts = fx.storage.file_puts().len();

        let mut opts = options("incr");
        opts.diff_from_remote = Some("base".to_string());
        backuper.upload(opts).await.unwrap();

        let new_puts = &fx.storage.file_puts()[base_puts..];
        assert_eq!(new_puts.len(), 1);
        assert_eq!(fx.archive_files(&new_puts[0]), vec!["Q/data.bin"]);
    }

    #[tokio::test]
    async fn test_diff_from_missing_remote_backup() {
        let fx = Fixture::new();
        fx.add_backup("incr", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        let mut backuper = fx.backuper(fx.config(), fx.database());
        let mut opts = options("incr");
        opts.diff_from_remote = Some("base".to_string());

        let err = backuper.upload(opts).await.unwrap_err();
        assert!(matches!(err, BackupError::RemoteBackupNotFound(_)));
        assert!(fx.storage.keys().is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_backup() {
        let fx = Fixture::new();
        let mut backuper = fx.backuper(fx.config(), fx.database());
        let err = backuper.upload(options("ghost")).await.unwrap_err();
        assert!(matches!(err, BackupError::LocalBackupNotFound(_)));
    }

    #[tokio::test]
    async fn test_both_diff_sources_rejected() {
        let fx = Fixture::new();
        let mut backuper = fx.backuper(fx.config(), fx.database());
        let mut opts = options("b1");
        opts.diff_from = Some("a".to_string());
        opts.diff_from_remote = Some("b".to_string());
        assert!(matches!(
            backuper.upload(opts).await,
            Err(BackupError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_schema_only_run() {
        let fx = Fixture::new();
        fx.add_backup("b1", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        let mut backuper = fx.backuper(fx.config(), fx.database());
        let mut opts = options("b1");
        opts.schema_only = true;

        backuper.upload(opts).await.unwrap();
        assert!(fx.storage.file_puts().is_empty());
        let table = fx.remote_table("b1", "db", "t").unwrap();
        assert!(table.metadata_only);
        assert!(table.parts.is_empty());
        assert!(table.files.is_empty());
        assert!(fx.remote_manifest("b1").is_some());
    }

    #[tokio::test]
    async fn test_sharded_replica_uploads_schema_for_foreign_tables() {
        let fx = Fixture::new();
        fx.add_backup(
            "b1",
            &[
                ("db", "mine", vec![("P", vec![("data.bin", 20)])]),
                ("db", "theirs", vec![("P", vec![("data.bin", 20)])]),
            ],
        );
        let mut db = fx.database();
        let status = |table: &str, active: &[&str]| crate::clickhouse::ReplicaStatus {
            database: "db".to_string(),
            table: table.to_string(),
            replica_name: "r1".to_string(),
            active_replicas: active.iter().map(|s| s.to_string()).collect(),
        };
        db.replicas = vec![status("mine", &["r1", "r2"]), status("theirs", &["r0", "r1"])];
        let mut config = fx.config();
        config.general.sharded_operation_mode = "first-replica".to_string();

        let mut backuper = fx.backuper(config, db);
        backuper.upload(options("b1")).await.unwrap();

        assert!(!fx.remote_table("b1", "db", "mine").unwrap().metadata_only);
        assert!(fx.remote_table("b1", "db", "theirs").unwrap().metadata_only);
        assert_eq!(fx.storage.file_puts(), vec!["b1/shadow/db/mine/default_1.tar.zst"]);
    }

    #[tokio::test]
    async fn test_resume_uploads_only_remaining_batches() {
        let fx = Fixture::new();
        fx.add_backup(
            "b1",
            &[(
                "db",
                "t",
                vec![
                    ("p1", vec![("a", 90)]),
                    ("p2", vec![("a", 90)]),
                    ("p3", vec![("a", 90)]),
                    ("p4", vec![("a", 90)]),
                ],
            )],
        );
        let mut opts = options("b1");
        opts.resumable = true;

        let cancel = CancellationToken::new();
        fx.storage.cancel_after(2, cancel.clone());
        let mut backuper = fx.backuper(fx.config(), fx.database()).with_cancel(cancel);
        let err = backuper.upload(opts.clone()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(fx.remote_table("b1", "db", "t").is_none());
        assert!(fx.remote_manifest("b1").is_none());

        let first: BTreeSet<String> = fx.storage.file_puts().into_iter().collect();
        assert_eq!(first.len(), 2);

        let mut backuper = fx.backuper(fx.config(), fx.database());
        let summary = backuper.upload(opts).await.unwrap();
        assert_eq!(summary.archives_uploaded, 2);
        assert_eq!(summary.archives_resumed, 2);

        let all = fx.storage.file_puts();
        let second: BTreeSet<String> = all[2..].iter().cloned().collect();
        assert_eq!(second.len(), 2);
        assert!(first.is_disjoint(&second));

        let table = fx.remote_table("b1", "db", "t").unwrap();
        assert_eq!(table.files["default"].len(), 4);
        assert!(!local_backup_path(fx.data_path(), "b1")
            .join(crate::resumable::STATE_FILE_NAME)
            .exists());
    }

    #[tokio::test]
    async fn test_resume_with_new_archive_limit_starts_over() {
        let fx = Fixture::new();
        fx.add_backup(
            "b1",
            &[(
                "db",
                "t",
                vec![
                    ("p1", vec![("a", 90)]),
                    ("p2", vec![("a", 90)]),
                    ("p3", vec![("a", 90)]),
                    ("p4", vec![("a", 90)]),
                ],
            )],
        );
        let mut opts = options("b1");
        opts.resumable = true;

        let cancel = CancellationToken::new();
        fx.storage.cancel_after(2, cancel.clone());
        let mut backuper = fx.backuper(fx.config(), fx.database()).with_cancel(cancel);
        assert!(backuper.upload(opts.clone()).await.unwrap_err().is_cancelled());

        // default_1 and default_2 now mean different part groupings
        let mut config = fx.config();
        config.general.max_file_size = 200;
        let mut backuper = fx.backuper(config, fx.database());
        let summary = backuper.upload(opts).await.unwrap();
        assert_eq!(summary.archives_uploaded, 2);
        assert_eq!(summary.archives_resumed, 0);

        let table = fx.remote_table("b1", "db", "t").unwrap();
        let files: BTreeSet<String> = table.files["default"]
            .iter()
            .flat_map(|archive| fx.archive_files(&format!("b1/shadow/db/t/{}", archive)))
            .collect();
        let expected: BTreeSet<String> = ["p1/a", "p2/a", "p3/a", "p4/a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(files, expected);
    }

    #[tokio::test]
    async fn test_failed_batch_fails_run_without_manifest() {
        let fx = Fixture::new();
        fx.add_backup(
            "b1",
            &[(
                "db",
                "t",
                vec![("p1", vec![("a", 90)]), ("p2", vec![("a", 90)])],
            )],
        );
        fx.storage.fail_file_puts_after(1);
        let mut backuper = fx.backuper(fx.config(), fx.database());

        let err = backuper.upload(options("b1")).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("upload data"));
        assert!(message.contains("`db`.`t` disk default"));
        assert!(fx.remote_manifest("b1").is_none());
    }

    #[tokio::test]
    async fn test_existing_remote_backup_rejected() {
        let fx = Fixture::new();
        fx.add_backup("b1", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        let mut backuper = fx.backuper(fx.config(), fx.database());
        backuper.upload(options("b1")).await.unwrap();

        let err = backuper.upload(options("b1")).await.unwrap_err();
        assert!(matches!(err, BackupError::RemoteBackupExists(_)));
    }

    #[tokio::test]
    async fn test_object_disk_requires_object_disk_path() {
        let fx = Fixture::new();
        fx.add_backup("b1", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        let mut db = fx.database();
        db.disks[0] = crate::clickhouse::Disk::new("default", &fx.data_path().to_string_lossy(), "s3");

        let mut backuper = fx.backuper(fx.config(), db);
        let err = backuper.upload(options("b1")).await.unwrap_err();
        assert!(err.to_string().contains("object_disk_path"));

        // encrypted disk whose path sits inside an s3 disk
        let fx = Fixture::new();
        let s3_path = fx.data_path().join("disks").join("s3");
        let enc_path = s3_path.join("encrypted");
        let backup_dir = local_backup_path(fx.data_path(), "b1");
        let shadow = enc_path.join("backup").join("b1").join("shadow");
        fx.write_backup(
            &backup_dir,
            "s3_enc",
            |table| shadow.join(table).join("s3_enc"),
            "b1",
            &[("db", "t", vec![("P", vec![("data.bin", 20)])])],
        );
        let mut db = fx.database();
        db.disks.push(Disk::new("s3", &format!("{}/", s3_path.display()), "s3"));
        db.disks.push(Disk::new("s3_enc", &format!("{}/", enc_path.display()), "encrypted"));

        let mut backuper = fx.backuper(fx.config(), db);
        let err = backuper.upload(options("b1")).await.unwrap_err();
        assert!(err.to_string().contains("object_disk_path"));
        assert!(err.to_string().contains("s3_enc"));
        assert!(fx.storage.file_puts().is_empty());
    }

    #[tokio::test]
    async fn test_embedded_backup_read_from_backup_disk() {
        let fx = Fixture::new();
        let backups = TempDir::new().unwrap();
        let backup_dir = backups.path().join("b1");
        let data = backup_dir.join("data");
        fx.write_backup(
            &backup_dir,
            "backups",
            |table| data.join(table),
            "b1",
            &[("db", "t", vec![("P", vec![("data.bin", 20)])])],
        );
        let mut db = fx.database();
        let mut disk = Disk::new("backups", &backups.path().to_string_lossy(), "local");
        disk.is_backup = true;
        db.disks.push(disk);
        let mut config = fx.config();
        config.clickhouse.use_embedded_backup_restore = true;
        config.clickhouse.embedded_backup_disk = "backups".to_string();

        let mut backuper = fx.backuper(config, db);
        let summary = backuper.upload(options("b1")).await.unwrap();
        assert_eq!(summary.tables, 1);
        assert_eq!(summary.archives_uploaded, 1);

        let table = fx.remote_table("b1", "db", "t").unwrap();
        assert_eq!(table.files["backups"], vec!["backups_1.tar.zst"]);
        assert_eq!(
            fx.archive_files("b1/shadow/db/t/backups_1.tar.zst"),
            vec!["P/data.bin"]
        );
        assert!(fx.remote_manifest("b1").is_some());
    }

    #[tokio::test]
    async fn test_embedded_diff_base_read_from_backup_disk() {
        let fx = Fixture::new();
        let backups = TempDir::new().unwrap();
        for (name, parts) in [("base", vec!["P"]), ("incr", vec!["P", "Q"])] {
            let backup_dir = backups.path().join(name);
            let data = backup_dir.join("data");
            let parts: Vec<_> = parts.into_iter().map(|p| (p, vec![("data.bin", 20)])).collect();
            fx.write_backup(&backup_dir, "backups", |table| data.join(table), name, &[("db", "t", parts)]);
        }
        let mut db = fx.database();
        let mut disk = Disk::new("backups", &backups.path().to_string_lossy(), "local");
        disk.is_backup = true;
        db.disks.push(disk);
        let mut config = fx.config();
        config.clickhouse.use_embedded_backup_restore = true;
        config.clickhouse.embedded_backup_disk = "backups".to_string();

        let mut backuper = fx.backuper(config, db);
        let mut opts = options("incr");
        opts.diff_from = Some("base".to_string());
        let summary = backuper.upload(opts).await.unwrap();
        assert_eq!(summary.required_parts, 1);
        assert_eq!(
            fx.archive_files("incr/shadow/db/t/backups_1.tar.zst"),
            vec!["Q/data.bin"]
        );
    }

    #[tokio::test]
    async fn test_retention_after_upload() {
        let fx = Fixture::new();
        fx.add_backup("b1", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        fx.add_backup("b2", &[("db", "t", vec![("P", vec![("data.bin", 20)])])]);
        let mut config = fx.config();
        config.general.backups_to_keep_remote = 1;

        let mut backuper = fx.backuper(config.clone(), fx.database());
        backuper.upload(options("b1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut backuper = fx.backuper(config, fx.database());
        backuper.upload(options("b2")).await.unwrap();

        assert!(fx.remote_manifest("b1").is_none());
        assert!(fx.remote_manifest("b2").is_some());
    }

    #[tokio::test]
    async fn test_none_remote_storage_is_a_no_op() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.general.remote_storage = "none".to_string();
        let mut backuper = fx.backuper(config, fx.database());
        let summary = backuper.upload(options("b1")).await.unwrap();
        assert_eq!(summary.tables, 0);
        assert!(fx.storage.keys().is_empty());
    }

    #[test]
    fn test_keep_root_cause() {
        let mut slot = None;
        keep_root_cause(&mut slot, BackupError::Cancelled);
        keep_root_cause(&mut slot, BackupError::Storage("boom".to_string()));
        keep_root_cause(&mut slot, BackupError::Storage("later".to_string()));
        assert_eq!(slot.unwrap().to_string(), "Storage error: boom");
    }
}
