//! Backuper: uploads a local shadow backup to remote storage.
//!
//! One run moves through disk resolution, optional diff resolution, shard
//! assignment, per-table batching and upload, metadata publishing and
//! retention. See [`Backuper::upload`].

pub mod batch;
pub mod diff;
pub mod disks;
pub mod location;
pub mod shard;
mod upload;

use crate::clickhouse::Database;
use crate::config::{Config, RemoteStorageKind};
use crate::metadata::{TablePattern, TableMetadata, TableTitle};
use crate::storage::{BackupDestination, BackupSummary};
use crate::utils::{BackupError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use diff::DiffSource;
pub use disks::DiskSnapshot;
pub use shard::{BackupType, ShardMode};
pub use upload::UploadOptions;

/// A table of the backup being uploaded.
#[derive(Debug, Clone)]
pub struct Table {
    pub meta: TableMetadata,
    /// Matched by `general.skip_tables`
    pub skip: bool,
    pub backup_type: BackupType,
}

impl Table {
    pub fn new(meta: TableMetadata, skip: bool) -> Self {
        let backup_type = if skip {
            BackupType::None
        } else {
            BackupType::Full
        };
        Self {
            meta,
            skip,
            backup_type,
        }
    }

    pub fn title(&self) -> TableTitle {
        self.meta.title()
    }
}

pub struct Backuper {
    config: Config,
    db: Arc<dyn Database>,
    shard_mode: Option<ShardMode>,
    dst: Option<Arc<BackupDestination>>,
    disks: Option<Arc<DiskSnapshot>>,
    cancel_token: CancellationToken,
}

impl Backuper {
    /// Validates the configuration before anything talks to the network.
    pub fn new(config: Config, db: Arc<dyn Database>) -> Result<Self> {
        config.validate()?;
        let shard_mode = ShardMode::from_config(&config.general.sharded_operation_mode)?;
        Ok(Self {
            config,
            db,
            shard_mode,
            dst: None,
            disks: None,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Use an already connected destination instead of building one from
    /// the configuration.
    pub fn with_destination(mut self, dst: BackupDestination) -> Self {
        self.dst = Some(Arc::new(dst));
        self
    }

    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enumerate disks once; every later step reads this snapshot.
    async fn resolve_disks(&mut self) -> Result<Arc<DiskSnapshot>> {
        if let Some(disks) = &self.disks {
            return Ok(disks.clone());
        }
        let disks = self.db.list_disks().await?;
        let default_data_path = self.db.default_data_path(&disks)?;
        debug!("{} disks, default data path {}", disks.len(), default_data_path);

        let mut snapshot = DiskSnapshot::new(disks, PathBuf::from(default_data_path));
        if self.config.clickhouse.use_embedded_backup_restore {
            snapshot = snapshot.with_embedded_backup_disk(&self.config.clickhouse.embedded_backup_disk);
            if let Some(path) = snapshot.embedded_data_path() {
                debug!("embedded backup data path {}", path.display());
            }
        }
        let snapshot = Arc::new(snapshot);
        self.disks = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn connect_destination(&mut self) -> Result<Arc<BackupDestination>> {
        if let Some(dst) = &self.dst {
            return Ok(dst.clone());
        }
        let kind = self.config.remote_storage()?;
        if !kind.is_managed() {
            return Err(BackupError::Config(format!(
                "general->remote_storage is '{}', nothing to connect to",
                self.config.general.remote_storage
            )));
        }
        let dst = Arc::new(BackupDestination::connect(&self.config).await.map_err(|e| {
            BackupError::Storage(format!("can't connect to {}: {}", self.config.general.remote_storage, e))
        })?);
        info!("Connected to {} remote storage", dst.kind());
        self.dst = Some(dst.clone());
        Ok(dst)
    }

    /// Backups on remote storage, oldest first.
    pub async fn list_remote(&mut self) -> Result<Vec<BackupSummary>> {
        if self.config.remote_storage()? == RemoteStorageKind::None {
            return Ok(Vec::new());
        }
        let dst = self.connect_destination().await?;
        dst.backup_list(true, "").await
    }

    /// Live tables of the server matching `pattern`, with their skip flag.
    pub async fn list_tables(&self, pattern: &str) -> Result<Vec<Table>> {
        let pattern = TablePattern::parse(pattern)?;
        let skip = TablePattern::from_list(&self.config.general.skip_tables)?;
        let tables = self.db.list_tables(&pattern, false).await?;
        Ok(tables
            .into_iter()
            .map(|meta| {
                let skipped = skip.matches_any(&meta.database, &meta.table);
                Table::new(meta, skipped)
            })
            .collect())
    }
}
