//! Backup-level operations on top of a [`RemoteStorage`].

use super::archive::build_archive;
use super::{RemoteStorage, S3Storage};
use crate::config::{CompressionFormat, Config, RemoteStorageKind};
use crate::metadata::BackupMetadata;
use crate::utils::{BackupError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A backup found on remote storage.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub name: String,
    pub metadata: Option<BackupMetadata>,
    /// Why the backup is unusable, if it is
    pub broken: Option<String>,
}

impl BackupSummary {
    pub fn creation_date(&self) -> Option<DateTime<Utc>> {
        self.metadata.as_ref().map(|m| m.creation_date)
    }

    pub fn is_complete(&self) -> bool {
        self.broken.is_none() && self.metadata.is_some()
    }
}

pub struct BackupDestination {
    storage: Arc<dyn RemoteStorage>,
    compression: CompressionFormat,
    compression_level: i32,
}

impl BackupDestination {
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        compression: CompressionFormat,
        compression_level: i32,
    ) -> Self {
        Self {
            storage,
            compression,
            compression_level,
        }
    }

    /// Build the client for the configured provider and check it is reachable.
    pub async fn connect(config: &Config) -> Result<Self> {
        let kind = config.remote_storage()?;
        let storage: Arc<dyn RemoteStorage> = match kind {
            RemoteStorageKind::S3 => Arc::new(S3Storage::from_s3_config(&config.s3).await?),
            RemoteStorageKind::Gcs => Arc::new(S3Storage::from_gcs_config(&config.gcs).await?),
            RemoteStorageKind::AzBlob => {
                return Err(BackupError::Config(
                    "remote_storage 'azblob' is only supported for embedded backup locations"
                        .to_string(),
                ))
            }
            RemoteStorageKind::None | RemoteStorageKind::Custom => {
                return Err(BackupError::Config(format!(
                    "remote_storage '{}' has no destination to connect to",
                    config.general.remote_storage
                )))
            }
        };
        storage.connect().await?;
        Ok(Self::new(
            storage,
            config.compression_format()?,
            config.general.compression_level,
        ))
    }

    pub fn kind(&self) -> &'static str {
        self.storage.kind()
    }

    pub fn extension(&self) -> &'static str {
        self.compression.extension()
    }

    pub fn data_format(&self) -> &'static str {
        match self.compression {
            CompressionFormat::Tar => "tar",
            CompressionFormat::Zstd => "zstd",
        }
    }

    /// Archive `files` (relative to `base`) and upload the archive to `key`.
    /// Returns the size of the uploaded archive.
    pub async fn compressed_stream_upload(
        &self,
        base: &Path,
        files: Vec<String>,
        key: &str,
    ) -> Result<u64> {
        let base: PathBuf = base.to_path_buf();
        let format = self.compression;
        let level = self.compression_level;
        let archive = tokio::task::spawn_blocking(move || build_archive(&base, &files, format, level))
            .await
            .map_err(|e| BackupError::Storage(format!("archive task failed: {}", e)))??;

        self.storage.put_file(key, archive.path()).await
    }

    pub async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()> {
        self.storage.put_bytes(key, body).await
    }

    /// Serialize `value` as pretty JSON and upload it. Returns the body size.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<u64> {
        let body = serde_json::to_vec_pretty(value)?;
        let size = body.len() as u64;
        self.storage.put_bytes(key, Bytes::from(body)).await?;
        Ok(size)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.get_bytes(key).await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    /// Backups on remote storage, oldest first. With `filter` set only the
    /// backup of that name is returned.
    pub async fn backup_list(&self, with_metadata: bool, filter: &str) -> Result<Vec<BackupSummary>> {
        let mut names: Vec<String> = self
            .storage
            .list("", false)
            .await?
            .into_iter()
            .filter(|o| o.is_prefix())
            .map(|o| o.key.trim_end_matches('/').to_string())
            .filter(|name| !name.is_empty() && (filter.is_empty() || name == filter))
            .collect();
        names.sort();

        let mut backups = Vec::with_capacity(names.len());
        for name in names {
            if !with_metadata {
                backups.push(BackupSummary {
                    name,
                    metadata: None,
                    broken: None,
                });
                continue;
            }
            let summary = match self.storage.get_bytes(&BackupMetadata::remote_key(&name)).await? {
                None => BackupSummary {
                    name,
                    metadata: None,
                    broken: Some("broken (can't stat metadata.json)".to_string()),
                },
                Some(body) => match serde_json::from_slice::<BackupMetadata>(&body) {
                    Ok(metadata) => BackupSummary {
                        name,
                        metadata: Some(metadata),
                        broken: None,
                    },
                    Err(e) => BackupSummary {
                        name,
                        metadata: None,
                        broken: Some(format!("broken (can't parse metadata.json: {})", e)),
                    },
                },
            };
            backups.push(summary);
        }

        backups.sort_by_key(|b| b.creation_date());
        Ok(backups)
    }

    /// Delete complete backups beyond the newest `keep`. Backups that a kept
    /// backup depends on through `required_backup` are never deleted.
    /// `keep == 0` keeps everything.
    pub async fn remove_old_backups(&self, keep: usize) -> Result<Vec<String>> {
        if keep == 0 {
            return Ok(Vec::new());
        }
        let backups: Vec<BackupSummary> = self
            .backup_list(true, "")
            .await?
            .into_iter()
            .filter(BackupSummary::is_complete)
            .collect();

        let doomed = backups_to_delete(&backups, keep);
        for name in &doomed {
            let keys: Vec<String> = self
                .storage
                .list(&format!("{}/", name), true)
                .await?
                .into_iter()
                .filter(|o| !o.is_prefix())
                .map(|o| o.key)
                .collect();
            if keys.is_empty() {
                warn!("remote backup {} is already empty", name);
                continue;
            }
            self.storage.delete(&keys).await?;
            info!("Removed old remote backup {} ({} objects)", name, keys.len());
        }
        Ok(doomed)
    }
}

/// `backups` sorted oldest first.
fn backups_to_delete(backups: &[BackupSummary], keep: usize) -> Vec<String> {
    if backups.len() <= keep {
        return Vec::new();
    }
    let required_by: HashMap<&str, &str> = backups
        .iter()
        .filter_map(|b| {
            let required = b.metadata.as_ref()?.required_backup.as_deref()?;
            Some((b.name.as_str(), required))
        })
        .collect();

    let split = backups.len() - keep;
    let mut protected: HashSet<&str> = HashSet::new();
    for kept in &backups[split..] {
        let mut current = kept.name.as_str();
        while let Some(&required) = required_by.get(current) {
            if !protected.insert(required) {
                break;
            }
            current = required;
        }
    }

    backups[..split]
        .iter()
        .map(|b| b.name.as_str())
        .filter(|name| !protected.contains(name))
        .map(str::to_string)
        .collect()
}
