//! In-memory collaborators for unit tests.

use crate::clickhouse::{Database, Disk, ReplicaStatus};
use crate::metadata::{TablePattern, TableMetadata};
use crate::storage::{RemoteObject, RemoteStorage};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Bytes>>,
    file_puts: Mutex<Vec<String>>,
    fail_after: Mutex<Option<usize>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `put_file` after the first `n` fails.
    pub fn fail_file_puts_after(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    /// Cancel `token` once `n` files have been stored.
    pub fn cancel_after(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((n, token));
    }

    pub fn insert(&self, key: &str, body: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::copy_from_slice(body));
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Keys passed to successful `put_file` calls, in call order.
    pub fn file_puts(&self) -> Vec<String> {
        self.file_puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> Result<u64> {
        let done = self.file_puts.lock().unwrap().len();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if done >= limit {
                return Err(BackupError::Storage(format!("injected failure for {}", key)));
            }
        }

        let body = tokio::fs::read(local_path).await?;
        let size = body.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from(body));
        let done = {
            let mut puts = self.file_puts.lock().unwrap();
            puts.push(key.to_string());
            puts.len()
        };

        if let Some((limit, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if done >= *limit {
                token.cancel();
            }
        }
        Ok(size)
    }

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()> {
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.object(key))
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<RemoteObject>> {
        let objects = self.objects.lock().unwrap();
        let mut prefixes = BTreeSet::new();
        let mut out = Vec::new();
        for (key, body) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match rest.find('/') {
                Some(i) if !recursive => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..=i]));
                }
                _ => out.push(RemoteObject {
                    key: key.clone(),
                    size: body.len() as u64,
                    last_modified: Some(Utc::now()),
                }),
            }
        }
        out.extend(prefixes.into_iter().map(|key| RemoteObject {
            key,
            size: 0,
            last_modified: None,
        }));
        Ok(out)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}

/// Database answering from fixed data.
#[derive(Default)]
pub struct MockDatabase {
    pub disks: Vec<Disk>,
    pub tables: Vec<TableMetadata>,
    pub replicas: Vec<ReplicaStatus>,
    pub macros: Vec<(String, String)>,
    pub shard_unsupported: bool,
}

impl MockDatabase {
    pub fn with_default_disk(path: &Path) -> Self {
        Self {
            disks: vec![Disk::new("default", &path.to_string_lossy(), "local")],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn list_disks(&self) -> Result<Vec<Disk>> {
        Ok(self.disks.clone())
    }

    async fn list_tables(&self, pattern: &TablePattern, _with_parts: bool) -> Result<Vec<TableMetadata>> {
        Ok(self
            .tables
            .iter()
            .filter(|t| pattern.matches(&t.database, &t.table))
            .cloned()
            .collect())
    }

    async fn apply_macros(&self, template: &str) -> Result<String> {
        Ok(crate::clickhouse::substitute_macros(
            template,
            self.macros.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }

    async fn can_shard_operation(&self) -> Result<()> {
        if self.shard_unsupported {
            return Err(BackupError::ShardOperationUnsupported("21.3.1".to_string()));
        }
        Ok(())
    }

    async fn replica_view(&self) -> Result<Vec<ReplicaStatus>> {
        Ok(self.replicas.clone())
    }
}
