//! Remote object storage.
//!
//! [`RemoteStorage`] is the narrow set of object operations the upload
//! pipeline needs. Keys are always relative to the configured storage
//! prefix; implementations add and strip it.

pub mod archive;
pub mod destination;
pub mod s3;

use crate::utils::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;

pub use destination::{BackupDestination, BackupSummary};
pub use s3::S3Storage;

/// One object (or, for non-recursive listings, one common prefix ending
/// in `/`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl RemoteObject {
    pub fn is_prefix(&self) -> bool {
        self.key.ends_with('/')
    }
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Provider name used in log lines.
    fn kind(&self) -> &'static str;

    /// Check that the bucket (or container) is reachable.
    async fn connect(&self) -> Result<()>;

    /// Upload a local file, returning the number of bytes sent.
    async fn put_file(&self, key: &str, local_path: &Path) -> Result<u64>;

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()>;

    /// `None` when the object does not exist.
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>>;

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<RemoteObject>>;

    async fn delete(&self, keys: &[String]) -> Result<()>;
}
