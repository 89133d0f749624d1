//! chbackup library
//!
//! Uploads local ClickHouse shadow backups to object storage: sharding-aware
//! across replicas, incremental against an earlier backup, resumable after a
//! crash.

pub mod backup;
pub mod clickhouse;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod metadata;
pub mod resumable;
pub mod storage;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use backup::{Backuper, UploadOptions};
pub use config::Config;
pub use utils::errors::{BackupError, Result};
