//! Disk snapshot taken at upload start and the object-disk classification.

use crate::clickhouse::{Disk, DiskType};
use crate::metadata::local_backup_path;
use crate::utils::{BackupError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// True for disks whose data lives in an object store.
pub fn is_object_disk_type(disk_type: &DiskType) -> bool {
    matches!(disk_type, DiskType::S3 | DiskType::AzureBlob)
}

/// True for an encrypted disk layered over an object disk: some object
/// disk's path is a prefix of the encrypted disk's path. The longest
/// matching path wins.
pub fn is_encrypted_over_object(disk: &Disk, disks: &[Disk]) -> bool {
    if disk.disk_type != DiskType::Encrypted {
        return false;
    }
    disks
        .iter()
        .filter(|d| d.name != disk.name && !d.path.is_empty() && disk.path.starts_with(&d.path))
        .max_by_key(|d| d.path.len())
        .map(|underlying| is_object_disk_type(&underlying.disk_type))
        .unwrap_or(false)
}

/// Disks as reported by the server, fixed for the duration of one run.
#[derive(Debug, Clone)]
pub struct DiskSnapshot {
    disks: Vec<Disk>,
    default_data_path: PathBuf,
    embedded_data_path: Option<PathBuf>,
}

impl DiskSnapshot {
    pub fn new(disks: Vec<Disk>, default_data_path: impl Into<PathBuf>) -> Self {
        Self {
            disks,
            default_data_path: default_data_path.into(),
            embedded_data_path: None,
        }
    }

    /// Switch to embedded mode: local backups live directly under the path
    /// of the backup disk. The last disk flagged as a backup disk or named
    /// `backup_disk` wins; without one the default data path is used.
    pub fn with_embedded_backup_disk(mut self, backup_disk: &str) -> Self {
        let path = self
            .disks
            .iter()
            .rev()
            .find(|d| d.is_backup || (!backup_disk.is_empty() && d.name == backup_disk))
            .map(|d| PathBuf::from(&d.path))
            .unwrap_or_else(|| self.default_data_path.clone());
        self.embedded_data_path = Some(path);
        self
    }

    pub fn embedded_data_path(&self) -> Option<&Path> {
        self.embedded_data_path.as_deref()
    }

    /// Directory of the local backup `name`: `<embedded path>/<name>` in
    /// embedded mode, `<default data path>/backup/<name>` otherwise.
    pub fn local_backup_dir(&self, backup_name: &str) -> PathBuf {
        match &self.embedded_data_path {
            Some(path) => path.join(backup_name),
            None => local_backup_path(&self.default_data_path, backup_name),
        }
    }

    pub fn default_data_path(&self) -> &Path {
        &self.default_data_path
    }

    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    pub fn get(&self, name: &str) -> Option<&Disk> {
        self.disks.iter().find(|d| d.name == name)
    }

    /// Native object disk or encrypted disk over one.
    pub fn is_object_disk(&self, name: &str) -> bool {
        match self.get(name) {
            Some(disk) => {
                is_object_disk_type(&disk.disk_type) || is_encrypted_over_object(disk, &self.disks)
            }
            None => false,
        }
    }

    /// disk name -> path, for the root manifest
    pub fn paths(&self) -> BTreeMap<String, String> {
        self.disks
            .iter()
            .map(|d| (d.name.clone(), d.path.clone()))
            .collect()
    }

    /// disk name -> type, for the root manifest
    pub fn types(&self) -> BTreeMap<String, String> {
        self.disks
            .iter()
            .map(|d| (d.name.clone(), d.disk_type.to_string()))
            .collect()
    }

    /// Local directory holding a table's part directories on `disk`.
    ///
    /// `<disk>/backup/<backup>/shadow/<table path>/<disk name>` for regular
    /// backups, `<disk>/<backup>/data/<table path>` for embedded ones.
    pub fn table_data_path(
        &self,
        disk: &str,
        backup_name: &str,
        table_data_path: &str,
        embedded: bool,
    ) -> Result<PathBuf> {
        let disk_path = self
            .get(disk)
            .map(|d| Path::new(&d.path))
            .ok_or_else(|| BackupError::Config(format!("disk '{}' not found on the server", disk)))?;

        let path = if embedded {
            disk_path.join(backup_name).join("data").join(table_data_path)
        } else {
            disk_path
                .join("backup")
                .join(backup_name)
                .join("shadow")
                .join(table_data_path)
                .join(disk)
        };
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> DiskSnapshot {
        DiskSnapshot::new(
            vec![
                Disk::new("default", "/var/lib/clickhouse/", "local"),
                Disk::new("s3", "/var/lib/clickhouse/disks/s3/", "s3"),
                Disk::new("s3_enc", "/var/lib/clickhouse/disks/s3/encrypted/", "encrypted"),
                Disk::new("local_enc", "/var/lib/clickhouse/disks/enc/", "encrypted"),
                Disk::new("azure", "/var/lib/clickhouse/disks/azure/", "azure_blob_storage"),
            ],
            "/var/lib/clickhouse/",
        )
    }

    #[test]
    fn test_object_disk_classification() {
        let snap = snapshot();
        assert!(!snap.is_object_disk("default"));
        assert!(snap.is_object_disk("s3"));
        assert!(snap.is_object_disk("azure"));
        assert!(snap.is_object_disk("s3_enc"));
        assert!(!snap.is_object_disk("local_enc"));
        assert!(!snap.is_object_disk("missing"));
    }

    #[test]
    fn test_table_data_path() {
        let snap = snapshot();
        assert_eq!(
            snap.table_data_path("default", "b1", "db/t", false).unwrap(),
            PathBuf::from("/var/lib/clickhouse/backup/b1/shadow/db/t/default")
        );
        assert_eq!(
            snap.table_data_path("s3", "b1", "db/t", true).unwrap(),
            PathBuf::from("/var/lib/clickhouse/disks/s3/b1/data/db/t")
        );
        assert!(snap.table_data_path("nope", "b1", "db/t", false).is_err());
    }

    #[test]
    fn test_local_backup_dir_regular() {
        let snap = snapshot();
        assert!(snap.embedded_data_path().is_none());
        assert_eq!(
            snap.local_backup_dir("b1"),
            PathBuf::from("/var/lib/clickhouse/backup/b1")
        );
    }

    #[test]
    fn test_embedded_path_from_backup_flag() {
        let mut disks = snapshot().disks().to_vec();
        let mut backups = Disk::new("backups", "/var/lib/clickhouse/disks/backups/", "local");
        backups.is_backup = true;
        disks.push(backups);
        let snap = DiskSnapshot::new(disks, "/var/lib/clickhouse/").with_embedded_backup_disk("");
        assert_eq!(
            snap.embedded_data_path(),
            Some(Path::new("/var/lib/clickhouse/disks/backups/"))
        );
        assert_eq!(
            snap.local_backup_dir("b1"),
            PathBuf::from("/var/lib/clickhouse/disks/backups/b1")
        );
    }

    #[test]
    fn test_embedded_path_from_disk_name() {
        let snap = snapshot().with_embedded_backup_disk("s3");
        assert_eq!(
            snap.local_backup_dir("b1"),
            PathBuf::from("/var/lib/clickhouse/disks/s3/b1")
        );
    }

    #[test]
    fn test_embedded_path_falls_back_to_default() {
        let snap = snapshot().with_embedded_backup_disk("missing");
        assert_eq!(snap.embedded_data_path(), Some(Path::new("/var/lib/clickhouse/")));
        assert_eq!(snap.local_backup_dir("b1"), PathBuf::from("/var/lib/clickhouse/b1"));
    }

    #[test]
    fn test_manifest_maps() {
        let snap = snapshot();
        assert_eq!(snap.types().get("azure").map(String::as_str), Some("azure_blob_storage"));
        assert_eq!(snap.paths().len(), 5);
    }
}
