//! Directory traversal of part directories.
//!
//! Files come back in a stable, name-sorted order so that repeated runs over
//! the same shadow copy produce the same batches.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A regular file discovered during walking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk base, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, base: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path
            .strip_prefix(base)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
        })
    }
}

/// Walk `base/<dir>` and collect its regular files, relative to `base`.
///
/// Symlinks are not followed and are not collected. Any error while
/// walking aborts the whole walk.
pub fn walk_files(base: &Path, dir: &str) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(base.join(dir))
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        files.push(FileInfo::from_entry(&entry, base)?);
    }

    Ok(files)
}
