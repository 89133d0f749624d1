//! Packing of part files into size-bounded archive batches.

use crate::fs::walker::walk_files;
use crate::metadata::Part;
use crate::utils::Result;
use std::path::Path;

/// Files of one archive, relative to the table's local data path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub files: Vec<String>,
    pub size: u64,
}

/// Walk every part under `base` in order and pack the files into batches of
/// at most `max_batch_bytes`. A single file larger than the limit gets a
/// batch of its own. Batches are never empty.
pub fn separate_parts(base: &Path, parts: &[Part], max_batch_bytes: u64) -> Result<Vec<Batch>> {
    let mut batches = Vec::new();
    let mut current = Batch::default();

    for part in parts {
        for file in walk_files(base, &part.name)? {
            if !current.files.is_empty() && current.size + file.size > max_batch_bytes {
                batches.push(std::mem::take(&mut current));
            }
            current.size += file.size;
            current.files.push(file.relative_path);
        }
    }
    if !current.files.is_empty() {
        batches.push(current);
    }

    Ok(batches)
}
