//! Tar archives of part files, optionally zstd compressed.

use crate::config::CompressionFormat;
use crate::utils::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tar::Builder;
use tempfile::NamedTempFile;

/// Pack `files` (relative to `base`) into a temporary archive.
///
/// Entry names are the relative paths, so unpacking the archive under the
/// same base directory recreates the part directories.
pub fn build_archive(
    base: &Path,
    files: &[String],
    format: CompressionFormat,
    level: i32,
) -> Result<NamedTempFile> {
    let temp = NamedTempFile::new()?;
    let file = temp.reopen()?;

    match format {
        CompressionFormat::Tar => {
            let inner = append_files(Builder::new(file), base, files)?;
            inner.sync_all()?;
        }
        CompressionFormat::Zstd => {
            let encoder = zstd::Encoder::new(file, level)?;
            let encoder = append_files(Builder::new(encoder), base, files)?;
            let mut file = encoder.finish()?;
            file.flush()?;
            file.sync_all()?;
        }
    }

    Ok(temp)
}

fn append_files<W: Write>(mut builder: Builder<W>, base: &Path, files: &[String]) -> Result<W> {
    builder.follow_symlinks(false);
    for name in files {
        let path = base.join(name);
        let mut file = File::open(&path)?;
        builder.append_file(name, &mut file)?;
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
pub(crate) fn read_entries(archive: &[u8], format: CompressionFormat) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let reader: Box<dyn Read + '_> = match format {
        CompressionFormat::Tar => Box::new(archive),
        CompressionFormat::Zstd => Box::new(zstd::Decoder::new(archive).unwrap()),
    };
    let mut tar = tar::Archive::new(reader);
    let mut entries = Vec::new();
    for entry in tar.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        entries.push((name, content));
    }
    entries
}
