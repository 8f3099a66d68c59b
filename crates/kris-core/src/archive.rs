//! Deterministic zip archives of project directories.
//!
//! Entries are written in file-name order with a fixed timestamp, so the same
//! tree always yields the same bytes and therefore the same object key.

use std::fs::File;
use std::io;
use std::path::{Component, Path};

use tracing::debug;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::{KrisError, Result};

pub const ARCHIVE_FILE_NAME: &str = "archive.zip";

/// Writes the contents of `src` (not `src` itself) to the zip file `dest`.
pub fn archive_dir(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(KrisError::InvalidRequest(format!(
            "{} is not a directory",
            src.display()
        )));
    }

    let mut zip = ZipWriter::new(File::create(dest)?);
    let mut entries = 0usize;
    // Symlinks are not followed: a linked file is stored by content, a
    // linked directory or a dangling link is left out.
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let name = entry_name(src, entry.path())?;
        let file_type = entry.file_type();
        let metadata = if file_type.is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => target,
                _ => {
                    debug!(path = %entry.path().display(), "skipping symlink");
                    continue;
                }
            }
        } else {
            entry.metadata().map_err(io::Error::from)?
        };
        let options = entry_options(&metadata);

        if metadata.is_dir() {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options)?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
        }
        entries += 1;
    }
    zip.finish()?;
    debug!(src = %src.display(), dest = %dest.display(), entries, "archived directory");
    Ok(())
}

/// Unpacks `archive` into `dest`, restoring unix modes.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    zip.extract(dest)?;
    Ok(())
}

fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        KrisError::InvalidRequest(format!("{} escapes {}", path.display(), root.display()))
    })?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                KrisError::InvalidRequest(format!("{} is not valid UTF-8", path.display()))
            })?),
            _ => {
                return Err(KrisError::InvalidRequest(format!(
                    "unexpected path component in {}",
                    path.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

fn entry_options(metadata: &std::fs::Metadata) -> FileOptions {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options.unix_permissions(metadata.permissions().mode() & 0o777)
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        options
    }
}
