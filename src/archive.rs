//! Deterministic zip packaging of the download directory.
//!
//! Entries are added in sorted path order with a fixed timestamp and mode, so
//! the same input files always produce the same archive bytes. Paths inside
//! the archive mirror the directory exactly; the result is a plain zip that
//! `zipimport` can put on `sys.path` as-is.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::config::ArchiveCompression;
use crate::error::ArchiveError;

/// The archive a run produced, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub entries: usize,
    pub size_bytes: u64,
    pub sha256: String,
}

impl ArchiveArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn entry_options(compression: ArchiveCompression) -> SimpleFileOptions {
    let method = match compression {
        ArchiveCompression::Stored => CompressionMethod::Stored,
        ArchiveCompression::Deflated => CompressionMethod::Deflated,
    };
    SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

/// Relative, `/`-separated archive path for `path` under `root`.
fn archive_entry_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Files under `source_dir` in archive order, paired with their entry names.
fn collect_entries(
    source_dir: &Path,
    output: &Path,
) -> Result<Vec<(String, PathBuf)>, ArchiveError> {
    let output = std::fs::canonicalize(output).ok();
    let mut entries = Vec::new();
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if output.is_some() && std::fs::canonicalize(path).ok() == output {
            debug!(path = %path.display(), "Skipping the archive itself");
            continue;
        }
        if let Some(name) = archive_entry_name(source_dir, path) {
            entries.push((name, path.to_path_buf()));
        }
    }
    Ok(entries)
}

/// Zip every file in `source_dir` into `output`, replacing any previous file.
pub fn create_archive(
    source_dir: &Path,
    output: &Path,
    compression: ArchiveCompression,
) -> Result<ArchiveArtifact, ArchiveError> {
    info!(
        source = %source_dir.display(),
        output = %output.display(),
        ?compression,
        "Creating archive"
    );

    if !source_dir.is_dir() {
        error!(path = %source_dir.display(), "Archive source is not a readable directory");
        return Err(ArchiveError::Read {
            path: source_dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let entries = collect_entries(source_dir, output)?;
    if entries.is_empty() {
        error!(path = %source_dir.display(), "Nothing to archive");
        return Err(ArchiveError::EmptyInput {
            path: source_dir.to_path_buf(),
        });
    }

    let write_err = |source: io::Error| ArchiveError::Write {
        path: output.to_path_buf(),
        source,
    };
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let staging = tempfile::NamedTempFile::new_in(&parent).map_err(write_err)?;

    let mut zip = ZipWriter::new(staging.reopen().map_err(write_err)?);
    let options = entry_options(compression);
    for (name, path) in &entries {
        let mut source = File::open(path).map_err(|source| ArchiveError::Read {
            path: path.clone(),
            source,
        })?;
        zip.start_file(name.as_str(), options)
            .map_err(|e| write_err(io::Error::other(e)))?;
        let size = io::copy(&mut source, &mut zip).map_err(write_err)?;
        debug!(entry = %name, size, "Added archive entry");
    }
    let mut file = zip.finish().map_err(|e| write_err(io::Error::other(e)))?;
    file.flush().map_err(write_err)?;
    drop(file);

    staging
        .persist(output)
        .map_err(|e| write_err(e.error))?;

    let (size_bytes, sha256) = digest_file(output).map_err(write_err)?;
    info!(
        path = %output.display(),
        entries = entries.len(),
        size_bytes,
        sha256 = %sha256,
        "Archive written"
    );
    Ok(ArchiveArtifact {
        path: output.to_path_buf(),
        entries: entries.len(),
        size_bytes,
        sha256,
    })
}

/// Size and hex SHA-256 of a file.
pub fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}
