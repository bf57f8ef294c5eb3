//! Error taxonomy for every stage of the sync pipeline.
//!
//! Each component fails fast with its own typed error; the orchestrator wraps
//! whichever one stopped the run in [`SyncError`], which knows the failing
//! stage and the process exit code that goes with it.

use std::path::PathBuf;
use std::time::Duration;

use crate::synchronise::SyncState;

/// Problems building a [`crate::config::SyncConfig`] from flags and environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid stage identifier {stage:?}: {reason}")]
    InvalidStage { stage: String, reason: String },
    #[error("invalid archive name {name:?}: expected a .zip file name")]
    InvalidArchiveName { name: String },
    #[error("invalid index url {url:?}: expected an http(s) or file url")]
    InvalidIndexUrl { url: String },
    #[error("refusing to use {} as download directory: it {reason}", path.display())]
    UnsafeDownloadDir { path: PathBuf, reason: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest line {line_number} ({line:?}): {reason}")]
    Parse {
        line_number: usize,
        line: String,
        reason: String,
    },
}

/// The line of a tool's output worth showing the operator: the first line
/// starting with `ERROR:`, else the last non-empty line.
pub fn diagnostic_line(output: &str) -> &str {
    let lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    lines
        .clone()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .unwrap_or("no diagnostic output")
}

/// Download failures. Variants carrying `stderr` keep pip's full output for
/// logging; their `Display` shows only the first diagnostic line.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network failure while resolving packages: {}", diagnostic_line(.stderr))]
    Network { stderr: String },
    #[error("no matching distribution found: {}", diagnostic_line(.stderr))]
    NotFound { stderr: String },
    #[error("conflicting version constraints: {}", diagnostic_line(.stderr))]
    VersionConflict { stderr: String },
    #[error("no distribution compatible with the target platform: {}", diagnostic_line(.stderr))]
    PlatformMismatch { stderr: String },
    #[error("no artifact downloaded for: {}", .0.join(", "))]
    MissingArtifacts(Vec<String>),
    #[error("'{command}' exited with status {status}: {}", diagnostic_line(.stderr))]
    Tool {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("package download timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to prepare download directory {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Whether re-running the same download could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Network { .. } | DownloadError::Timeout(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("nothing to archive: {} contains no files", path.display())]
    EmptyInput { path: PathBuf },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write archive {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<walkdir::Error> for ArchiveError {
    fn from(e: walkdir::Error) -> Self {
        let path = e.path().map(PathBuf::from).unwrap_or_default();
        let source = e
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
        ArchiveError::Read { path, source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("warehouse authentication failed: {detail}")]
    Auth { detail: String },
    #[error("network failure talking to the warehouse: {detail}")]
    Network { detail: String },
    #[error("warehouse rejected the upload: {detail}")]
    Rejected { detail: String },
    #[error("failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Network { .. } | UploadError::Timeout(_))
    }
}

/// The error that ended a pipeline run, tagged with the stage it came from.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl SyncError {
    /// The state the pipeline was in when the failing stage started.
    pub fn stage(&self) -> SyncState {
        match self {
            SyncError::Manifest(_) => SyncState::Init,
            SyncError::Download(_) => SyncState::ManifestLoaded,
            SyncError::Archive(_) => SyncState::Downloaded,
            SyncError::Upload(_) => SyncState::Archived,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            SyncError::Manifest(_) => "manifest",
            SyncError::Download(_) => "download",
            SyncError::Archive(_) => "archive",
            SyncError::Upload(_) => "upload",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Manifest(_) => 3,
            SyncError::Download(_) => 4,
            SyncError::Archive(_) => 5,
            SyncError::Upload(_) => 6,
        }
    }
}

/// Exit code for flag or environment problems found before the pipeline starts.
pub const CONFIG_EXIT_CODE: i32 = 2;
