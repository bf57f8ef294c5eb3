//! # contract: the seams between the pipeline and the outside world
//!
//! Downloading packages and putting files on a stage are delegated to external
//! tools (`pip`, `snowsql`). Each is hidden behind one narrow async trait so the
//! orchestrator can be driven by real clients in production and by
//! deterministic fakes in tests.
//!
//! ## Mocking & Testing
//! - Both traits are annotated for `mockall`; with the `test-export-mocks`
//!   feature (on by default) integration tests get `MockPackageDownloader` and
//!   `MockStageUploader`.
//!
//! ## Adding New Implementations
//! - Implement the trait for your tool or service.
//! - Convert every upstream failure into the stage's typed error so the
//!   orchestrator can map it to an exit code.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::Serialize;

use crate::config::{ResolveTarget, StageLocation};
use crate::error::{DownloadError, UploadError};
use crate::manifest::PackageSpecifier;

/// Files attributed to one requested specifier.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSpecifier {
    pub specifier: PackageSpecifier,
    pub artifacts: Vec<PathBuf>,
}

impl ResolvedSpecifier {
    pub fn is_resolved(&self) -> bool {
        !self.artifacts.is_empty()
    }
}

/// What a download run left on disk.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedArtifacts {
    pub download_dir: PathBuf,
    /// Every file in the directory, sorted, including transitive dependencies.
    pub files: Vec<PathBuf>,
    pub resolved: Vec<ResolvedSpecifier>,
}

/// Terminal result of the upload stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub succeeded: bool,
    pub remote_path: String,
    pub error_detail: Option<String>,
}

impl UploadOutcome {
    pub fn uploaded(remote_path: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            remote_path: remote_path.into(),
            error_detail: None,
        }
    }

    pub fn failed(remote_path: impl Into<String>, error: &UploadError) -> Self {
        Self {
            succeeded: false,
            remote_path: remote_path.into(),
            error_detail: Some(error.to_string()),
        }
    }
}

/// Fetches distributions for a set of specifiers into a directory.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PackageDownloader: Send + Sync {
    /// Download at least one artifact per specifier into `target_dir`,
    /// pinned to `target`. Any unresolved specifier fails the whole call.
    async fn resolve(
        &self,
        specifiers: &[PackageSpecifier],
        target_dir: &Path,
        target: &ResolveTarget,
    ) -> Result<DownloadedArtifacts, DownloadError>;
}

/// Puts a local file onto a warehouse stage, replacing any object of the same name.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait StageUploader: Send + Sync {
    async fn put(
        &self,
        local_path: &Path,
        stage: &StageLocation,
    ) -> Result<UploadOutcome, UploadError>;
}
