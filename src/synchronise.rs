//! High-level pipeline: manifest → download → archive → upload.
//!
//! [`synchronise`] runs the stages strictly in sequence. Each stage needs the
//! complete output of the one before it, and the first failure ends the run.
//!
//! # States
//! `Init → ManifestLoaded → Downloaded → Archived → Uploaded → Done`, with
//! `Failed` reachable from any non-terminal state.
//!
//! # Cleanup
//! A [`RunScratch`] guard is created before the first stage. Its `Drop`
//! removes the download directory on every exit path, and removes the archive
//! unless the run failed with `keep_archive_on_failure` set.
//!
//! # Retries
//! Download and upload are re-attempted up to `retries` extra times, and only
//! for errors marked retryable. Both operations are idempotent.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::archive::{create_archive, ArchiveArtifact};
use crate::config::SyncConfig;
use crate::contract::{PackageDownloader, StageUploader, UploadOutcome};
use crate::error::{DownloadError, SyncError, UploadError};
use crate::manifest::read_manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Init,
    ManifestLoaded,
    Downloaded,
    Archived,
    Uploaded,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Init => "INIT",
            SyncState::ManifestLoaded => "MANIFEST_LOADED",
            SyncState::Downloaded => "DOWNLOADED",
            SyncState::Archived => "ARCHIVED",
            SyncState::Uploaded => "UPLOADED",
            SyncState::Done => "DONE",
            SyncState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Summary of a successful run.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub state: SyncState,
    pub specifiers: Vec<String>,
    pub artifacts: Vec<String>,
    pub archive: ArchiveArtifact,
    pub upload: UploadOutcome,
}

/// Local scratch owned by one run, released when the guard drops.
pub struct RunScratch {
    download_dir: PathBuf,
    archive: PathBuf,
    keep_archive_on_failure: bool,
    succeeded: bool,
}

impl RunScratch {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            archive: config.zip_name.clone(),
            keep_archive_on_failure: config.keep_archive_on_failure,
            succeeded: false,
        }
    }

    fn mark_succeeded(&mut self) {
        self.succeeded = true;
    }
}

fn remove_path(path: &Path, is_dir: bool) {
    let result = if is_dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => info!(path = %path.display(), "Removed local scratch"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(error = ?e, path = %path.display(), "Failed to remove local scratch"),
    }
}

impl Drop for RunScratch {
    fn drop(&mut self) {
        remove_path(&self.download_dir, true);
        if self.succeeded || !self.keep_archive_on_failure {
            remove_path(&self.archive, false);
        } else if self.archive.exists() {
            warn!(path = %self.archive.display(), "Keeping archive of failed run");
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out.
async fn with_retries<T, E, F, Fut>(
    stage: &'static str,
    retries: u32,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt <= retries && retryable(&e) => {
                warn!(stage, attempt, error = %e, "Retrying after retryable failure");
            }
            Err(e) => return Err(e),
        }
    }
}

fn transition(state: &mut SyncState, next: SyncState) {
    info!(from = %state, to = %next, "[SYNC] State transition");
    *state = next;
}

/// Run the full pipeline for `config` with the given downloader and uploader.
pub async fn synchronise<D, U>(
    config: &SyncConfig,
    downloader: &D,
    uploader: &U,
) -> Result<SyncReport, SyncError>
where
    D: PackageDownloader + ?Sized,
    U: StageUploader + ?Sized,
{
    let run_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("sync", run_id = %run_id, stage = %config.stage);
    async move {
        let mut state = SyncState::Init;
        let mut scratch = RunScratch::new(config);
        // A previous run's archive must never be mistaken for this run's output.
        remove_path(&config.zip_name, false);

        let result = run_stages(config, downloader, uploader, &mut state, &run_id).await;
        match &result {
            Ok(_) => {
                scratch.mark_succeeded();
                transition(&mut state, SyncState::Done);
            }
            Err(e) => {
                error!(stage = e.stage_name(), from = %e.stage(), error = %e, "[SYNC][ERROR] Pipeline failed");
                transition(&mut state, SyncState::Failed);
            }
        }
        drop(scratch);
        result.map(|mut report| {
            report.state = state;
            report
        })
    }
    .instrument(span)
    .await
}

async fn run_stages<D, U>(
    config: &SyncConfig,
    downloader: &D,
    uploader: &U,
    state: &mut SyncState,
    run_id: &str,
) -> Result<SyncReport, SyncError>
where
    D: PackageDownloader + ?Sized,
    U: StageUploader + ?Sized,
{
    info!("[SYNC] Starting full synchronisation pipeline");

    let specifiers = read_manifest(&config.requirements_path)?;
    transition(state, SyncState::ManifestLoaded);

    let downloaded = with_retries("download", config.retries, DownloadError::is_retryable, || {
        downloader.resolve(&specifiers, &config.download_dir, &config.target)
    })
    .await?;
    info!(files = downloaded.files.len(), "[SYNC] Download succeeded");
    transition(state, SyncState::Downloaded);

    let archive = create_archive(&config.download_dir, &config.zip_name, config.compression)?;
    transition(state, SyncState::Archived);

    let remote_path = config.stage.remote_path(&archive.file_name());
    let upload = with_retries("upload", config.retries, UploadError::is_retryable, || {
        uploader.put(&archive.path, &config.stage)
    })
    .await
    .inspect_err(|e| {
        let outcome = UploadOutcome::failed(remote_path.clone(), e);
        error!(?outcome, "[SYNC][ERROR][UPLOAD] Upload failed");
    })?;
    info!(remote = %upload.remote_path, "[SYNC][UPLOAD] Upload succeeded");
    transition(state, SyncState::Uploaded);

    Ok(SyncReport {
        run_id: run_id.to_string(),
        state: *state,
        specifiers: specifiers.iter().map(ToString::to_string).collect(),
        artifacts: downloaded
            .files
            .iter()
            .filter_map(|f| f.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect(),
        archive,
        upload,
    })
}
