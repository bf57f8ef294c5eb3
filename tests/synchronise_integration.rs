use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stage_sync::archive::digest_file;
use stage_sync::config::{
    ArchiveCompression, ResolveTarget, StageLocation, SyncConfig, WarehouseCredentials,
};
use stage_sync::contract::{MockPackageDownloader, MockStageUploader, UploadOutcome};
use stage_sync::download::{attribute_artifacts, list_artifacts};
use stage_sync::error::{DownloadError, SyncError, UploadError};
use stage_sync::manifest::PackageSpecifier;
use stage_sync::synchronise::{synchronise, SyncState};
use tempfile::{tempdir, TempDir};

struct Workspace {
    _tmp: TempDir,
    config: SyncConfig,
    stage_dir: PathBuf,
}

fn workspace(manifest: &str) -> Workspace {
    let tmp = tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    fs::write(root.join("requirements.txt"), manifest).unwrap();
    let stage_dir = root.join("stage");
    fs::create_dir_all(&stage_dir).unwrap();

    let config = SyncConfig {
        requirements_path: root.join("requirements.txt"),
        download_dir: root.join("downloaded_packages"),
        zip_name: root.join("app_packages.zip"),
        stage: StageLocation::parse("@DB.SCHEMA.STAGE").unwrap(),
        credentials: WarehouseCredentials {
            account: "xy12345".into(),
            user: "loader".into(),
            password: "secret".into(),
            role: None,
            warehouse: None,
            database: None,
            schema: None,
        },
        target: ResolveTarget::default(),
        python: PathBuf::from("python3"),
        snowsql: PathBuf::from("snowsql"),
        compression: ArchiveCompression::Deflated,
        download_timeout: Duration::from_secs(30),
        upload_timeout: Duration::from_secs(30),
        retries: 0,
        keep_archive_on_failure: false,
    };
    Workspace {
        _tmp: tmp,
        config,
        stage_dir,
    }
}

/// Downloader double that writes one fake wheel per specifier.
fn fake_downloader() -> MockPackageDownloader {
    let mut downloader = MockPackageDownloader::new();
    downloader
        .expect_resolve()
        .returning(|specs: &[PackageSpecifier], dir: &Path, _target: &ResolveTarget| {
            fs::create_dir_all(dir).unwrap();
            for spec in specs {
                let wheel = format!("{}-1.0.0-py3-none-any.whl", spec.normalized_name().replace('-', "_"));
                fs::write(dir.join(wheel), format!("contents of {spec}")).unwrap();
            }
            let files = list_artifacts(dir).unwrap();
            attribute_artifacts(dir, specs, files)
        });
    downloader
}

/// Uploader double that copies the archive into `stage_dir`.
fn copying_uploader(stage_dir: &Path) -> MockStageUploader {
    let stage_dir = stage_dir.to_path_buf();
    let mut uploader = MockStageUploader::new();
    uploader
        .expect_put()
        .returning(move |local: &Path, stage: &StageLocation| {
            let name = local.file_name().unwrap();
            fs::copy(local, stage_dir.join(name)).unwrap();
            Ok(UploadOutcome::uploaded(stage.remote_path(&name.to_string_lossy())))
        });
    uploader
}

#[tokio::test]
async fn successful_run_uploads_archive_and_cleans_up() {
    let ws = workspace("requests==2.31.0\nnumpy>=1.24\n");
    let downloader = fake_downloader();
    let uploader = copying_uploader(&ws.stage_dir);

    let report = synchronise(&ws.config, &downloader, &uploader)
        .await
        .expect("sync should succeed");

    assert_eq!(report.state, SyncState::Done);
    assert_eq!(report.specifiers, vec!["requests==2.31.0", "numpy>=1.24"]);
    assert_eq!(report.archive.entries, 2);
    assert!(report.upload.succeeded);
    assert_eq!(report.upload.remote_path, "@DB.SCHEMA.STAGE/app_packages.zip");

    let staged = ws.stage_dir.join("app_packages.zip");
    let archive = zip::ZipArchive::new(fs::File::open(&staged).unwrap()).unwrap();
    let names: Vec<&str> = archive.file_names().collect();
    assert_eq!(
        names,
        vec!["numpy-1.0.0-py3-none-any.whl", "requests-1.0.0-py3-none-any.whl"]
    );

    assert!(!ws.config.download_dir.exists(), "download dir must be removed");
    assert!(!ws.config.zip_name.exists(), "local archive must be removed");
}

#[tokio::test]
async fn rerunning_yields_identical_stage_object() {
    let ws = workspace("requests==2.31.0\nnumpy>=1.24\n");
    let downloader = fake_downloader();
    let uploader = copying_uploader(&ws.stage_dir);
    let staged = ws.stage_dir.join("app_packages.zip");

    let first = synchronise(&ws.config, &downloader, &uploader).await.unwrap();
    let first_digest = digest_file(&staged).unwrap();
    let second = synchronise(&ws.config, &downloader, &uploader).await.unwrap();
    let second_digest = digest_file(&staged).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.archive.sha256, second.archive.sha256);
    assert_eq!(first_digest, second_digest);
}

#[tokio::test]
async fn unresolvable_specifier_fails_without_archive_or_upload() {
    let ws = workspace("requests==2.31.0\ndefinitely-not-a-real-package\n");
    let mut downloader = MockPackageDownloader::new();
    downloader.expect_resolve().times(1).returning(|_, dir, _| {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("requests-2.31.0-py3-none-any.whl"), b"partial").unwrap();
        Err(DownloadError::NotFound {
            stderr: "ERROR: No matching distribution found for definitely-not-a-real-package".into(),
        })
    });
    let mut uploader = MockStageUploader::new();
    uploader.expect_put().never();

    let err = synchronise(&ws.config, &downloader, &uploader)
        .await
        .expect_err("sync should fail");

    assert!(matches!(err, SyncError::Download(DownloadError::NotFound { .. })));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(err.stage(), SyncState::ManifestLoaded);
    assert!(!ws.config.zip_name.exists(), "no archive may be produced");
    assert!(!ws.config.download_dir.exists(), "partial downloads must be cleaned up");
}

#[tokio::test]
async fn missing_manifest_stops_before_download() {
    let mut ws = workspace("requests\n");
    ws.config.requirements_path = ws.config.requirements_path.with_file_name("absent.txt");
    let mut downloader = MockPackageDownloader::new();
    downloader.expect_resolve().never();
    let mut uploader = MockStageUploader::new();
    uploader.expect_put().never();

    let err = synchronise(&ws.config, &downloader, &uploader).await.unwrap_err();
    assert_eq!(err.stage_name(), "manifest");
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn empty_download_is_an_archive_failure() {
    let ws = workspace("requests\n");
    let mut downloader = MockPackageDownloader::new();
    downloader.expect_resolve().returning(|_, dir, _| {
        fs::create_dir_all(dir).unwrap();
        Ok(stage_sync::contract::DownloadedArtifacts {
            download_dir: dir.to_path_buf(),
            files: vec![],
            resolved: vec![],
        })
    });
    let mut uploader = MockStageUploader::new();
    uploader.expect_put().never();

    let err = synchronise(&ws.config, &downloader, &uploader).await.unwrap_err();
    assert_eq!(err.stage_name(), "archive");
    assert_eq!(err.exit_code(), 5);
    assert!(!ws.config.download_dir.exists());
}

#[tokio::test]
async fn upload_failure_cleans_up_unless_archive_is_kept() {
    for keep in [false, true] {
        let mut ws = workspace("requests==2.31.0\n");
        ws.config.keep_archive_on_failure = keep;
        let downloader = fake_downloader();
        let mut uploader = MockStageUploader::new();
        uploader.expect_put().times(1).returning(|_, _| {
            Err(UploadError::Auth {
                detail: "Incorrect username or password was specified.".into(),
            })
        });

        let err = synchronise(&ws.config, &downloader, &uploader).await.unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert!(!ws.config.download_dir.exists());
        assert_eq!(ws.config.zip_name.exists(), keep, "keep_archive_on_failure = {keep}");
    }
}

#[tokio::test]
async fn network_failures_are_retried_within_budget() {
    let mut ws = workspace("requests==2.31.0\n");
    ws.config.retries = 2;
    let downloader = fake_downloader();
    let stage_dir = ws.stage_dir.clone();
    let mut attempts = 0;
    let mut uploader = MockStageUploader::new();
    uploader.expect_put().times(3).returning(move |local, stage| {
        attempts += 1;
        if attempts < 3 {
            return Err(UploadError::Network {
                detail: "connection reset".into(),
            });
        }
        fs::copy(local, stage_dir.join("app_packages.zip")).unwrap();
        Ok(UploadOutcome::uploaded(stage.remote_path("app_packages.zip")))
    });

    let report = synchronise(&ws.config, &downloader, &uploader).await.unwrap();
    assert!(report.upload.succeeded);
}

#[tokio::test]
async fn stale_download_dir_and_archive_do_not_leak_into_the_run() {
    let ws = workspace("requests==2.31.0\n");
    fs::create_dir_all(&ws.config.download_dir).unwrap();
    fs::write(ws.config.download_dir.join("stale-0.1.tar.gz"), b"old").unwrap();
    fs::write(&ws.config.zip_name, b"old archive").unwrap();

    // Real downloaders recreate the directory; this double asserts it got a clean one.
    let mut downloader = MockPackageDownloader::new();
    downloader.expect_resolve().returning(|specs, dir, _| {
        stage_sync::download::prepare_download_dir(dir)?;
        fs::write(dir.join("requests-2.31.0-py3-none-any.whl"), b"wheel").unwrap();
        attribute_artifacts(dir, specs, list_artifacts(dir).unwrap())
    });
    let uploader = copying_uploader(&ws.stage_dir);

    let report = synchronise(&ws.config, &downloader, &uploader).await.unwrap();
    assert_eq!(report.artifacts, vec!["requests-2.31.0-py3-none-any.whl"]);
    assert_eq!(report.archive.entries, 1);
}
