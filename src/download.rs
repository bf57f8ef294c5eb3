//! Package download through `pip download`.
//!
//! All specifiers go to a single pip resolver invocation pinned to the target
//! platform, so pip stops at the first specifier it cannot satisfy. After a
//! clean exit every specifier is matched against the files pip left behind;
//! one without an artifact fails the whole step.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::ResolveTarget;
use crate::contract::{DownloadedArtifacts, PackageDownloader, ResolvedSpecifier};
use crate::error::DownloadError;
use crate::manifest::{normalize_name, PackageSpecifier};

/// Runs `<python> -m pip download` for the whole specifier set.
#[derive(Debug, Clone)]
pub struct PipDownloader {
    python: PathBuf,
    timeout: Duration,
}

impl PipDownloader {
    pub fn new(python: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            timeout,
        }
    }

    /// Build the pip invocation. The index URL only ever appears as a flag, so
    /// no pip configuration file or global state is touched.
    pub fn command(
        &self,
        specifiers: &[PackageSpecifier],
        target_dir: &Path,
        target: &ResolveTarget,
    ) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.args(["-m", "pip", "download"])
            .arg("--dest")
            .arg(target_dir)
            .args(["--platform", target.platform_tag.as_str()])
            .args(["--python-version", target.python_version.as_str()])
            .args(["--only-binary=:all:", "--disable-pip-version-check", "--no-input"]);
        if let Some(index_url) = &target.index_url {
            cmd.args(["--index-url", index_url.as_str()]);
        }
        cmd.args(specifiers.iter().map(ToString::to_string));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl PackageDownloader for PipDownloader {
    async fn resolve(
        &self,
        specifiers: &[PackageSpecifier],
        target_dir: &Path,
        target: &ResolveTarget,
    ) -> Result<DownloadedArtifacts, DownloadError> {
        prepare_download_dir(target_dir)?;

        let command_name = format!("{} -m pip download", self.python.display());
        info!(
            command = %command_name,
            specifiers = specifiers.len(),
            platform = %target.platform_tag,
            python_version = %target.python_version,
            dest = %target_dir.display(),
            custom_index = target.index_url.is_some(),
            "Downloading packages"
        );

        let child = self
            .command(specifiers, target_dir, target)
            .spawn()
            .map_err(|e| {
                error!(error = ?e, command = %command_name, "Failed to launch pip");
                DownloadError::Launch {
                    command: command_name.clone(),
                    source: e,
                }
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(error = ?e, command = %command_name, "Failed waiting for pip");
                return Err(DownloadError::Launch {
                    command: command_name,
                    source: e,
                });
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "pip download timed out");
                return Err(DownloadError::Timeout(self.timeout));
            }
        };

        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "pip stdout");
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(
                status = %output.status,
                stderr = %stderr,
                "pip download exited with non-zero code"
            );
            return Err(classify_pip_failure(command_name, output.status, stderr));
        }

        let files = list_artifacts(target_dir).map_err(|e| DownloadError::Prepare {
            path: target_dir.to_path_buf(),
            source: e,
        })?;
        let artifacts = attribute_artifacts(target_dir, specifiers, files)?;
        info!(files = artifacts.files.len(), "All specifiers resolved");
        Ok(artifacts)
    }
}

/// Remove anything a previous run left in `dir` and recreate it empty.
pub fn prepare_download_dir(dir: &Path) -> Result<(), DownloadError> {
    let prepare_err = |e| DownloadError::Prepare {
        path: dir.to_path_buf(),
        source: e,
    };
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(prepare_err)?;
        debug!(path = %dir.display(), "Removed stale download directory");
    }
    fs::create_dir_all(dir).map_err(prepare_err)?;
    debug!(path = %dir.display(), "Created download directory");
    Ok(())
}

/// Top-level files in `dir`, sorted by name.
pub fn list_artifacts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// True when `file_name` is a wheel or sdist of the distribution `normalized`.
///
/// Both `requests-2.31.0-py3-none-any.whl` and `typing_extensions-4.8.0.tar.gz`
/// normalise to `<name>-<digit>...`, which is what gets checked.
pub fn artifact_matches(normalized: &str, file_name: &str) -> bool {
    let file = normalize_name(file_name);
    file.strip_prefix(normalized)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_digit())
}

/// Match every specifier to the files that belong to it.
pub fn attribute_artifacts(
    download_dir: &Path,
    specifiers: &[PackageSpecifier],
    files: Vec<PathBuf>,
) -> Result<DownloadedArtifacts, DownloadError> {
    let resolved: Vec<ResolvedSpecifier> = specifiers
        .iter()
        .map(|spec| {
            let normalized = spec.normalized_name();
            let artifacts = files
                .iter()
                .filter(|f| {
                    f.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| artifact_matches(&normalized, n))
                })
                .cloned()
                .collect();
            ResolvedSpecifier {
                specifier: spec.clone(),
                artifacts,
            }
        })
        .collect();

    // pip skips requirements whose marker does not apply to the target.
    let (skipped, missing): (Vec<_>, Vec<_>) = resolved
        .iter()
        .filter(|r| !r.is_resolved())
        .partition(|r| r.specifier.marker().is_some());
    if !skipped.is_empty() {
        let skipped: Vec<String> = skipped.iter().map(|r| r.specifier.to_string()).collect();
        info!(?skipped, "Marker excluded specifiers for the target platform");
    }
    let missing: Vec<String> = missing.iter().map(|r| r.specifier.to_string()).collect();
    if !missing.is_empty() {
        warn!(?missing, "Specifiers without a downloaded artifact");
        return Err(DownloadError::MissingArtifacts(missing));
    }

    Ok(DownloadedArtifacts {
        download_dir: download_dir.to_path_buf(),
        files,
        resolved,
    })
}

/// Map pip's diagnostic output to the download error taxonomy.
pub fn classify_pip_failure(
    command: String,
    status: std::process::ExitStatus,
    stderr: String,
) -> DownloadError {
    let lower = stderr.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "newconnectionerror",
        "connectionerror",
        "connection refused",
        "max retries exceeded",
        "temporary failure in name resolution",
        "read timed out",
        "network is unreachable",
    ]) {
        DownloadError::Network { stderr }
    } else if has(&["resolutionimpossible", "conflicting dependencies", "cannot install"]) {
        DownloadError::VersionConflict { stderr }
    } else if has(&[
        "is not a supported wheel on this platform",
        "none of the candidates are compatible",
    ]) {
        DownloadError::PlatformMismatch { stderr }
    } else if has(&["no matching distribution found", "could not find a version"]) {
        DownloadError::NotFound { stderr }
    } else {
        DownloadError::Tool {
            command,
            status,
            stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn specs(text: &str) -> Vec<PackageSpecifier> {
        crate::manifest::parse_manifest(text).unwrap()
    }

    #[cfg(unix)]
    fn failed_status() -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(1 << 8)
    }

    #[test]
    fn command_pins_platform_and_scopes_index_url() {
        let downloader = PipDownloader::new("python3", Duration::from_secs(5));
        let target = ResolveTarget {
            index_url: Some("https://proget.example.com/pypi/simple".into()),
            ..ResolveTarget::default()
        };
        let cmd = downloader.command(
            &specs("requests==2.31.0\nnumpy>=1.24"),
            Path::new("dl"),
            &target,
        );
        let args: Vec<&OsStr> = cmd.as_std().get_args().collect();
        let joined = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(cmd.as_std().get_program(), "python3");
        assert!(joined.starts_with("-m pip download --dest dl"));
        assert!(joined.contains("--platform manylinux2014_x86_64"));
        assert!(joined.contains("--python-version 3.8"));
        assert!(joined.contains("--only-binary=:all:"));
        assert!(joined.contains("--index-url https://proget.example.com/pypi/simple"));
        assert!(joined.ends_with("requests==2.31.0 numpy>=1.24"));
    }

    #[test]
    fn command_without_index_url_has_no_index_flag() {
        let downloader = PipDownloader::new("python3", Duration::from_secs(5));
        let cmd = downloader.command(&specs("six"), Path::new("dl"), &ResolveTarget::default());
        assert!(!cmd
            .as_std()
            .get_args()
            .any(|a| a.to_string_lossy().contains("index-url")));
    }

    #[test]
    fn artifact_names_match_normalised_distribution() {
        assert!(artifact_matches("requests", "requests-2.31.0-py3-none-any.whl"));
        assert!(artifact_matches(
            "typing-extensions",
            "typing_extensions-4.8.0-py3-none-any.whl"
        ));
        assert!(artifact_matches("pyyaml", "PyYAML-6.0.1.tar.gz"));
        assert!(!artifact_matches("foo", "foo_bar-1.0-py3-none-any.whl"));
        assert!(!artifact_matches("numpy", "numpyx-1.0.tar.gz"));
    }

    #[test]
    fn attribution_fails_when_any_specifier_is_missing() {
        let files = vec![PathBuf::from("dl/requests-2.31.0-py3-none-any.whl")];
        let err = attribute_artifacts(Path::new("dl"), &specs("requests\nnumpy>=1.24"), files)
            .unwrap_err();
        match err {
            DownloadError::MissingArtifacts(missing) => assert_eq!(missing, vec!["numpy>=1.24"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn extras_and_markers_attribute_on_the_bare_name() {
        let files = vec![PathBuf::from(
            "dl/snowflake_connector_python-3.6.0-cp38-cp38-manylinux2014_x86_64.whl",
        )];
        let manifest = "snowflake-connector-python[pandas]==3.6.0\n\
                        tomli>=2.0; python_version >= \"3.11\"\n";
        let result = attribute_artifacts(Path::new("dl"), &specs(manifest), files).unwrap();
        assert!(result.resolved[0].is_resolved());
        assert!(!result.resolved[1].is_resolved());
    }

    #[test]
    fn attribution_keeps_transitive_dependencies_in_files() {
        let files = vec![
            PathBuf::from("dl/certifi-2024.2.2-py3-none-any.whl"),
            PathBuf::from("dl/requests-2.31.0-py3-none-any.whl"),
        ];
        let result = attribute_artifacts(Path::new("dl"), &specs("requests"), files).unwrap();
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.resolved[0].artifacts.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn classifies_pip_diagnostics() {
        let classify = |stderr: &str| classify_pip_failure("pip".into(), failed_status(), stderr.into());
        assert!(matches!(
            classify("ERROR: No matching distribution found for nonexistent-pkg"),
            DownloadError::NotFound { .. }
        ));
        assert!(matches!(
            classify("ERROR: ResolutionImpossible: for help visit ..."),
            DownloadError::VersionConflict { .. }
        ));
        assert!(matches!(
            classify("WARNING: Retrying ... NewConnectionError(...)"),
            DownloadError::Network { .. }
        ));
        assert!(matches!(classify("segfault"), DownloadError::Tool { .. }));
    }

    #[test]
    fn prepare_clears_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("downloaded_packages");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale-0.1.tar.gz"), b"old").unwrap();
        prepare_download_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(list_artifacts(&dir).unwrap().len(), 0);
    }
}
