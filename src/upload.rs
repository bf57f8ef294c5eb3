#![doc = "Stage upload through the warehouse `PUT` command, executed by `snowsql`."]
//
//! # Stage Uploader
//!
//! [`SnowSqlUploader`] implements [`StageUploader`] by running a single
//! `PUT ... OVERWRITE=TRUE` statement through the `snowsql` client. Every run
//! fully replaces the archive at the stage path.
//!
//! - Connection settings come from [`WarehouseCredentials`]; the password is
//!   handed to the child through `SNOWSQL_PWD` and never appears in argv or logs.
//! - Output is requested as headerless CSV; success requires an `UPLOADED` row.
//! - Failures are split into auth, network and rejection so the operator can
//!   tell a bad password from a flaky connection.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::{StageLocation, WarehouseCredentials};
use crate::contract::{StageUploader, UploadOutcome};
use crate::error::UploadError;

pub struct SnowSqlUploader {
    program: PathBuf,
    credentials: WarehouseCredentials,
    timeout: Duration,
}

impl SnowSqlUploader {
    pub fn new(
        program: impl Into<PathBuf>,
        credentials: WarehouseCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            credentials,
            timeout,
        }
    }

    pub fn command(&self, statement: &str) -> Command {
        let creds = &self.credentials;
        let mut cmd = Command::new(&self.program);
        cmd.args(["-a", creds.account.as_str(), "-u", creds.user.as_str()]);
        for (flag, value) in [
            ("-r", &creds.role),
            ("-w", &creds.warehouse),
            ("-d", &creds.database),
            ("-s", &creds.schema),
        ] {
            if let Some(value) = value {
                cmd.args([flag, value.as_str()]);
            }
        }
        for option in [
            "friendly=false",
            "header=false",
            "timing=false",
            "output_format=csv",
            "exit_on_error=true",
            "log_level=ERROR",
        ] {
            cmd.args(["-o", option]);
        }
        cmd.args(["-q", statement])
            .env("SNOWSQL_PWD", &creds.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// `PUT` statement for `local_path`; single quotes in the path are escaped.
pub fn put_statement(local_path: &Path, stage: &StageLocation) -> String {
    let url_path = local_path.to_string_lossy().replace('\\', "/").replace('\'', "\\'");
    let url_path = if url_path.starts_with('/') {
        url_path
    } else {
        format!("/{url_path}")
    };
    format!("PUT 'file://{url_path}' {stage} AUTO_COMPRESS=FALSE OVERWRITE=TRUE")
}

/// Split one CSV row, honouring double-quoted fields and `""` escapes.
fn csv_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', _) => in_quotes = !in_quotes,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields.into_iter().map(|f| f.trim().to_string()).collect()
}

/// Status column of each PUT result row, e.g. `UPLOADED` or `SKIPPED`.
pub fn put_statuses(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields = csv_fields(line);
            (fields.len() >= 8).then(|| fields[6].to_ascii_uppercase())
        })
        .collect()
}

/// Map a failed snowsql run to the upload error taxonomy.
pub fn classify_snowsql_failure(output: &str) -> UploadError {
    let lower = output.to_lowercase();
    let detail = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no diagnostic output")
        .to_string();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "250001",
        "incorrect username or password",
        "authentication",
        "user temporarily locked",
        "password is expired",
    ]) {
        UploadError::Auth { detail }
    } else if has(&[
        "250003",
        "failed to connect",
        "connection refused",
        "could not connect",
        "name or service not known",
        "network is unreachable",
        "timed out",
    ]) {
        UploadError::Network { detail }
    } else {
        UploadError::Rejected { detail }
    }
}

#[async_trait]
impl StageUploader for SnowSqlUploader {
    async fn put(
        &self,
        local_path: &Path,
        stage: &StageLocation,
    ) -> Result<UploadOutcome, UploadError> {
        let absolute = std::path::absolute(local_path).map_err(|e| UploadError::Rejected {
            detail: format!("cannot resolve {}: {e}", local_path.display()),
        })?;
        let file_name = absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote_path = stage.remote_path(&file_name);
        let statement = put_statement(&absolute, stage);
        let program = self.program.display().to_string();

        info!(
            local = %absolute.display(),
            remote = %remote_path,
            account = %self.credentials.account,
            "Uploading archive to stage"
        );
        debug!(statement = %statement, "Executing PUT");

        let child = self.command(&statement).spawn().map_err(|e| {
            error!(error = ?e, program = %program, "Failed to launch warehouse client");
            UploadError::Launch {
                command: program.clone(),
                source: e,
            }
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(UploadError::Launch {
                    command: program,
                    source: e,
                })
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "Stage upload timed out");
                return Err(UploadError::Timeout(self.timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let err = classify_snowsql_failure(&format!("{stderr}\n{stdout}"));
            error!(
                status = %output.status,
                error = %err,
                stderr = %stderr,
                "Warehouse client exited with non-zero code"
            );
            return Err(err);
        }

        let statuses = put_statuses(&stdout);
        debug!(?statuses, "PUT result rows");
        if statuses.is_empty() || statuses.iter().any(|s| s != "UPLOADED") {
            let err = UploadError::Rejected {
                detail: format!("PUT did not report UPLOADED (statuses: {statuses:?})"),
            };
            error!(error = %err, "Stage upload not confirmed");
            return Err(err);
        }

        info!(remote = %remote_path, "Upload to stage complete");
        Ok(UploadOutcome::uploaded(remote_path))
    }
}
