//! Run configuration: the immutable [`SyncConfig`] and the validated values it carries.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_PLATFORM_TAG: &str = "manylinux2014_x86_64";
pub const DEFAULT_PYTHON_VERSION: &str = "3.8";

pub const ENV_ACCOUNT: &str = "SNOWFLAKE_ACCOUNT";
pub const ENV_USER: &str = "SNOWFLAKE_USER";
pub const ENV_PASSWORD: &str = "SNOWFLAKE_PASSWORD";
pub const ENV_ROLE: &str = "SNOWFLAKE_ROLE";
pub const ENV_WAREHOUSE: &str = "SNOWFLAKE_WAREHOUSE";
pub const ENV_DATABASE: &str = "SNOWFLAKE_DATABASE";
pub const ENV_SCHEMA: &str = "SNOWFLAKE_SCHEMA";
pub const ENV_INDEX_URL: &str = "PACKAGE_INDEX_URL";

/// Everything one pipeline run needs. Built once, then only borrowed.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub requirements_path: PathBuf,
    pub download_dir: PathBuf,
    pub zip_name: PathBuf,
    pub stage: StageLocation,
    pub credentials: WarehouseCredentials,
    pub target: ResolveTarget,
    pub python: PathBuf,
    pub snowsql: PathBuf,
    pub compression: ArchiveCompression,
    pub download_timeout: Duration,
    pub upload_timeout: Duration,
    pub retries: u32,
    pub keep_archive_on_failure: bool,
}

impl SyncConfig {
    pub fn trace_loaded(&self) {
        info!(
            requirements = %self.requirements_path.display(),
            download_dir = %self.download_dir.display(),
            zip_name = %self.zip_name.display(),
            stage = %self.stage,
            platform = %self.target.platform_tag,
            python_version = %self.target.python_version,
            custom_index = self.target.index_url.is_some(),
            "Loaded SyncConfig"
        );
        debug!(?self, "SyncConfig loaded (full debug)");
    }
}

/// Platform pin for `pip download`.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolveTarget {
    pub platform_tag: String,
    pub python_version: String,
    /// Scoped override of the package source for this run only.
    pub index_url: Option<String>,
}

impl Default for ResolveTarget {
    fn default() -> Self {
        Self {
            platform_tag: DEFAULT_PLATFORM_TAG.to_string(),
            python_version: DEFAULT_PYTHON_VERSION.to_string(),
            index_url: None,
        }
    }
}

impl fmt::Debug for ResolveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveTarget")
            .field("platform_tag", &self.platform_tag)
            .field("python_version", &self.python_version)
            .field("index_url", &self.index_url.as_deref().map(redact_url))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveCompression {
    Stored,
    #[default]
    Deflated,
}

/// A validated stage reference such as `@DB.SCHEMA.STAGE` or `@~/libs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StageLocation(String);

fn stage_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let ident = r#"(?:[A-Za-z_][A-Za-z0-9_$]*|"[^"]+")"#;
        Regex::new(&format!(
            r"^@(?:~|%{ident}|{ident}(?:\.{ident}){{0,2}})(?:/[A-Za-z0-9_./=-]*)?$"
        ))
        .expect("stage pattern is valid")
    })
}

impl StageLocation {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| ConfigError::InvalidStage {
            stage: raw.to_string(),
            reason: reason.to_string(),
        };
        if trimmed.is_empty() {
            return Err(invalid("stage identifier is empty"));
        }
        if !trimmed.starts_with('@') {
            return Err(invalid("stage identifiers start with '@'"));
        }
        if !stage_pattern().is_match(trimmed) {
            return Err(invalid("expected @name, @db.schema.name, @~ or @%table"));
        }
        Ok(Self(trimmed.trim_end_matches('/').to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object path the archive ends up at, e.g. `@DB.SCHEMA.STAGE/app_packages.zip`.
    pub fn remote_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.0, file_name.trim_start_matches('/'))
    }
}

impl fmt::Display for StageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check the archive name ends in `.zip`, the only container `zipimport` loads.
pub fn validate_zip_name(path: &Path) -> Result<(), ConfigError> {
    let is_zip = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.rsplit_once('.'))
        .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case("zip"));
    if is_zip {
        Ok(())
    } else {
        Err(ConfigError::InvalidArchiveName {
            name: path.display().to_string(),
        })
    }
}

/// Absolute form of `path` with `.` and `..` folded away, without touching the filesystem.
fn lexical_absolute(path: &Path) -> std::io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// The download directory is wiped before and after every run, so it must not
/// be the working directory, one of its parents, or hold the manifest or archive.
pub fn validate_download_dir(
    download_dir: &Path,
    requirements: &Path,
    archive: &Path,
) -> Result<(), ConfigError> {
    let unsafe_dir = |reason| ConfigError::UnsafeDownloadDir {
        path: download_dir.to_path_buf(),
        reason,
    };
    let resolve = |p: &Path| lexical_absolute(p).map_err(|_| unsafe_dir("cannot be resolved"));
    let dir = resolve(download_dir)?;
    if resolve(Path::new("."))?.starts_with(&dir) {
        return Err(unsafe_dir("is the working directory or one of its parents"));
    }
    if resolve(requirements)?.starts_with(&dir) {
        return Err(unsafe_dir("contains the requirements manifest"));
    }
    if resolve(archive)?.starts_with(&dir) {
        return Err(unsafe_dir("contains the archive"));
    }
    Ok(())
}

/// Accept only absolute http(s) or file URLs for the package index.
pub fn validate_index_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidIndexUrl {
        url: redact_url(raw),
    };
    let url = Url::parse(raw).map_err(|_| invalid())?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        "file" => Ok(()),
        _ => Err(invalid()),
    }
}

/// `raw` with any `user:password@` part replaced by `***@`. The only form of
/// an index URL that may reach logs or error messages.
pub fn redact_url(raw: &str) -> String {
    if let Some(mut url) = Url::parse(raw).ok().filter(Url::has_host) {
        if url.username().is_empty() && url.password().is_none() {
            return url.to_string();
        }
        if url.set_password(None).is_ok() && url.set_username("***").is_ok() {
            return url.to_string();
        }
    }
    let (scheme, rest) = raw.split_once("://").unwrap_or(("", raw));
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) if scheme.is_empty() => format!("***@{}", &rest[at + 1..]),
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => raw.to_string(),
    }
}

/// Snapshot of the process environment, taken once at startup.
#[derive(Default, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Blank values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Connection settings for the warehouse client.
#[derive(Clone, PartialEq, Eq)]
pub struct WarehouseCredentials {
    pub account: String,
    pub user: String,
    pub password: String,
    pub role: Option<String>,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
}

impl WarehouseCredentials {
    pub fn from_env(env: &EnvSnapshot) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            env.get(key)
                .map(str::to_string)
                .ok_or(ConfigError::MissingEnv(key))
        };
        let optional = |key: &str| env.get(key).map(str::to_string);
        Ok(Self {
            account: required(ENV_ACCOUNT)?,
            user: required(ENV_USER)?,
            password: required(ENV_PASSWORD)?,
            role: optional(ENV_ROLE),
            warehouse: optional(ENV_WAREHOUSE),
            database: optional(ENV_DATABASE),
            schema: optional(ENV_SCHEMA),
        })
    }
}

impl fmt::Debug for WarehouseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseCredentials")
            .field("account", &self.account)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("role", &self.role)
            .field("warehouse", &self.warehouse)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .finish()
    }
}
