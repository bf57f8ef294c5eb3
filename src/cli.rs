//! Command-line surface: flag parsing, wiring the real clients, exit codes.
//!
//! All pipeline logic lives in [`crate::synchronise`]; this module only turns
//! flags and environment into a [`crate::config::SyncConfig`], runs the
//! pipeline once, and reports the result.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::{ArchiveCompression, EnvSnapshot, DEFAULT_PLATFORM_TAG, DEFAULT_PYTHON_VERSION};
use crate::download::PipDownloader;
use crate::error::CONFIG_EXIT_CODE;
use crate::load_config::load_config;
use crate::synchronise::synchronise;
use crate::upload::SnowSqlUploader;

/// Sync Python packages from a package index to a Snowflake stage.
#[derive(Debug, Parser)]
#[clap(
    name = "stage-sync",
    version,
    about = "Download pinned Python packages, zip them, and upload the archive to a Snowflake stage"
)]
pub struct Cli {
    /// Path to the requirements manifest
    #[clap(long, default_value = "requirements.txt")]
    pub requirements: PathBuf,

    /// Target stage, e.g. @MY_DB.MY_SCHEMA.MY_STAGE
    #[clap(long)]
    pub stage: String,

    /// Directory packages are downloaded into (recreated on every run)
    #[clap(long, default_value = "./downloaded_packages")]
    pub download_dir: PathBuf,

    /// Name of the archive uploaded to the stage
    #[clap(long, default_value = "app_packages.zip")]
    pub zip_name: PathBuf,

    /// Package index to download from instead of the default (e.g. a ProGet feed)
    #[clap(long, alias = "proget-url")]
    pub index_url: Option<String>,

    /// Platform tag wheels must be built for
    #[clap(long, default_value = DEFAULT_PLATFORM_TAG)]
    pub platform: String,

    /// Python version of the UDF runtime
    #[clap(long, default_value = DEFAULT_PYTHON_VERSION)]
    pub python_version: String,

    /// Python interpreter used to run pip
    #[clap(long, default_value = "python3")]
    pub python: PathBuf,

    /// snowsql executable used for the PUT
    #[clap(long, default_value = "snowsql")]
    pub snowsql: PathBuf,

    #[clap(long, value_enum, default_value_t = ArchiveCompression::Deflated)]
    pub compression: ArchiveCompression,

    #[clap(long, default_value_t = 900)]
    pub download_timeout_secs: u64,

    #[clap(long, default_value_t = 300)]
    pub upload_timeout_secs: u64,

    /// Extra attempts for download and upload after a network failure
    #[clap(long, default_value_t = 0)]
    pub retries: u32,

    /// Leave the archive on disk when the run fails
    #[clap(long)]
    pub keep_archive_on_failure: bool,
}

/// Run one sync and return the process exit code.
pub async fn run(cli: Cli, env: &EnvSnapshot) -> Result<i32> {
    tracing::info!("trace_initialised");

    let config = match load_config(&cli, env) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            eprintln!("sync failed at config: {e}");
            return Ok(CONFIG_EXIT_CODE);
        }
    };

    let downloader = PipDownloader::new(config.python.clone(), config.download_timeout);
    let uploader = SnowSqlUploader::new(
        config.snowsql.clone(),
        config.credentials.clone(),
        config.upload_timeout,
    );

    match synchronise(&config, &downloader, &uploader).await {
        Ok(report) => {
            tracing::info!(
                remote = %report.upload.remote_path,
                sha256 = %report.archive.sha256,
                "Synchronisation complete"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Err(e) => {
            eprintln!("sync failed at {}: {e}", e.stage_name());
            Ok(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = Cli::try_parse_from(["stage-sync", "--stage", "@DB.SCHEMA.STAGE"]).unwrap();
        assert_eq!(cli.requirements, PathBuf::from("requirements.txt"));
        assert_eq!(cli.download_dir, PathBuf::from("./downloaded_packages"));
        assert_eq!(cli.zip_name, PathBuf::from("app_packages.zip"));
        assert_eq!(cli.platform, "manylinux2014_x86_64");
        assert_eq!(cli.compression, ArchiveCompression::Deflated);
        assert_eq!(cli.retries, 0);
        assert!(cli.index_url.is_none());
    }

    #[test]
    fn stage_is_required() {
        assert!(Cli::try_parse_from(["stage-sync"]).is_err());
    }

    #[test]
    fn proget_url_is_an_alias_for_index_url() {
        let cli = Cli::try_parse_from([
            "stage-sync",
            "--stage",
            "@S",
            "--proget-url",
            "https://proget.example.com/pypi/internal/simple",
        ])
        .unwrap();
        assert_eq!(
            cli.index_url.as_deref(),
            Some("https://proget.example.com/pypi/internal/simple")
        );
    }
}
