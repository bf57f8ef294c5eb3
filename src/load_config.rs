/// `load_config` module: merges command-line flags with an environment snapshot into a [`SyncConfig`].
///
/// This is the only place where raw user input is validated and mapped to
/// strongly-typed configuration. Components never read the environment
/// themselves; they receive the finished `SyncConfig`.
///
/// # Responsibilities
/// - Validate the stage identifier, archive name, download directory and index URL
/// - Read warehouse credentials from the snapshot (`SNOWFLAKE_*`)
/// - Let `--index-url` win over `PACKAGE_INDEX_URL`
///
/// # Errors
/// Every problem is a [`ConfigError`] naming the offending flag or variable.
/// Secret values never appear in errors or logs.
use std::time::Duration;

use tracing::{error, info};

use crate::cli::Cli;
use crate::config::{
    validate_download_dir, validate_index_url, validate_zip_name, EnvSnapshot, ResolveTarget,
    StageLocation, SyncConfig, WarehouseCredentials, ENV_INDEX_URL,
};
use crate::error::ConfigError;

pub fn load_config(cli: &Cli, env: &EnvSnapshot) -> Result<SyncConfig, ConfigError> {
    info!(stage = %cli.stage, "Loading configuration from flags and environment");

    let stage = StageLocation::parse(&cli.stage).inspect_err(|e| {
        error!(error = %e, "Invalid --stage");
    })?;
    validate_zip_name(&cli.zip_name).inspect_err(|e| {
        error!(error = %e, "Invalid --zip-name");
    })?;
    validate_download_dir(&cli.download_dir, &cli.requirements, &cli.zip_name)
        .inspect_err(|e| error!(error = %e, "Invalid --download-dir"))?;

    let index_url = cli
        .index_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .or_else(|| env.get(ENV_INDEX_URL))
        .map(str::to_string);
    if let Some(url) = &index_url {
        validate_index_url(url)?;
        info!("Custom package index configured");
    }

    let credentials = WarehouseCredentials::from_env(env).inspect_err(|e| {
        error!(error = %e, "Warehouse credentials incomplete");
    })?;

    let config = SyncConfig {
        requirements_path: cli.requirements.clone(),
        download_dir: cli.download_dir.clone(),
        zip_name: cli.zip_name.clone(),
        stage,
        credentials,
        target: ResolveTarget {
            platform_tag: cli.platform.clone(),
            python_version: cli.python_version.clone(),
            index_url,
        },
        python: cli.python.clone(),
        snowsql: cli.snowsql.clone(),
        compression: cli.compression,
        download_timeout: Duration::from_secs(cli.download_timeout_secs),
        upload_timeout: Duration::from_secs(cli.upload_timeout_secs),
        retries: cli.retries,
        keep_archive_on_failure: cli.keep_archive_on_failure,
    };
    config.trace_loaded();
    Ok(config)
}
