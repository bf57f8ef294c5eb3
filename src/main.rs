use anyhow::Result;
use clap::Parser;
use stage_sync::config::EnvSnapshot;
use stage_sync::{run, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout carries only the JSON report.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("CLI application startup: tracing initialised, environment loaded");

    let cli = Cli::parse();
    let env = EnvSnapshot::capture();
    tracing::info!("CLI arguments parsed, invoking run");

    let code = run(cli, &env).await?;
    if code == 0 {
        tracing::info!("CLI completed successfully");
    } else {
        tracing::error!(exit_code = code, "CLI exited with error");
    }
    std::process::exit(code);
}
