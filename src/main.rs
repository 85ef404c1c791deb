// src/main.rs

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod server;
mod sys;

use crate::config::RotatorConfig;
use crate::sys::gcp::GcpSecretStore;
use crate::sys::metadata::{MetadataClient, resolve_project_id};
use crate::sys::rotator::Rotator;

#[derive(Parser)]
#[command(name = "secret-rotator", version, about = "Rotates a signing secret stored in Google Secret Manager")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single rotation and exit (default)
    Rotate,
    /// Serve the HTTP trigger; every request runs one rotation
    Serve,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment
    // ==============================================================================

    // Structured JSON logs so Cloud Logging picks up the level of every line.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = RotatorConfig::load()?;

    // ==============================================================================
    // 2. Collaborators
    // ==============================================================================

    // 🛡️ Every store and metadata call is bounded by the rotation deadline.
    let http = reqwest::Client::builder().timeout(config.timeout).build()?;
    let metadata = MetadataClient::new(http.clone(), config.metadata_url.as_str());

    let project = resolve_project_id(
        config.project_id.as_deref(),
        &config.fallback_project_id,
        &metadata,
    )
    .await;

    let store = Arc::new(GcpSecretStore::new(http, config.secret_manager_url.as_str(), metadata));
    let rotator = Rotator::new(config.rotation_settings(project), store);

    // ==============================================================================
    // 3. Trigger
    // ==============================================================================

    match cli.command.unwrap_or(Command::Rotate) {
        Command::Rotate => {
            // The rotator already logged the failure; only the exit code is ours.
            match rotator.rotate().await {
                Ok(_) => Ok(ExitCode::SUCCESS),
                Err(_) => Ok(ExitCode::FAILURE),
            }
        }
        Command::Serve => {
            server::serve(Arc::new(rotator), config.port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
