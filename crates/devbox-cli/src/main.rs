//! devboxctl - one-shot management of development containers
//!
//! Every invocation synchronises with the control plane, runs a single
//! operation and prints the result envelope as JSON on stdout.

use clap::{Parser, Subcommand};
use devbox_common::ContainerId;
use devbox_orchestrator::{DevboxConfig, Orchestrator};
use std::process::ExitCode;
use tracing::debug;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "devboxctl")]
#[command(about = "Manage LXC development containers", long_about = None)]
#[command(version)]
struct Cli {
    /// Profile catalog (YAML); the built-in catalog is used when unset
    #[arg(long)]
    catalog: Option<String>,

    /// Enable debug logging on stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// List managed containers
    #[command(alias = "ls")]
    List,

    /// Clone the base template into a new container
    Create {
        name: String,
        /// Preferred container id
        #[arg(long)]
        id: Option<ContainerId>,
        /// Template profile to apply after start
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Show record, configuration, resources and access hints
    Info { id: ContainerId },

    Start { id: ContainerId },

    Stop { id: ContainerId },

    Restart { id: ContainerId },

    /// Delete a container and its storage
    #[command(alias = "rm")]
    Destroy { id: ContainerId },

    /// Snapshot-mode backup
    Backup { id: ContainerId },

    /// Apply a template profile to a running container
    ApplyTemplate { id: ContainerId, profile: String },

    /// Live resource usage
    Monitor { id: ContainerId },

    /// Log the coding assistant in to the given providers
    ConfigureAssistant {
        id: ContainerId,
        #[arg(long = "provider")]
        providers: Vec<String>,
    },

    /// List template profiles
    Profiles,
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // stdout carries the JSON envelope only.
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let mut config = DevboxConfig::load()?;
    if let Some(path) = cli.catalog.as_deref() {
        config.catalog_path = Some(path.into());
    }
    let orchestrator = Orchestrator::from_config(&config)?;
    debug!(command = ?cli.command, "Running command");

    let report = commands::execute(cli.command, &orchestrator).await?;
    println!("{}", serde_json::to_string_pretty(&report.body)?);
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
