//! Energy consumption forecasting service CLI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, open_object_store};
use mlops_service::{build_service, commands};
use tracing_subscriber::EnvFilter;

/// Forecast training and prediction service
#[derive(Parser)]
#[command(name = "mlops")]
#[command(about = "Train and serve energy consumption forecasts")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// API token of the caller
    #[arg(long, global = true, env = "MLOPS_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a training job and run it to completion
    Train {
        /// Number of training epochs
        #[arg(short, long, default_value = "10")]
        epochs: usize,

        /// Print the terminal job record when done
        #[arg(short, long)]
        wait: bool,
    },

    /// Show the status of a training job
    Status {
        /// Job identifier returned by `train`
        #[arg(short, long)]
        job_id: String,
    },

    /// Predict from a JSON request file
    Predict {
        /// Path to a `{"features": [...]}` file
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let store = open_object_store(&config.store_root)?;
    let service = build_service(&config, store).await?;
    let token = cli.token.unwrap_or_default();

    match cli.command {
        Commands::Train { epochs, wait } => {
            commands::train::run(&service, &token, epochs, wait).await?;
        }
        Commands::Status { job_id } => {
            commands::status::run(&service, &token, &job_id).await?;
        }
        Commands::Predict { input } => {
            commands::predict::run(&service, &token, &input).await?;
        }
    }

    Ok(())
}
