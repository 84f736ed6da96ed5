/*!
 * Bulwark CLI
 */

use anyhow::Context;
use axum::Router;
use bulwark::{
    config::BulwarkConfig,
    error::{BulwarkError, EXIT_RUNTIME, EXIT_SUCCESS},
    logging, ResilienceService,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(version, about = "Resilience layer for database-backed web services", long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults plus BULWARK_* environment when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Debug logging regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server with the resilience gate and health endpoints
    Serve,

    /// Load and validate the configuration, then exit
    CheckConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(()) => EXIT_SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            err.downcast_ref::<BulwarkError>()
                .map_or(EXIT_RUNTIME, BulwarkError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = BulwarkConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::CheckConfig { print } => {
            if print {
                let rendered = toml::to_string_pretty(&config.redacted())
                    .context("Failed to render configuration")?;
                println!("{rendered}");
            }
            println!("Configuration OK");
            Ok(())
        }
        Command::Serve => {
            logging::init_logging(&config.logging, cli.verbose)?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(serve(config))
        }
    }
}

async fn serve(config: BulwarkConfig) -> anyhow::Result<()> {
    let service = ResilienceService::new(config);
    let client = service.postgres_client()?;

    if let Err(err) = client.client().await {
        warn!(error = %err, "Database unavailable at startup, serving degraded");
    }

    let app = service.router(Some(Arc::clone(&client)), Router::new());
    service.serve(app, shutdown_signal()).await?;

    if let Some(manager) = client.current() {
        manager.shutdown().await;
    }
    info!("Bulwark stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
