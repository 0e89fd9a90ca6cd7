//! quarry - a persistent, distributed job queue server.
//!
//! Usage:
//!   quarry serve [--config quarry.yaml]   Run the job server and HTTP facade
//!   quarry check-config <file>            Validate a configuration file

use clap::{Parser, Subcommand};
use quarry::{
    api, load_config, AccessGate, AccessRule, Config, JobServer, MemoryStore, Scope, StoreConfig,
    TracingCallLog,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// quarry - a persistent, distributed job queue server
#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job server with the HTTP facade
    Serve {
        /// Path to the YAML configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Admit every caller to every method (development only)
        #[arg(long)]
        open_gate: bool,
    },

    /// Validate a configuration file without running
    CheckConfig {
        /// Path to the YAML configuration file
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, open_gate } => {
            let config = match config {
                Some(path) => match load_config(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        error!("failed to load {}: {}", path.display(), e);
                        std::process::exit(1);
                    }
                },
                None => Config::default(),
            };
            if let Err(e) = serve(config, open_gate).await {
                error!("server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::CheckConfig { config } => match load_config(&config) {
            Ok(parsed) => {
                info!(
                    collection = %parsed.server.collection,
                    "Configuration is valid"
                );
            }
            Err(e) => {
                error!("invalid configuration: {}", e);
                std::process::exit(1);
            }
        },
    }
}

async fn serve(config: Config, open_gate: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn quarry::JobStore> = match &config.store {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        #[cfg(feature = "sqlite")]
        StoreConfig::Sqlite { path } => Arc::new(quarry::SqliteStore::new(path).await?),
        #[cfg(not(feature = "sqlite"))]
        StoreConfig::Sqlite { .. } => {
            return Err("built without the sqlite feature".into());
        }
    };

    let mut gate = AccessGate::new();
    if open_gate {
        gate.allow(Scope::Admin, AccessRule::anyone());
        info!("Gate is open: every caller is admitted");
    }

    let start_stopped = config.server.start_stopped;
    let server = Arc::new(JobServer::with_gate(store, gate, config.server));
    server.install_call_log(Arc::new(TracingCallLog))?;

    let recovered = server.recover().await?;
    if recovered > 0 {
        info!(count = recovered, "Force-failed interrupted runs from a previous process");
    }

    if start_stopped {
        info!("Job flow is stopped; call startJobs to begin");
    } else {
        server.start_jobs().await?;
    }

    let api_task = api::start_server(config.api, Arc::clone(&server)).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop_jobs(Default::default()).await?;
    api_task.abort();
    Ok(())
}
