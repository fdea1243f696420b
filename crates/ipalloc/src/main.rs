//! IPv4 subnet allocation server
//!
//! Usage:
//!   ipalloc [--config ipalloc.toml] [-v] serve [--host H] [--port P]
//!   ipalloc pools                # Print configured pools

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipalloc::api::{self, AppState};
use ipalloc::{telemetry, AllocationService, BackendRegistry, Config, PoolResolver};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "ipalloc", version, about = "IPv4 subnet allocation service")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "IPALLOC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve {
        /// Override the listen host
        #[arg(long)]
        host: Option<String>,
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the configured pools and exit
    Pools,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(telemetry::level_for_verbosity(cli.verbose), cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Pools => {
            let pools = config.pool_resolver();
            if pools.is_empty() {
                println!("No pools configured.");
            }
            for pool in pools.pools() {
                println!("{}", pool);
            }
            Ok(())
        }
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    config.validate()?;

    let pools = Arc::new(config.pool_resolver());
    if pools.is_empty() {
        tracing::warn!("No pools configured; allocation requests will be rejected");
    } else {
        tracing::info!(environments = ?pools.environments(), "Loaded pools");
    }

    let registry = BackendRegistry::connect(&config.storage)
        .await
        .context("connecting storage backend")?;

    let service = Arc::new(AllocationService::with_config(
        config.lock.service_config(),
        registry.repository()?,
        registry.lock_manager()?,
    ));
    let shutdown = service.shutdown_token();

    let state = Arc::new(
        AppState::new(service, pools).trusting_identity_headers(config.auth.trust_identity_headers),
    );

    let signal_token = shutdown.clone();
    let result = api::start_server(state, &config.server.bind_addr(), async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                signal_token.cancel();
            }
            _ = signal_token.cancelled() => {}
        }
    })
    .await;

    shutdown.cancel();
    registry.shutdown().await;
    tracing::info!("Server stopped");

    result.context("API server failed")
}
