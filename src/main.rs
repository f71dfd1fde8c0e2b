use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use steward::config::StewardConfig;
use steward::OrchestratorState;

#[derive(Parser)]
#[command(
    name = "stewardd",
    about = "Steward — autonomous task orchestration daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to steward.toml (default: ./steward.toml)
    #[arg(long, env = "STEWARD_CONFIG")]
    config: Option<PathBuf>,

    /// REST API port
    #[arg(long, env = "STEWARD_PORT")]
    port: Option<u16>,

    /// Bind address for the REST API (default: 127.0.0.1)
    #[arg(long, env = "STEWARD_BIND")]
    bind_address: Option<String>,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, env = "STEWARD_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon: tick loop plus REST surface (default when no
    /// subcommand is given).
    Serve,
    /// Run exactly one tick and print its summary as JSON.
    Tick,
    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter.unwrap_or("info").to_string();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("steward.toml"));
    let mut config = StewardConfig::load(&config_path)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind_address.clone() {
        config.bind_address = bind;
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Tick => {
            let state = OrchestratorState::in_memory(config);
            let outcome = state.tick.run_tick_safe("cli").await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: StewardConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "stewardd starting");
    let state = OrchestratorState::in_memory(config);

    // Agents from a previous daemon incarnation are not ours to keep.
    let orphans = state.executor.cleanup_orphans();
    if orphans > 0 {
        warn!(orphans, "terminated orphaned agent processes from previous run");
    }

    state.tick.start_tick_loop().await;

    let result = steward::rest::start_rest_server(state.clone()).await;

    state.tick.stop_tick_loop().await;
    result
}
