use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use tracedx::{
    codec::{CodecBroker, LoopbackCodec},
    config, logging, observability,
    server::{self, AppState},
    store::memory::MemoryStore,
};

#[derive(Parser)]
#[command(author, version, about = "tracedx data-provider server CLI")]
struct Cli {
    /// Path to the configuration file; defaults and environment variables
    /// apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the provider server
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Override the configured server port
    #[arg(long)]
    port: Option<u16>,

    /// JSON snapshot to seed the in-memory store from
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start(cli.config, args).await,
    }
}

async fn start(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    observability::init()?;

    let mut config = config::load_or_default(config_path).context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(snapshot) = args.snapshot {
        config.snapshot_path = Some(snapshot);
    }

    let store = match &config.snapshot_path {
        Some(path) => {
            info!("seeding in-memory store from {}", path.display());
            MemoryStore::load_snapshot(path)
                .with_context(|| format!("failed to load snapshot {}", path.display()))?
        }
        None => MemoryStore::new(),
    };

    let (transport, responses) = LoopbackCodec::new();
    let broker = CodecBroker::new(transport, responses, &config);

    let config = Arc::new(config);
    let state = AppState::new(Arc::new(store), broker, Arc::clone(&config));
    server::run(state).await.context("server terminated")?;
    Ok(())
}
