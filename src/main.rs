//! Tresdice service binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tresdice::affiliate::AffiliateWorker;
use tresdice::api::ApiServer;
use tresdice::chain::{ChainClient, MockChainClient};
use tresdice::config::ConfigLoader;
use tresdice::reconciler::DepositPoller;
use tresdice::{CasinoError, CasinoResult, ServiceContainer};

/// Tresdice dice casino settlement engine
#[derive(Parser)]
#[command(name = "tresdice")]
#[command(about = "Provably-fair dice casino settlement engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server with background workers (default)
    Serve,

    /// Print the effective configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> CasinoResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let config = loader.load()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::CheckConfig => {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| CasinoError::Configuration(e.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: tresdice::CasinoConfig) -> CasinoResult<()> {
    // TODO: swap in the real TRON client once the signer service is deployed.
    let chain: Arc<dyn ChainClient> = Arc::new(MockChainClient::new());
    let container = Arc::new(ServiceContainer::new(config.clone(), chain)?);

    let poller = DepositPoller::new(container.reconciler(), &config.reconciler);
    tokio::spawn(poller.run());

    let accrual = AffiliateWorker::new(container.affiliate(), &config.affiliate);
    tokio::spawn(accrual.run());

    ApiServer::new(config.api.clone(), container).run().await
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "tresdice=debug,tower_http=debug"
    } else {
        "tresdice=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
