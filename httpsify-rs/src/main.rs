//! httpsify: HTTPS offloader with automatic certificates

use clap::Parser;
use httpsify_rs::ddns::DdnsCredentials;
use httpsify_rs::{Args, Config};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| httpsify_rs::DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting httpsify-rs v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    if let Some(ref path) = args.config {
        info!("Loading configuration from {}", path.display());
    }

    let config = match Config::load(args, DdnsCredentials::from_env()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = httpsify_rs::run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Bye");
    Ok(())
}
