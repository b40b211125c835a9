#![doc = include_str!("../README.md")]

mod telemetry;

use clap::Parser;
use keelson::{CliArgs, RoutesBuilder, Server, ServerConfig};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Hosts the keelson health, reflection and metrics endpoints.
#[derive(Parser, Debug)]
#[command(name = "keelson-server", version, about)]
struct Cli {
    #[command(flatten)]
    server: CliArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli.server)?;

    let providers = telemetry::init_telemetry(config.environment)?;

    // No application services: health and reflection are always registered.
    let result = Server::new(config, |_: &mut RoutesBuilder| {}).run().await;

    match &result {
        Ok(()) => tracing::info!("Service shut down successfully"),
        Err(err) => tracing::error!(error = %err, "Service stopped with an error"),
    }
    providers.shutdown();

    Ok(result?)
}
