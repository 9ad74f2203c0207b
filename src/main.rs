// src/main.rs

//! # Hotserve Main Entry Point
//!
//! Loads the configuration, installs logging, runs the dev server until Ctrl-C and
//! then shuts it down in order.

use anyhow::Result;
use hotserve::{DevServer, ServerConfig};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match ServerConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!("Hotserve starting with configuration: {:?}", config);

    let server = match DevServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error starting server: {}", e);
            std::process::exit(1);
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl-C received, initiating shutdown..."),
        Err(err) => tracing::error!("Failed to listen for Ctrl-C signal: {}", err),
    }

    server.stop().await;
    tracing::info!("Hotserve shut down gracefully.");
    Ok(())
}
