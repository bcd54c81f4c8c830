use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod config;
mod data_model;
mod http_objects;
mod lookup;
mod metrics;
mod orchestrator;
mod prober;
mod reconciler;
mod routes;
mod selector;
mod service;
mod state_store;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();
    let config = match cli.config.as_deref().and_then(|p| p.to_str()) {
        Some(path) => match config::ServerConfig::from_path(path) {
            Ok(config) => config,
            Err(err) => {
                error!("error loading config from {}: {:#}", path, err);
                std::process::exit(1);
            }
        },
        None => config::ServerConfig::default(),
    };

    let service = match service::Service::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("error building service: {:#}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = service.start().await {
        error!("error starting service: {:#}", err);
    }
}
