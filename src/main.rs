use std::path::PathBuf;

use ::tracing::{error, info, info_span, Instrument};
use clap::Parser;
use service::Service;

mod acl;
mod config;
mod fleet;
mod http_objects;
mod integration_test;
mod metrics;
mod middleware;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading config {}: {:?}", path.display(), err);
                std::process::exit(1);
            }
        },
        None => config::ServerConfig::default(),
    };
    // pin the instance id so every span reports the same one
    config.telemetry.instance_id = Some(config.instance_id());

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            std::process::exit(1);
        }
    };

    let root_span = info_span!(
        "fleet",
        env = config.env,
        "fleet-instance" = config.instance_id()
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build_timestamp = env!("VERGEN_BUILD_TIMESTAMP"),
        "starting fleet server"
    );

    async {
        match Service::new(config).await {
            Ok(service) => {
                if let Err(err) = service.start().await {
                    error!("Error starting service: {:?}", err);
                }
            }
            Err(err) => error!("Error creating service: {:?}", err),
        }
    }
    .instrument(root_span)
    .await;

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
}
