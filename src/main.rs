use std::sync::Arc;

use clap::Parser;
use connector_manager::{Args, config, daemon};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    info!("Starting Connector Manager");

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(err) => {
            error!("Invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };
    info!("DFSP: {}", settings.dfsp_id);
    info!("Hub URL: {}", settings.hub.url);

    if let Err(err) = daemon::run_daemon(Arc::new(settings)).await {
        error!("Connector manager failed: {err:#}");
        std::process::exit(1);
    }
    info!("Connector manager stopped");
}

fn load_settings(args: &Args) -> anyhow::Result<config::Settings> {
    let mut settings = config::Settings::new(args.config.clone())?;
    settings.merge_with_args(args);
    settings.validate()?;
    Ok(settings)
}
