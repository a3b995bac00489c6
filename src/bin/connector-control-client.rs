use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use connector_manager::control::{FileApplier, run_session};
use connector_manager::retry::{RetryPolicy, RetryableTask, action, run_to_completion};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Applies connector configuration pushed by the manager")]
struct Args {
    /// Control channel URL of the connector manager
    #[arg(long, env = "CONNMGR_CONTROL_URL", default_value = "ws://127.0.0.1:4003/")]
    url: String,

    /// Directory receiving certificates, keys and peer JWS keys
    #[arg(long, env = "CONNMGR_OUT_DIR", default_value = "connector-config")]
    out_dir: PathBuf,

    /// Delay between reconnection attempts
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    reconnect_interval: Duration,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    info!("Writing connector configuration to {}", args.out_dir.display());

    let applier = Arc::new(FileApplier::new(args.out_dir));
    let url = args.url;
    let mut task = RetryableTask::new(
        "control-session",
        RetryPolicy {
            interval: args.reconnect_interval,
            max_retries: None,
        },
        action(move || {
            let applier = Arc::clone(&applier);
            let url = url.clone();
            async move { run_session(&url, applier.as_ref()).await }
        }),
    );

    if let Err(err) = run_to_completion(&mut task, tokio::time::sleep).await {
        error!("Control client stopped: {err:#}");
        std::process::exit(1);
    }
}
