use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (default: connector-manager.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// DFSP identifier registered with the hub
    #[arg(long, env = "CONNMGR_DFSP_ID")]
    pub dfsp_id: Option<String>,

    /// Hub registry base URL
    #[arg(long, env = "CONNMGR_HUB_URL")]
    pub hub_url: Option<String>,

    /// Control-plane WebSocket listen address
    #[arg(long)]
    pub listen_addr: Option<String>,
}
