//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// HTTP gateway for a cluster job scheduler
#[derive(Parser, Debug)]
#[command(name = "grid-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GRID_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address override (host:port)
    #[arg(long, env = "GRID_GATEWAY_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GRID_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GRID_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Disable the JSON-RPC endpoint
    #[arg(long)]
    pub no_rpc: bool,
}
