//! # volantix Storage Daemon
//!
//! The storage daemon runs on each host and manages the storage pools
//! backing instances, images, custom volumes and object buckets. Pools are
//! described in a YAML config file and brought up at startup; the engine in
//! `volantix-storage` does the actual volume work.
//!
//! ## Features
//! - Pool bring-up with per-pool availability tracking
//! - Optional recovery scan for volumes with no metadata record
//! - Clean pool unmount on SIGTERM/SIGINT
//!
//! ## Usage
//! ```bash
//! volantix-storaged --config /etc/volantix/storaged.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod service;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.log_json {
        volantix_common::init_logging_json(&args.log_level)?;
    } else {
        volantix_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting volantix storage daemon"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match config::Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    cfg.with_cli_overrides(&args)
                }
                Err(e) => {
                    error!(error = %e, path = %config_path, "Failed to load configuration");
                    return Err(e);
                }
            }
        }
        None => {
            // Try default location, fall back to CLI-only config
            let default_path = "/etc/volantix/storaged.yaml";
            match config::Config::load(default_path) {
                Ok(cfg) => {
                    info!(config_path = %default_path, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    config::Config::default_with_cli(&args)
                }
            }
        }
    };

    info!(
        server = %config.daemon.get_server_name(),
        var_dir = %config.daemon.var_dir,
        pools = config.pools.len(),
        "Storage daemon configured"
    );

    // Run until shutdown
    if let Err(e) = service::run(config).await {
        error!(error = %e, "Daemon failed");
        return Err(e);
    }

    Ok(())
}
