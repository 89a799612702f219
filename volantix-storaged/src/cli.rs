//! Command-line argument parsing.

use clap::Parser;

/// volantix Storage Daemon - Host storage pool manager
#[derive(Parser, Debug)]
#[command(name = "volantix-storaged")]
#[command(about = "volantix Storage Daemon - Host storage pool manager")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Name this host reports as a volume location (hostname if not set)
    #[arg(long)]
    pub server_name: Option<String>,

    /// State directory for pool mounts and instance symlinks
    #[arg(long)]
    pub var_dir: Option<String>,

    /// Scan pools for unknown volumes after bring-up
    #[arg(long)]
    pub recover: bool,
}
