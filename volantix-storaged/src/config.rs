//! Configuration management for the storage daemon.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Args;

/// Environment variables layered over the config file, nested keys joined
/// with `__`, e.g. `VOLANTIX_DAEMON__VAR_DIR=/srv/volantix`.
const ENV_PREFIX: &str = "VOLANTIX";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon-wide settings
    pub daemon: DaemonConfig,
    /// Disaster recovery behavior
    pub recovery: RecoveryConfig,
    /// Storage pools to bring up at startup
    pub pools: Vec<PoolConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            recovery: RecoveryConfig::default(),
            pools: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, with `VOLANTIX_` environment
    /// variables layered on top.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = settings
            .try_deserialize()
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref server_name) = args.server_name {
            self.daemon.server_name = Some(server_name.clone());
        }

        if let Some(ref var_dir) = args.var_dir {
            self.daemon.var_dir = var_dir.clone();
        }

        if args.recover {
            self.recovery.scan_on_start = true;
        }

        self
    }

    /// Build a configuration from CLI arguments and defaults alone.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Name this host reports as a volume location (hostname if not set)
    pub server_name: Option<String>,
    /// State directory for pool mounts and instance symlinks
    pub var_dir: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            var_dir: "/var/lib/volantix".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Get the server name, detecting the hostname if not set.
    pub fn get_server_name(&self) -> String {
        self.server_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string())
        })
    }
}

/// Disaster recovery behavior.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Scan pools for unknown volumes after bring-up
    pub scan_on_start: bool,
}

/// One storage pool to bring up at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Pool name
    pub name: String,
    /// Storage driver name
    pub driver: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Engine and driver config keys
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["volantix-storaged"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.var_dir, "/var/lib/volantix");
        assert!(config.daemon.server_name.is_none());
        assert!(!config.recovery.scan_on_start);
        assert!(config.pools.is_empty());
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default_with_cli(&args(&[
            "--server-name",
            "node1",
            "--var-dir",
            "/srv/volantix",
            "--recover",
        ]));

        assert_eq!(config.daemon.get_server_name(), "node1");
        assert_eq!(config.daemon.var_dir, "/srv/volantix");
        assert!(config.recovery.scan_on_start);
    }

    #[test]
    fn test_load_yaml() {
        let path = std::env::temp_dir()
            .join(format!("volantix-storaged-cfg-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            concat!(
                "daemon:\n",
                "  server_name: node1\n",
                "pools:\n",
                "  - name: local\n",
                "    driver: dir\n",
                "    description: Local scratch pool\n",
                "    config:\n",
                "      size: 10GiB\n",
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.daemon.server_name.as_deref(), Some("node1"));
        assert_eq!(config.daemon.var_dir, "/var/lib/volantix");
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].name, "local");
        assert_eq!(config.pools[0].driver, "dir");
        assert_eq!(config.pools[0].description, "Local scratch pool");
        assert_eq!(
            config.pools[0].config.get("size").map(String::as_str),
            Some("10GiB")
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/does/not/exist.yaml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
