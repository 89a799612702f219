//! Daemon lifecycle: pool bring-up, optional recovery scan, clean shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use volantix_storage::drivers::dir::DirDriver;
use volantix_storage::mock::MockDriver;
use volantix_storage::types::PoolStatus;
use volantix_storage::{Backend, EngineState, PoolRecord};

use crate::config::{Config, PoolConfig};

/// Bring the configured pools up and run until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let state = EngineState::builder()
        .server_name(config.daemon.get_server_name())
        .var_dir(&config.daemon.var_dir)
        .build();

    let backends = bring_up_pools(&config, &state).await?;
    if backends.is_empty() {
        warn!("No storage pools configured");
    }

    if config.recovery.scan_on_start {
        scan_pools(&backends).await;
    }

    info!(pools = backends.len(), "Storage daemon ready");

    wait_for_shutdown_signal().await?;

    for backend in &backends {
        if let Err(e) = backend.unmount().await {
            warn!(pool = %backend.name(), error = %e, "Failed unmounting pool during shutdown");
        }
    }
    info!("Storage daemon stopped");

    Ok(())
}

/// Create and mount every configured pool. Creation failures abort startup;
/// mount failures leave the pool marked unavailable and bring-up continues.
pub(crate) async fn bring_up_pools(
    config: &Config,
    state: &Arc<EngineState>,
) -> Result<Vec<Arc<Backend>>> {
    let mut backends = Vec::with_capacity(config.pools.len());

    for pool_config in &config.pools {
        let backend = bring_up_pool(pool_config, config, state)
            .await
            .with_context(|| {
                format!("Failed bringing up storage pool {:?}", pool_config.name)
            })?;
        backends.push(backend);
    }

    Ok(backends)
}

async fn bring_up_pool(
    pool_config: &PoolConfig,
    config: &Config,
    state: &Arc<EngineState>,
) -> Result<Arc<Backend>> {
    let record = PoolRecord {
        name: pool_config.name.clone(),
        driver: pool_config.driver.clone(),
        description: pool_config.description.clone(),
        config: pool_config.config.clone(),
        status: PoolStatus::Pending,
    };

    let backend = match pool_config.driver.as_str() {
        "dir" => Backend::new(
            record,
            DirDriver::new(Path::new(&config.daemon.var_dir)),
            state.clone(),
        ),
        "mock" => Backend::new(record, MockDriver::new(), state.clone()),
        other => return Err(anyhow::anyhow!("Unknown storage driver {other:?}")),
    };
    let backend = Arc::new(backend);

    backend.create().await?;
    if let Err(e) = backend.mount().await {
        warn!(pool = %backend.name(), error = %e, "Pool storage failed to mount; pool is unavailable");
    }

    Ok(backend)
}

/// Report volumes found on storage with no matching record. The daemon only
/// logs what it finds; importing is an operator action.
async fn scan_pools(backends: &[Arc<Backend>]) {
    for backend in backends {
        // No instances are registered at startup, so every instance volume
        // found on storage is reported as unknown.
        match backend.list_unknown_volumes(&[]).await {
            Ok(found) if found.is_empty() => {
                info!(pool = %backend.name(), "Recovery scan found no unknown volumes");
            }
            Ok(found) => {
                for entry in &found {
                    if let Some(vol) = &entry.volume {
                        info!(
                            pool = %backend.name(),
                            project = %vol.project,
                            volume = %vol.name,
                            "Unknown volume on storage"
                        );
                    } else if let Some(bucket) = &entry.bucket {
                        info!(
                            pool = %backend.name(),
                            project = %bucket.project,
                            bucket = %bucket.name,
                            "Unknown bucket on storage"
                        );
                    }
                }
                info!(pool = %backend.name(), count = found.len(), "Recovery scan complete");
            }
            Err(e) => {
                warn!(pool = %backend.name(), error = %e, "Recovery scan failed");
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or Ctrl+C).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, RecoveryConfig};
    use std::collections::HashMap;

    fn test_config(pools: Vec<PoolConfig>) -> Config {
        Config {
            daemon: DaemonConfig {
                server_name: Some("node1".to_string()),
                var_dir: std::env::temp_dir()
                    .join(format!("volantix-storaged-{}", std::process::id()))
                    .to_string_lossy()
                    .to_string(),
            },
            recovery: RecoveryConfig::default(),
            pools,
        }
    }

    fn mock_pool(name: &str) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_bring_up_creates_and_mounts_pools() {
        let config = test_config(vec![mock_pool("p1"), mock_pool("p2")]);
        let state = EngineState::builder()
            .var_dir(&config.daemon.var_dir)
            .build();

        let backends = bring_up_pools(&config, &state).await.unwrap();

        assert_eq!(backends.len(), 2);
        for backend in &backends {
            assert_eq!(backend.pool_record().await.status, PoolStatus::Created);
            assert!(!state.availability.is_unavailable(backend.name()).await);
        }
    }

    #[tokio::test]
    async fn test_unknown_driver_aborts_startup() {
        let config = test_config(vec![PoolConfig {
            name: "p1".to_string(),
            driver: "zfs".to_string(),
            description: String::new(),
            config: HashMap::new(),
        }]);
        let state = EngineState::builder().build();

        let err = bring_up_pools(&config, &state).await.unwrap_err();
        assert!(format!("{err:#}").contains("p1"));
    }
}
