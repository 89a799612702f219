//! Pool backend orchestration.
//!
//! A [`Backend`] pairs one pool record with its storage driver and runs
//! every volume lifecycle operation against the shared [`EngineState`].
//! Mutating operations follow one shape:
//!
//! ```text
//! readiness check
//!   └─> open a rollback list
//!         └─> record mutation (creates) / physical work (deletes)
//!               └─> driver call
//!                     └─> symlink presentation
//!                           └─> commit (disarm) or replay undo actions
//! ```
//!
//! Record mutations come first on create paths so the driver can resolve
//! volumes by name; deletes run physical-first so a failed delete leaves
//! the record behind for a retry. Every side effect pushes its inverse
//! [`UndoAction`] immediately after succeeding.

pub mod buckets;
mod custom;
mod images;
mod instances;
mod recovery;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::availability::PoolAvailabilityTracker;
use crate::config;
use crate::drivers::{Driver, Volume};
use crate::error::{Result, StorageError};
use crate::events::{EventKind, EventLog};
use crate::instance::Instance;
use crate::locking::AdvisoryLocks;
use crate::migration;
use crate::paths;
use crate::records::{MemoryVolumeStore, PoolRecord, VolumeRecord, VolumeStore};
use crate::rollback::{Rollback, UndoAction};
use crate::types::{DriverInfo, PoolStatus, PoolUsage, VolumeType};

pub use buckets::BucketGateway;

/// Access registration hooks invoked as volumes appear, move, and vanish.
///
/// Registration failures never fail the storage operation; they are logged
/// and the records drift until the next reconciliation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn add_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<()>;

    async fn rename_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        old_name: &str,
        new_name: &str,
    ) -> Result<()>;

    async fn delete_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<()>;
}

/// Authorizer that accepts everything.
#[derive(Debug, Default)]
pub struct NoopAuthorizer;

#[async_trait]
impl Authorizer for NoopAuthorizer {
    async fn add_volume(&self, _: &str, _: &str, _: VolumeType, _: &str) -> Result<()> {
        Ok(())
    }

    async fn rename_volume(&self, _: &str, _: &str, _: VolumeType, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_volume(&self, _: &str, _: &str, _: VolumeType, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Gateway used when no object service is configured.
#[derive(Debug, Default)]
struct DisabledGateway;

#[async_trait]
impl BucketGateway for DisabledGateway {
    async fn ensure_running(&self, _: &str, _: &std::path::Path) -> Result<()> {
        Err(StorageError::NotSupported(
            "No object storage gateway configured".to_string(),
        ))
    }

    async fn stop(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn make_bucket(&self, _: &str) -> Result<()> {
        Err(StorageError::NotSupported(
            "No object storage gateway configured".to_string(),
        ))
    }

    async fn remove_bucket(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn bucket_exists(&self, _: &str) -> Result<bool> {
        Ok(false)
    }

    async fn put_service_account(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
        Err(StorageError::NotSupported(
            "No object storage gateway configured".to_string(),
        ))
    }

    async fn delete_service_account(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn list_service_accounts(&self, _: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn service_url(&self) -> String {
        String::new()
    }
}

/// Shared state every backend on this member operates against.
pub struct EngineState {
    pub store: Arc<dyn VolumeStore>,
    pub locks: AdvisoryLocks,
    pub availability: PoolAvailabilityTracker,
    pub events: EventLog,
    pub authorizer: Arc<dyn Authorizer>,
    pub gateway: Arc<dyn BucketGateway>,
    pub server_name: String,
    pub var_dir: PathBuf,
}

impl EngineState {
    pub fn builder() -> EngineStateBuilder {
        EngineStateBuilder::default()
    }
}

/// Builder for [`EngineState`] with in-memory defaults.
#[derive(Default)]
pub struct EngineStateBuilder {
    store: Option<Arc<dyn VolumeStore>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    gateway: Option<Arc<dyn BucketGateway>>,
    server_name: Option<String>,
    var_dir: Option<PathBuf>,
    event_capacity: Option<usize>,
}

impl EngineStateBuilder {
    pub fn store(mut self, store: Arc<dyn VolumeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn BucketGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn var_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.var_dir = Some(dir.into());
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Arc<EngineState> {
        Arc::new(EngineState {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryVolumeStore::new())),
            locks: AdvisoryLocks::new(),
            availability: PoolAvailabilityTracker::new(),
            events: self
                .event_capacity
                .map(EventLog::new)
                .unwrap_or_default(),
            authorizer: self.authorizer.unwrap_or_else(|| Arc::new(NoopAuthorizer)),
            gateway: self.gateway.unwrap_or_else(|| Arc::new(DisabledGateway)),
            server_name: self.server_name.unwrap_or_else(|| "localhost".to_string()),
            var_dir: self
                .var_dir
                .unwrap_or_else(|| PathBuf::from("/var/lib/volantix")),
        })
    }
}

/// Orchestrator for one storage pool.
pub struct Backend {
    name: String,
    pool: RwLock<PoolRecord>,
    driver: Arc<dyn Driver>,
    state: Arc<EngineState>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(pool: PoolRecord, driver: impl Driver + 'static, state: Arc<EngineState>) -> Self {
        Self {
            name: pool.name.clone(),
            pool: RwLock::new(pool),
            driver: Arc::new(driver),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_info(&self) -> DriverInfo {
        self.driver.info()
    }

    pub async fn pool_record(&self) -> PoolRecord {
        self.pool.read().await.clone()
    }

    /// True when `other` orchestrates the same pool instance.
    pub fn is_same_pool(&self, other: &Backend) -> bool {
        std::ptr::eq(self, other)
    }

    /// Gate every volume operation: the pool must be fully created and not
    /// marked unavailable on this member.
    pub async fn is_status_ready(&self) -> Result<()> {
        let status = self.pool.read().await.status;
        if status != PoolStatus::Created {
            return Err(StorageError::unavailable(format!(
                "Storage pool {:?} is not fully created (status: {status})",
                self.name
            )));
        }

        if self.state.availability.is_unavailable(&self.name).await {
            return Err(StorageError::unavailable(format!(
                "Storage pool {:?} is unavailable on this member",
                self.name
            )));
        }

        Ok(())
    }

    // Pool lifecycle.

    /// Create the pool: record first with status `Pending`, then the
    /// driver-side storage, then promote to `Created`.
    #[instrument(skip_all, fields(pool = %self.name))]
    pub async fn create(&self) -> Result<()> {
        let pool = self.pool.read().await.clone();
        let info = self.driver.info();
        if pool.driver != info.name {
            return Err(StorageError::Validation(format!(
                "Pool {:?} wants driver {:?} but the backend runs {:?}",
                pool.name, pool.driver, info.name
            )));
        }
        self.driver.validate_pool(&pool.config).await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let mut record = pool.clone();
            record.status = PoolStatus::Pending;
            self.state.store.create_pool(record.clone()).await?;
            rollback.push(UndoAction::DeletePoolRecord {
                name: record.name.clone(),
            });

            self.driver.create_pool(&record).await?;
            rollback.push(UndoAction::DeletePhysicalPool {
                name: record.name.clone(),
            });

            record.status = PoolStatus::Created;
            self.state.store.update_pool(record.clone()).await?;
            self.pool.write().await.status = PoolStatus::Created;
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        info!(pool = %self.name, driver = %info.name, "Storage pool created");
        self.emit(EventKind::PoolCreated, "", &self.name).await;
        Ok(())
    }

    /// Apply a description and config change to the pool.
    #[instrument(skip_all, fields(pool = %self.name))]
    pub async fn update(
        &self,
        new_description: &str,
        new_config: HashMap<String, String>,
    ) -> Result<()> {
        let pool = self.pool.read().await.clone();
        let (changed, user_only) = config::detect_changed_config(&pool.config, &new_config);
        if changed.is_empty() && pool.description == new_description {
            return Ok(());
        }

        if changed.contains_key("source") && pool.status != PoolStatus::Pending {
            return Err(StorageError::Validation(
                "Pool source cannot be changed after creation".to_string(),
            ));
        }

        if let (Some(old), Some(new)) = (pool.config.get("size"), new_config.get("size")) {
            if !old.is_empty()
                && !new.is_empty()
                && config::parse_size(new)? < config::parse_size(old)?
            {
                return Err(StorageError::Validation(
                    "Pool size cannot be shrunk".to_string(),
                ));
            }
        }

        self.driver.validate_pool(&new_config).await?;

        let mut updated = pool.clone();
        updated.description = new_description.to_string();
        updated.config = new_config;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.state.store.update_pool(updated.clone()).await?;
            rollback.push(UndoAction::RestorePoolRecord {
                record: pool.clone(),
            });

            if !user_only {
                self.driver.update_pool(&updated, &changed).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        *self.pool.write().await = updated;
        self.emit(EventKind::PoolUpdated, "", &self.name).await;
        Ok(())
    }

    /// Delete the pool. Refused while any volume or bucket record remains.
    #[instrument(skip_all, fields(pool = %self.name))]
    pub async fn delete(&self) -> Result<()> {
        let volumes = self.state.store.list_volumes(&self.name).await?;
        if !volumes.is_empty() {
            return Err(StorageError::conflict(format!(
                "Storage pool {:?} still contains {} volume(s)",
                self.name,
                volumes.len()
            )));
        }
        let buckets = self.state.store.list_buckets(&self.name).await?;
        if !buckets.is_empty() {
            return Err(StorageError::conflict(format!(
                "Storage pool {:?} still contains {} bucket(s)",
                self.name,
                buckets.len()
            )));
        }

        let pool = self.pool.read().await.clone();
        self.driver.delete_pool(&pool).await?;
        self.state.store.delete_pool(&self.name).await?;
        self.state.availability.mark_available(&self.name).await;

        info!(pool = %self.name, "Storage pool deleted");
        self.emit(EventKind::PoolDeleted, "", &self.name).await;
        Ok(())
    }

    /// Mount the pool, tracking availability. Returns true when this call
    /// performed the mount.
    #[instrument(skip_all, fields(pool = %self.name))]
    pub async fn mount(&self) -> Result<bool> {
        let pool = self.pool.read().await.clone();
        match self.driver.mount_pool(&pool).await {
            Ok(mounted) => {
                self.state.availability.mark_available(&self.name).await;
                if mounted {
                    self.emit(EventKind::PoolMounted, "", &self.name).await;
                }
                Ok(mounted)
            }
            Err(e) => {
                self.state.availability.mark_unavailable(&self.name).await;
                Err(e)
            }
        }
    }

    /// Unmount the pool. Returns true when it was mounted.
    #[instrument(skip_all, fields(pool = %self.name))]
    pub async fn unmount(&self) -> Result<bool> {
        let pool = self.pool.read().await.clone();
        let unmounted = self.driver.unmount_pool(&pool).await?;
        if unmounted {
            self.emit(EventKind::PoolUnmounted, "", &self.name).await;
        }
        Ok(unmounted)
    }

    /// Driver-reported pool capacity.
    pub async fn usage(&self) -> Result<PoolUsage> {
        self.is_status_ready().await?;
        let pool = self.pool.read().await.clone();
        self.driver.pool_usage(&pool).await
    }

    // Rollback interpretation.

    /// Replay pending undo actions newest-first. Failures are logged and
    /// skipped; the primary error already dominates.
    pub async fn run_undo(&self, rollback: Rollback) {
        for action in rollback.take_pending() {
            debug!(pool = %self.name, action = ?action, "Reverting operation step");
            if let Err(e) = self.apply_undo(&action).await {
                warn!(pool = %self.name, action = ?action, error = %e, "Rollback step failed");
            }
        }
    }

    async fn apply_undo(&self, action: &UndoAction) -> Result<()> {
        match action {
            UndoAction::DeleteVolumeRecord {
                project,
                vol_type,
                name,
            } => {
                self.state
                    .store
                    .delete_volume(project, &self.name, *vol_type, name)
                    .await
            }
            UndoAction::RestoreVolumeRecord { record } => {
                let exists = self
                    .state
                    .store
                    .volume_exists(&record.project, &record.pool, record.vol_type, &record.name)
                    .await?;
                if exists {
                    self.state.store.update_volume(record.clone()).await
                } else {
                    self.state.store.create_volume(record.clone()).await
                }
            }
            UndoAction::RenameVolumeRecord {
                project,
                vol_type,
                from,
                to,
            } => {
                self.state
                    .store
                    .rename_volume(project, &self.name, *vol_type, from, to)
                    .await
            }
            UndoAction::DeletePhysicalVolume {
                vol_type,
                content_type,
                storage_name,
                config,
            } => {
                let vol =
                    self.volume_handle(*vol_type, *content_type, storage_name, config.clone());
                self.driver.delete_volume(&vol).await
            }
            UndoAction::RenamePhysicalVolume {
                vol_type,
                content_type,
                from,
                to,
                config,
            } => {
                let vol = self.volume_handle(*vol_type, *content_type, from, config.clone());
                self.driver.rename_volume(&vol, to).await
            }
            UndoAction::DeletePoolRecord { name } => self.state.store.delete_pool(name).await,
            UndoAction::DeletePhysicalPool { .. } => {
                let pool = self.pool.read().await.clone();
                self.driver.delete_pool(&pool).await
            }
            UndoAction::RestorePoolRecord { record } => {
                self.state.store.update_pool(record.clone()).await
            }
            UndoAction::DeleteBucketRecord { project, name } => {
                self.state
                    .store
                    .delete_bucket(project, &self.name, name)
                    .await
            }
            UndoAction::DeleteBucketKeyRecord {
                project,
                bucket,
                key,
            } => {
                self.state
                    .store
                    .delete_bucket_key(project, &self.name, bucket, key)
                    .await
            }
            UndoAction::DeleteGatewayBucket { storage_name } => {
                self.state.gateway.remove_bucket(storage_name).await
            }
            UndoAction::DeleteGatewayServiceAccount { access_key } => {
                self.state.gateway.delete_service_account(access_key).await
            }
            UndoAction::RemoveSymlink { link } => paths::remove_symlink(link).await,
            UndoAction::EnsureSymlink { link, target } => {
                paths::ensure_symlink(link, target).await
            }
            UndoAction::RevokeAuthorizer {
                project,
                vol_type,
                name,
            } => {
                self.state
                    .authorizer
                    .delete_volume(project, &self.name, *vol_type, name)
                    .await
            }
        }
    }

    // Shared helpers for the per-kind operation families.

    pub(crate) fn volume_handle(
        &self,
        vol_type: VolumeType,
        content_type: crate::types::ContentType,
        storage_name: &str,
        config: HashMap<String, String>,
    ) -> Volume {
        Volume::new(
            &self.state.var_dir,
            &self.name,
            vol_type,
            content_type,
            storage_name,
            config,
        )
    }

    /// Driver-level handle for an existing volume record.
    pub(crate) fn volume_for_record(&self, record: &VolumeRecord) -> Volume {
        let storage = paths::storage_name(record.vol_type, &record.project, &record.name);
        self.volume_handle(
            record.vol_type,
            record.content_type,
            &storage,
            record.config.clone(),
        )
    }

    /// Build a volume handle for a new volume: pool `volume.*` defaults are
    /// applied where the kind's schema recognizes them, the driver fills its
    /// own defaults, then the config is validated.
    pub(crate) async fn prepare_volume(
        &self,
        vol_type: VolumeType,
        content_type: crate::types::ContentType,
        storage_name: &str,
        mut config: HashMap<String, String>,
    ) -> Result<Volume> {
        let driver_keys = self.driver.config_keys();
        {
            let pool = self.pool.read().await;
            for (key, value) in &pool.config {
                let Some(suffix) = key.strip_prefix("volume.") else {
                    continue;
                };
                if !config::volume_key_recognized(vol_type, content_type, suffix, &driver_keys) {
                    continue;
                }
                config
                    .entry(suffix.to_string())
                    .or_insert_with(|| value.clone());
            }
        }

        let mut vol = self.volume_handle(vol_type, content_type, storage_name, config);
        self.driver.fill_volume_config(&mut vol)?;
        self.driver.validate_volume(&vol).await?;
        Ok(vol)
    }

    /// Create record rows for a volume and its snapshots, pushing a delete
    /// for every row created.
    pub(crate) async fn stage_volume_records(
        &self,
        rollback: &mut Rollback,
        parent: Option<VolumeRecord>,
        snapshots: Vec<VolumeRecord>,
    ) -> Result<()> {
        if let Some(parent) = parent {
            let undo = UndoAction::DeleteVolumeRecord {
                project: parent.project.clone(),
                vol_type: parent.vol_type,
                name: parent.name.clone(),
            };
            self.state.store.create_volume(parent).await?;
            rollback.push(undo);
        }

        for snap in snapshots {
            let undo = UndoAction::DeleteVolumeRecord {
                project: snap.project.clone(),
                vol_type: snap.vol_type,
                name: snap.name.clone(),
            };
            self.state.store.create_volume(snap).await?;
            rollback.push(undo);
        }
        Ok(())
    }

    /// Build the target record rows for a copy or migration receive.
    ///
    /// Snapshot rows keep their source creation times so refresh
    /// reconciliation can identify them later. `strip_foreign` drops config
    /// keys the receiving driver does not recognize.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn adapt_records(
        &self,
        project: &str,
        name: &str,
        vol_type: VolumeType,
        content_type: crate::types::ContentType,
        parent_config: HashMap<String, String>,
        src_snapshots: &[VolumeRecord],
        strip_foreign: bool,
    ) -> (VolumeRecord, Vec<VolumeRecord>) {
        let driver_keys = self.driver.config_keys();
        let adapt = |cfg: &HashMap<String, String>| {
            if strip_foreign {
                config::strip_unknown_volume_config(vol_type, content_type, cfg, &driver_keys)
            } else {
                cfg.clone()
            }
        };

        let parent = VolumeRecord::new(
            project,
            &self.name,
            name,
            vol_type,
            content_type,
            adapt(&parent_config),
        );

        let snapshots = src_snapshots
            .iter()
            .filter_map(|src| {
                let (_, leaf) = crate::types::parent_and_snapshot(&src.name);
                leaf.map(|leaf| VolumeRecord {
                    project: project.to_string(),
                    pool: self.name.clone(),
                    name: format!("{name}/{leaf}"),
                    vol_type,
                    content_type,
                    description: src.description.clone(),
                    config: adapt(&src.config),
                    created_at: src.created_at,
                    expires_at: src.expires_at,
                })
            })
            .collect();

        (parent, snapshots)
    }

    /// Stream a volume from another pool into this one through in-memory
    /// connections, one per protocol channel: the index header exchange and
    /// the volume data.
    ///
    /// Both sides run as tasks so data flows while the sender is still
    /// producing it; the first failure tears the peer down.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn transfer_volume(
        &self,
        src_pool: &Backend,
        src_vol: Volume,
        tgt_vol: Volume,
        source_config: crate::backup::BackupConfig,
        snapshots: Vec<String>,
        refresh: bool,
        volume_only: bool,
        allow_inconsistent: bool,
        volume_size: Option<u64>,
    ) -> Result<()> {
        let content_type = tgt_vol.content_type();
        let offers = src_pool
            .driver
            .migration_types(content_type, refresh, !snapshots.is_empty(), false);
        let accepted =
            self.driver
                .migration_types(content_type, refresh, !snapshots.is_empty(), false);
        let chosen = migration::match_types(
            &offers,
            migration::fallback_migration_type(content_type).protocol,
            &accepted,
        )?;
        debug!(
            source_pool = %src_pool.name,
            target_pool = %self.name,
            protocol = %chosen.protocol,
            refresh,
            "Negotiated volume transfer"
        );

        let (mut header_src, mut header_tgt) = migration::pipe_pair(migration::DEFAULT_PIPE_CAPACITY);
        let (mut data_src, mut data_tgt) = migration::pipe_pair(migration::DEFAULT_PIPE_CAPACITY);

        let source_args = migration::VolumeSourceArgs {
            index_header_version: migration::INDEX_HEADER_VERSION,
            name: src_vol.name().to_string(),
            snapshots: snapshots.clone(),
            migration_type: chosen.clone(),
            volume_only,
            refresh,
            allow_inconsistent,
            cluster_move: false,
        };
        let target_args = migration::VolumeTargetArgs {
            index_header_version: migration::INDEX_HEADER_VERSION,
            name: tgt_vol.name().to_string(),
            description: String::new(),
            config: tgt_vol.config().clone(),
            snapshots,
            migration_type: chosen,
            refresh,
            volume_size,
            volume_only,
            cluster_move: false,
        };

        let src_driver = Arc::clone(&src_pool.driver);
        let source_task = async move {
            let info = migration::MigrationInfo {
                config: source_config,
            };
            let mut args = source_args;
            let response = migration::send_index_header(
                &mut header_src,
                migration::INDEX_HEADER_VERSION,
                &info,
            )
            .await?;
            if let Some(refresh) = response.refresh {
                args.refresh = refresh;
            }
            src_driver
                .migrate_volume(&src_vol, &mut data_src, &args)
                .await
        };

        let tgt_driver = Arc::clone(&self.driver);
        let target_task = async move {
            migration::receive_index_header(&mut header_tgt, migration::INDEX_HEADER_VERSION)
                .await?;
            migration::respond_index_header(&mut header_tgt, &migration::InfoResponse::ok(None))
                .await?;
            tgt_driver
                .create_volume_from_migration(&tgt_vol, &mut data_tgt, &target_args)
                .await
        };

        migration::run_paired(source_task, target_task).await
    }

    /// Freeze a running source instance when the driver cannot copy it
    /// consistently. Returns true when this call froze it.
    pub(crate) async fn freeze_for_transfer(
        &self,
        inst: &dyn Instance,
        allow_inconsistent: bool,
    ) -> Result<bool> {
        if allow_inconsistent || !self.driver.info().running_copy_freeze {
            return Ok(false);
        }
        if inst.is_snapshot() || !inst.is_running().await || inst.is_frozen().await {
            return Ok(false);
        }

        inst.freeze().await?;
        if let Err(e) = inst.sync_filesystem().await {
            warn!(instance = %inst.name(), error = %e, "Filesystem sync before copy failed");
        }
        debug!(instance = %inst.name(), "Instance frozen for consistent copy");
        Ok(true)
    }

    pub(crate) async fn thaw_after(&self, inst: &dyn Instance, frozen: bool) {
        if !frozen {
            return;
        }
        if let Err(e) = inst.unfreeze().await {
            warn!(instance = %inst.name(), error = %e, "Failed unfreezing instance");
        }
    }

    pub(crate) async fn emit(&self, kind: EventKind, project: &str, name: &str) {
        self.state
            .events
            .record(kind, project, &self.name, name, HashMap::new())
            .await;
    }

    pub(crate) async fn emit_with(
        &self,
        kind: EventKind,
        project: &str,
        name: &str,
        details: HashMap<String, String>,
    ) {
        self.state
            .events
            .record(kind, project, &self.name, name, details)
            .await;
    }

    pub(crate) async fn authorize_volume_added(
        &self,
        project: &str,
        vol_type: VolumeType,
        name: &str,
    ) {
        if let Err(e) = self
            .state
            .authorizer
            .add_volume(project, &self.name, vol_type, name)
            .await
        {
            warn!(project = %project, volume = %name, error = %e, "Authorizer add failed");
        }
    }

    pub(crate) async fn authorize_volume_renamed(
        &self,
        project: &str,
        vol_type: VolumeType,
        old_name: &str,
        new_name: &str,
    ) {
        if let Err(e) = self
            .state
            .authorizer
            .rename_volume(project, &self.name, vol_type, old_name, new_name)
            .await
        {
            warn!(project = %project, volume = %old_name, error = %e, "Authorizer rename failed");
        }
    }

    pub(crate) async fn authorize_volume_deleted(
        &self,
        project: &str,
        vol_type: VolumeType,
        name: &str,
    ) {
        if let Err(e) = self
            .state
            .authorizer
            .delete_volume(project, &self.name, vol_type, name)
            .await
        {
            warn!(project = %project, volume = %name, error = %e, "Authorizer delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use crate::types::ContentType;

    async fn harness() -> (Arc<EngineState>, MockDriver, PoolRecord) {
        let state = EngineState::builder()
            .server_name("test-member")
            .var_dir(std::env::temp_dir().join(format!("volantix-{}", uuid::Uuid::new_v4())))
            .build();
        let driver = MockDriver::new();
        let pool = PoolRecord {
            name: "p1".to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: HashMap::new(),
            status: PoolStatus::Pending,
        };
        (state, driver, pool)
    }

    #[tokio::test]
    async fn test_pool_create_promotes_status() {
        let (state, driver, pool) = harness().await;
        let backend = Backend::new(pool, driver, state.clone());

        backend.create().await.unwrap();

        let stored = state.store.get_pool("p1").await.unwrap();
        assert_eq!(stored.status, PoolStatus::Created);
        assert!(backend.is_status_ready().await.is_ok());

        let events = state.events.recent(8).await;
        assert!(events.iter().any(|e| e.kind == EventKind::PoolCreated));
    }

    #[tokio::test]
    async fn test_pool_create_failure_leaves_no_record() {
        let (state, driver, pool) = harness().await;
        driver.fail_once("create_pool").await;
        let backend = Backend::new(pool, driver, state.clone());

        let err = backend.create().await.unwrap_err();
        assert!(matches!(err, StorageError::Driver(_)));
        assert!(state.store.get_pool("p1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_pool_delete_refuses_with_volumes() {
        let (state, driver, pool) = harness().await;
        let backend = Backend::new(pool, driver, state.clone());
        backend.create().await.unwrap();

        state
            .store
            .create_volume(VolumeRecord::new(
                "default",
                "p1",
                "vol1",
                VolumeType::Custom,
                ContentType::Filesystem,
                HashMap::new(),
            ))
            .await
            .unwrap();

        let err = backend.delete().await.unwrap_err();
        assert!(err.is_conflict());
        assert!(state.store.get_pool("p1").await.is_ok());
    }

    #[tokio::test]
    async fn test_mount_failure_marks_pool_unavailable() {
        let (state, driver, pool) = harness().await;
        let backend = Backend::new(pool, driver.clone(), state.clone());
        backend.create().await.unwrap();

        driver.fail_once("mount_pool").await;
        assert!(backend.mount().await.is_err());
        assert!(state.availability.is_unavailable("p1").await);
        assert!(backend.is_status_ready().await.is_err());

        backend.mount().await.unwrap();
        assert!(!state.availability.is_unavailable("p1").await);
        assert!(backend.is_status_ready().await.is_ok());
    }

    #[tokio::test]
    async fn test_update_rejects_source_change_after_creation() {
        let (state, driver, mut pool) = harness().await;
        pool.config
            .insert("source".to_string(), "/srv/pool".to_string());
        let backend = Backend::new(pool, driver, state);
        backend.create().await.unwrap();

        let mut new_config = HashMap::new();
        new_config.insert("source".to_string(), "/srv/other".to_string());
        let err = backend.update("", new_config).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_pool_shrink() {
        let (state, driver, mut pool) = harness().await;
        pool.config.insert("size".to_string(), "10GiB".to_string());
        let backend = Backend::new(pool, driver, state);
        backend.create().await.unwrap();

        let mut new_config = HashMap::new();
        new_config.insert("size".to_string(), "5GiB".to_string());
        let err = backend.update("", new_config).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }
}
