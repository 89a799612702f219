//! In-memory test doubles for the engine's external seams.
//!
//! [`MockDriver`] keeps volumes in a map instead of on disk, records every
//! driver call, and supports fault injection per operation name. It is used
//! throughout the engine's own tests and is exported for downstream test
//! suites that need a pool without real storage.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::backend::BucketGateway;
use crate::backup::{BackupInfo, InstanceSnapshotInfo};
use crate::drivers::{clones::CloneTracker, Driver, Volume, VolumeFiller};
use crate::error::{Result, StorageError};
use crate::instance::{Instance, InstanceInfo, InstanceKind};
use crate::migration::{
    MigrationConn, MigrationType, TransferProtocol, VolumeSourceArgs, VolumeTargetArgs,
};
use crate::records::PoolRecord;
use crate::types::{
    ContentType, DriverInfo, MountInfo, PoolUsage, VolumeType, VolumeUsage,
};

const DEFAULT_VOLUME_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockVolume {
    content_type: ContentType,
    config: HashMap<String, String>,
    /// Snapshot leaves, in creation order.
    snapshots: Vec<String>,
    size: u64,
}

#[derive(Default)]
struct MockDriverState {
    volumes: BTreeMap<String, MockVolume>,
    /// Deleted volumes whose data is still referenced by clones.
    deferred: BTreeMap<String, MockVolume>,
    clones: CloneTracker,
    pool_created: bool,
    pool_mounted: bool,
    calls: Vec<String>,
    fail_once: HashSet<String>,
    fail_always: HashSet<String>,
    restore_blockers: Vec<String>,
    backup_post_hook: bool,
    hold_transfers: bool,
    op_delay: Option<Duration>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Driver double backed by an in-memory volume map.
#[derive(Clone)]
pub struct MockDriver {
    var_dir: PathBuf,
    state: Arc<RwLock<MockDriverState>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            var_dir: std::env::temp_dir().join("volantix-mock"),
            state: Arc::new(RwLock::new(MockDriverState::default())),
        }
    }

    fn key(vol: &Volume) -> String {
        format!("{}/{}", vol.volume_type().directory(), vol.parent_name())
    }

    /// Fail the next call of the named operation.
    pub async fn fail_once(&self, op: &str) {
        self.state.write().await.fail_once.insert(op.to_string());
    }

    /// Fail every call of the named operation.
    pub async fn fail_always(&self, op: &str) {
        self.state.write().await.fail_always.insert(op.to_string());
    }

    /// Make the next restore report these snapshots as blockers.
    pub async fn set_restore_blockers(&self, names: &[&str]) {
        self.state.write().await.restore_blockers =
            names.iter().map(|s| s.to_string()).collect();
    }

    /// Make backup imports report that post-import processing is needed.
    pub async fn set_backup_post_hook(&self, enabled: bool) {
        self.state.write().await.backup_post_hook = enabled;
    }

    /// Make transfers write one chunk and then park forever.
    pub async fn hold_transfers(&self) {
        self.state.write().await.hold_transfers = true;
    }

    /// Sleep this long inside guarded operations.
    pub async fn set_op_delay(&self, delay: Duration) {
        self.state.write().await.op_delay = Some(delay);
    }

    /// All driver calls made so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    pub async fn call_count(&self, op: &str) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| *c == op)
            .count()
    }

    /// Highest number of guarded operations ever running at once.
    pub async fn max_in_flight(&self) -> usize {
        self.state.read().await.max_in_flight
    }

    /// Storage names of all non-snapshot volumes.
    pub async fn volume_names(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .volumes
            .keys()
            .filter_map(|k| k.split_once('/').map(|(_, name)| name.to_string()))
            .collect()
    }

    /// Storage names of deleted volumes whose data is held for clones.
    pub async fn deferred_names(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .deferred
            .keys()
            .filter_map(|k| k.split_once('/').map(|(_, name)| name.to_string()))
            .collect()
    }

    /// Snapshot leaves of a volume, in creation order.
    pub async fn snapshot_leaves(&self, vol_type: VolumeType, storage_name: &str) -> Vec<String> {
        let key = format!("{}/{storage_name}", vol_type.directory());
        self.state
            .read()
            .await
            .volumes
            .get(&key)
            .map(|v| v.snapshots.clone())
            .unwrap_or_default()
    }

    /// Place a volume directly into the map, bypassing the driver API.
    pub async fn seed_volume(
        &self,
        vol_type: VolumeType,
        content_type: ContentType,
        storage_name: &str,
        snapshots: &[&str],
    ) {
        let key = format!("{}/{storage_name}", vol_type.directory());
        self.state.write().await.volumes.insert(
            key,
            MockVolume {
                content_type,
                config: HashMap::new(),
                snapshots: snapshots.iter().map(|s| s.to_string()).collect(),
                size: DEFAULT_VOLUME_SIZE,
            },
        );
    }

    /// Record the call and apply fault injection.
    async fn check(&self, op: &str) -> Result<()> {
        let mut st = self.state.write().await;
        st.calls.push(op.to_string());
        if st.fail_once.remove(op) || st.fail_always.contains(op) {
            return Err(StorageError::Driver(format!("{op} failed (injected)")));
        }
        Ok(())
    }

    /// Like [`check`], also tracking concurrent entry and the optional
    /// per-op delay. Every `enter` must be paired with an `exit`.
    async fn enter(&self, op: &str) -> Result<()> {
        let delay = {
            let mut st = self.state.write().await;
            st.calls.push(op.to_string());
            if st.fail_once.remove(op) || st.fail_always.contains(op) {
                return Err(StorageError::Driver(format!("{op} failed (injected)")));
            }
            st.in_flight += 1;
            st.max_in_flight = st.max_in_flight.max(st.in_flight);
            st.op_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn exit(&self) {
        self.state.write().await.in_flight -= 1;
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: "mock".to_string(),
            version: "1".to_string(),
            remote: false,
            buckets: true,
            optimized_images: true,
            running_copy_freeze: true,
            mounted_root: true,
            block_backing: false,
            volume_types: VolumeType::ALL.to_vec(),
        }
    }

    async fn validate_pool(&self, _config: &HashMap<String, String>) -> Result<()> {
        self.check("validate_pool").await
    }

    async fn create_pool(&self, _pool: &PoolRecord) -> Result<()> {
        self.check("create_pool").await?;
        self.state.write().await.pool_created = true;
        Ok(())
    }

    async fn delete_pool(&self, _pool: &PoolRecord) -> Result<()> {
        self.check("delete_pool").await?;
        let mut st = self.state.write().await;
        st.pool_created = false;
        st.pool_mounted = false;
        Ok(())
    }

    async fn mount_pool(&self, _pool: &PoolRecord) -> Result<bool> {
        self.check("mount_pool").await?;
        let mut st = self.state.write().await;
        let newly = !st.pool_mounted;
        st.pool_mounted = true;
        Ok(newly)
    }

    async fn unmount_pool(&self, _pool: &PoolRecord) -> Result<bool> {
        self.check("unmount_pool").await?;
        let mut st = self.state.write().await;
        let was = st.pool_mounted;
        st.pool_mounted = false;
        Ok(was)
    }

    async fn pool_usage(&self, _pool: &PoolRecord) -> Result<PoolUsage> {
        self.check("pool_usage").await?;
        Ok(PoolUsage {
            total_bytes: 100 << 30,
            used_bytes: 10 << 30,
            available_bytes: 90 << 30,
        })
    }

    async fn validate_volume(&self, _vol: &Volume) -> Result<()> {
        self.check("validate_volume").await
    }

    fn fill_volume_config(&self, vol: &mut Volume) -> Result<()> {
        if vol.content_type() == ContentType::Block && vol.config_get("size").is_none() {
            vol.config_mut()
                .insert("size".to_string(), "1GiB".to_string());
        }
        Ok(())
    }

    async fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&dyn VolumeFiller>,
    ) -> Result<()> {
        self.enter("create_volume").await?;
        let result: Result<()> = async {
            let mut st = self.state.write().await;
            st.volumes.insert(
                Self::key(vol),
                MockVolume {
                    content_type: vol.content_type(),
                    config: vol.config().clone(),
                    snapshots: Vec::new(),
                    size: vol.size()?.unwrap_or(DEFAULT_VOLUME_SIZE),
                },
            );
            Ok(())
        }
        .await;
        let _ = filler;
        self.exit().await;
        result
    }

    async fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src: &Volume,
        snapshots: &[String],
    ) -> Result<()> {
        self.enter("create_volume_from_copy").await?;
        let result = {
            let mut st = self.state.write().await;
            match st.volumes.get(&Self::key(src)).cloned() {
                Some(source) => {
                    st.volumes.insert(
                        Self::key(vol),
                        MockVolume {
                            content_type: source.content_type,
                            config: vol.config().clone(),
                            snapshots: snapshots.to_vec(),
                            size: source.size,
                        },
                    );
                    // Copies are lightweight clones; the source's data must
                    // outlive every volume cloned from it.
                    st.clones.record_clone(&Self::key(src), &Self::key(vol));
                    Ok(())
                }
                None => Err(StorageError::not_found(format!(
                    "Source volume {:?} not found",
                    src.name()
                ))),
            }
        };
        self.exit().await;
        result
    }

    async fn refresh_volume(
        &self,
        vol: &Volume,
        src: &Volume,
        snapshots: &[String],
    ) -> Result<()> {
        self.enter("refresh_volume").await?;
        let result = {
            let mut st = self.state.write().await;
            match st.volumes.get(&Self::key(src)).cloned() {
                Some(source) => {
                    let entry = st.volumes.entry(Self::key(vol)).or_insert(MockVolume {
                        content_type: source.content_type,
                        config: vol.config().clone(),
                        snapshots: Vec::new(),
                        size: source.size,
                    });
                    entry.size = source.size;
                    for leaf in snapshots {
                        if !entry.snapshots.contains(leaf) {
                            entry.snapshots.push(leaf.clone());
                        }
                    }
                    Ok(())
                }
                None => Err(StorageError::not_found(format!(
                    "Source volume {:?} not found",
                    src.name()
                ))),
            }
        };
        self.exit().await;
        result
    }

    async fn delete_volume(&self, vol: &Volume) -> Result<()> {
        self.check("delete_volume").await?;
        let mut st = self.state.write().await;
        match vol.snapshot_leaf() {
            Some(leaf) => {
                if let Some(entry) = st.volumes.get_mut(&Self::key(vol)) {
                    entry.snapshots.retain(|s| s != leaf);
                }
            }
            None => {
                let key = Self::key(vol);
                let reclaimed = st.clones.release(&key);
                if reclaimed.is_empty() {
                    // Clones still reference the data; hold the entry
                    // aside until the last one goes.
                    if let Some(entry) = st.volumes.remove(&key) {
                        st.deferred.insert(key, entry);
                    }
                } else {
                    st.volumes.remove(&key);
                    for name in reclaimed {
                        st.deferred.remove(&name);
                    }
                }
            }
        }
        Ok(())
    }

    async fn has_volume(&self, vol: &Volume) -> Result<bool> {
        Ok(self
            .state
            .read()
            .await
            .volumes
            .contains_key(&Self::key(vol)))
    }

    async fn rename_volume(&self, vol: &Volume, new_name: &str) -> Result<()> {
        self.check("rename_volume").await?;
        let mut st = self.state.write().await;
        if let Some(leaf) = vol.snapshot_leaf() {
            let (_, new_leaf) = crate::types::parent_and_snapshot(new_name);
            let new_leaf = new_leaf.unwrap_or(new_name);
            match st.volumes.get_mut(&Self::key(vol)) {
                Some(entry) => {
                    for existing in entry.snapshots.iter_mut() {
                        if existing == leaf {
                            *existing = new_leaf.to_string();
                        }
                    }
                    Ok(())
                }
                None => Err(StorageError::not_found(format!(
                    "Volume {:?} not found",
                    vol.parent_name()
                ))),
            }
        } else {
            let new_key = format!("{}/{new_name}", vol.volume_type().directory());
            match st.volumes.remove(&Self::key(vol)) {
                Some(entry) => {
                    st.clones.rename(&Self::key(vol), &new_key);
                    st.volumes.insert(new_key, entry);
                    Ok(())
                }
                None => Err(StorageError::not_found(format!(
                    "Volume {:?} not found",
                    vol.name()
                ))),
            }
        }
    }

    async fn update_volume(
        &self,
        vol: &Volume,
        changed: &HashMap<String, String>,
    ) -> Result<()> {
        self.check("update_volume").await?;
        let mut st = self.state.write().await;
        if let Some(entry) = st.volumes.get_mut(&Self::key(vol)) {
            for (key, value) in changed {
                if value.is_empty() {
                    entry.config.remove(key);
                } else {
                    entry.config.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn set_volume_quota(
        &self,
        vol: &Volume,
        size: u64,
        allow_unsafe_resize: bool,
    ) -> Result<()> {
        self.check("set_volume_quota").await?;
        let mut st = self.state.write().await;
        let entry = st.volumes.get_mut(&Self::key(vol)).ok_or_else(|| {
            StorageError::not_found(format!("Volume {:?} not found", vol.name()))
        })?;
        if size != 0 && size < entry.size && !allow_unsafe_resize {
            return Err(StorageError::CannotBeShrunk(format!(
                "{} below current size {}",
                size, entry.size
            )));
        }
        if size != 0 {
            entry.size = size;
        }
        entry.config.insert("size".to_string(), size.to_string());
        Ok(())
    }

    async fn volume_usage(&self, vol: &Volume) -> Result<VolumeUsage> {
        let st = self.state.read().await;
        let entry = st.volumes.get(&Self::key(vol)).ok_or_else(|| {
            StorageError::not_found(format!("Volume {:?} not found", vol.name()))
        })?;
        Ok(VolumeUsage {
            used: entry.size,
            total: Some(entry.size),
        })
    }

    async fn volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        Ok(PathBuf::from(format!("/dev/mock/{}", vol.parent_name())))
    }

    async fn mount_volume(&self, vol: &Volume) -> Result<MountInfo> {
        self.check("mount_volume").await?;
        let disk_path = if vol.content_type() == ContentType::Filesystem {
            None
        } else {
            Some(self.volume_disk_path(vol).await?)
        };
        Ok(MountInfo { disk_path })
    }

    async fn unmount_volume(&self, vol: &Volume) -> Result<bool> {
        self.check("unmount_volume").await?;
        let _ = vol;
        Ok(true)
    }

    async fn list_volumes(&self, pool: &PoolRecord) -> Result<Vec<Volume>> {
        let st = self.state.read().await;
        let mut out = Vec::new();
        for (key, entry) in &st.volumes {
            let Some((dir, name)) = key.split_once('/') else {
                continue;
            };
            let Some(vol_type) = VolumeType::ALL
                .iter()
                .copied()
                .find(|t| t.directory() == dir)
            else {
                continue;
            };
            out.push(Volume::new(
                &self.var_dir,
                &pool.name,
                vol_type,
                entry.content_type,
                name,
                entry.config.clone(),
            ));
        }
        Ok(out)
    }

    async fn create_volume_snapshot(&self, snap: &Volume) -> Result<()> {
        self.enter("create_volume_snapshot").await?;
        let result = {
            let leaf = snap.snapshot_leaf().unwrap_or_default().to_string();
            let mut st = self.state.write().await;
            match st.volumes.get_mut(&Self::key(snap)) {
                Some(entry) => {
                    entry.snapshots.push(leaf);
                    Ok(())
                }
                None => Err(StorageError::not_found(format!(
                    "Volume {:?} not found",
                    snap.parent_name()
                ))),
            }
        };
        self.exit().await;
        result
    }

    async fn delete_volume_snapshot(&self, snap: &Volume) -> Result<()> {
        self.check("delete_volume_snapshot").await?;
        let leaf = snap.snapshot_leaf().unwrap_or_default();
        let mut st = self.state.write().await;
        if let Some(entry) = st.volumes.get_mut(&Self::key(snap)) {
            entry.snapshots.retain(|s| s != leaf);
        }
        Ok(())
    }

    async fn rename_volume_snapshot(&self, snap: &Volume, new_leaf: &str) -> Result<()> {
        self.check("rename_volume_snapshot").await?;
        let leaf = snap.snapshot_leaf().unwrap_or_default();
        let mut st = self.state.write().await;
        if let Some(entry) = st.volumes.get_mut(&Self::key(snap)) {
            for existing in entry.snapshots.iter_mut() {
                if existing == leaf {
                    *existing = new_leaf.to_string();
                }
            }
        }
        Ok(())
    }

    async fn restore_volume(&self, vol: &Volume, snapshot: &str) -> Result<()> {
        self.enter("restore_volume").await?;
        let result = {
            let mut st = self.state.write().await;
            if !st.restore_blockers.is_empty() {
                let names = std::mem::take(&mut st.restore_blockers);
                Err(StorageError::DeleteSnapshots { names })
            } else {
                match st.volumes.get(&Self::key(vol)) {
                    Some(entry) if entry.snapshots.iter().any(|s| s == snapshot) => Ok(()),
                    Some(_) => Err(StorageError::not_found(format!(
                        "Snapshot {snapshot:?} not found"
                    ))),
                    None => Err(StorageError::not_found(format!(
                        "Volume {:?} not found",
                        vol.name()
                    ))),
                }
            }
        };
        self.exit().await;
        result
    }

    async fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>> {
        let st = self.state.read().await;
        let mut leaves = st
            .volumes
            .get(&Self::key(vol))
            .map(|v| v.snapshots.clone())
            .unwrap_or_default();
        leaves.sort();
        Ok(leaves)
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        _refresh: bool,
        _copy_snapshots: bool,
        _cluster_move: bool,
    ) -> Vec<MigrationType> {
        match content_type {
            ContentType::Filesystem => {
                vec![MigrationType::new(TransferProtocol::Filesync, Vec::new())]
            }
            ContentType::Block | ContentType::Iso => {
                vec![MigrationType::new(TransferProtocol::Blockdiff, Vec::new())]
            }
        }
    }

    async fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut MigrationConn,
        args: &VolumeSourceArgs,
    ) -> Result<()> {
        self.enter("migrate_volume").await?;
        let hold = self.state.read().await.hold_transfers;
        let result: Result<()> = async {
            let payload = serde_json::to_vec(&(vol.name(), &args.snapshots))
                .map_err(|e| StorageError::Migration(e.to_string()))?;
            conn.write_all(&payload)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
            if hold {
                std::future::pending::<()>().await;
            }
            conn.shutdown()
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
            Ok(())
        }
        .await;
        self.exit().await;
        result
    }

    async fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut MigrationConn,
        args: &VolumeTargetArgs,
    ) -> Result<()> {
        self.enter("create_volume_from_migration").await?;
        let hold = self.state.read().await.hold_transfers;
        let result: Result<()> = async {
            if hold {
                let mut chunk = [0u8; 16];
                let _ = conn
                    .read(&mut chunk)
                    .await
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                std::future::pending::<()>().await;
            }
            let mut raw = Vec::new();
            conn.read_to_end(&mut raw)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;

            let mut st = self.state.write().await;
            let entry = st.volumes.entry(Self::key(vol)).or_insert(MockVolume {
                content_type: vol.content_type(),
                config: vol.config().clone(),
                snapshots: Vec::new(),
                size: vol.size()?.unwrap_or(DEFAULT_VOLUME_SIZE),
            });
            for leaf in &args.snapshots {
                if !entry.snapshots.contains(leaf) {
                    entry.snapshots.push(leaf.clone());
                }
            }
            Ok(())
        }
        .await;
        self.exit().await;
        result
    }

    async fn backup_volume(
        &self,
        vol: &Volume,
        target: &mut (dyn AsyncWrite + Send + Unpin),
        snapshots: &[String],
    ) -> Result<()> {
        self.enter("backup_volume").await?;
        let result: Result<()> = async {
            let entry = self
                .state
                .read()
                .await
                .volumes
                .get(&Self::key(vol))
                .cloned()
                .ok_or_else(|| {
                    StorageError::not_found(format!("Volume {:?} not found", vol.name()))
                })?;
            let payload = serde_json::to_vec(&(vol.name(), snapshots, &entry))
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            target
                .write_all(&payload)
                .await
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            Ok(())
        }
        .await;
        self.exit().await;
        result
    }

    async fn create_volume_from_backup(
        &self,
        vol: &Volume,
        source: &mut (dyn AsyncRead + Send + Unpin),
        info: &BackupInfo,
    ) -> Result<bool> {
        self.enter("create_volume_from_backup").await?;
        let result: Result<bool> = async {
            let mut raw = Vec::new();
            source
                .read_to_end(&mut raw)
                .await
                .map_err(|e| StorageError::Internal(e.to_string()))?;

            let mut st = self.state.write().await;
            st.volumes.insert(
                Self::key(vol),
                MockVolume {
                    content_type: vol.content_type(),
                    config: vol.config().clone(),
                    snapshots: info.snapshots.clone(),
                    size: vol.size()?.unwrap_or(DEFAULT_VOLUME_SIZE),
                },
            );
            Ok(st.backup_post_hook)
        }
        .await;
        self.exit().await;
        result
    }
}

/// Instance double with atomically tracked runtime state.
pub struct MockInstance {
    name: String,
    project: String,
    kind: InstanceKind,
    snapshot: bool,
    running: AtomicBool,
    frozen: AtomicBool,
    freeze_count: AtomicUsize,
    unfreeze_count: AtomicUsize,
    config: HashMap<String, String>,
    root_disk: HashMap<String, String>,
    snapshots: Vec<InstanceSnapshotInfo>,
    created_at: DateTime<Utc>,
}

impl MockInstance {
    pub fn new(project: &str, name: &str, kind: InstanceKind) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            kind,
            snapshot: false,
            running: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            freeze_count: AtomicUsize::new(0),
            unfreeze_count: AtomicUsize::new(0),
            config: HashMap::new(),
            root_disk: HashMap::new(),
            snapshots: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn running(self, running: bool) -> Self {
        self.running.store(running, Ordering::SeqCst);
        self
    }

    pub fn snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_root_disk(mut self, key: &str, value: &str) -> Self {
        self.root_disk.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_snapshot(mut self, leaf: &str) -> Self {
        self.snapshots.push(InstanceSnapshotInfo {
            name: leaf.to_string(),
            created_at: Utc::now(),
        });
        self
    }

    pub fn freeze_count(&self) -> usize {
        self.freeze_count.load(Ordering::SeqCst)
    }

    pub fn unfreeze_count(&self) -> usize {
        self.unfreeze_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Instance for MockInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn project(&self) -> &str {
        &self.project
    }

    fn kind(&self) -> InstanceKind {
        self.kind
    }

    fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    async fn freeze(&self) -> Result<()> {
        self.frozen.store(true, Ordering::SeqCst);
        self.freeze_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unfreeze(&self) -> Result<()> {
        self.frozen.store(false, Ordering::SeqCst);
        self.unfreeze_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn render_info(&self) -> InstanceInfo {
        InstanceInfo {
            name: self.name.clone(),
            kind: self.kind,
            created_at: self.created_at,
            config: self.config.clone(),
        }
    }

    fn snapshot_infos(&self) -> Vec<InstanceSnapshotInfo> {
        self.snapshots.clone()
    }

    fn root_disk_config(&self) -> HashMap<String, String> {
        self.root_disk.clone()
    }
}

#[derive(Default)]
struct MockGatewayState {
    running: HashSet<String>,
    buckets: HashSet<String>,
    /// access key -> (bucket storage name, role)
    accounts: HashMap<String, (String, String)>,
    fail_once: HashSet<String>,
    service_url: String,
}

/// Object gateway double.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<RwLock<MockGatewayState>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_once(&self, op: &str) {
        self.state.write().await.fail_once.insert(op.to_string());
    }

    pub async fn has_bucket(&self, storage_name: &str) -> bool {
        self.state.read().await.buckets.contains(storage_name)
    }

    pub async fn has_service_account(&self, access_key: &str) -> bool {
        self.state.read().await.accounts.contains_key(access_key)
    }

    pub async fn set_service_url(&self, url: &str) {
        self.state.write().await.service_url = url.to_string();
    }

    async fn check(&self, op: &str) -> Result<()> {
        if self.state.write().await.fail_once.remove(op) {
            return Err(StorageError::Driver(format!("{op} failed (injected)")));
        }
        Ok(())
    }
}

#[async_trait]
impl BucketGateway for MockGateway {
    async fn ensure_running(&self, storage_name: &str, _path: &std::path::Path) -> Result<()> {
        self.check("ensure_running").await?;
        self.state
            .write()
            .await
            .running
            .insert(storage_name.to_string());
        Ok(())
    }

    async fn stop(&self, storage_name: &str) -> Result<()> {
        self.check("stop").await?;
        self.state.write().await.running.remove(storage_name);
        Ok(())
    }

    async fn make_bucket(&self, storage_name: &str) -> Result<()> {
        self.check("make_bucket").await?;
        self.state
            .write()
            .await
            .buckets
            .insert(storage_name.to_string());
        Ok(())
    }

    async fn remove_bucket(&self, storage_name: &str) -> Result<()> {
        self.check("remove_bucket").await?;
        self.state.write().await.buckets.remove(storage_name);
        Ok(())
    }

    async fn bucket_exists(&self, storage_name: &str) -> Result<bool> {
        Ok(self.state.read().await.buckets.contains(storage_name))
    }

    async fn put_service_account(
        &self,
        storage_name: &str,
        access_key: &str,
        secret_key: &str,
        role: &str,
    ) -> Result<()> {
        self.check("put_service_account").await?;
        let _ = secret_key;
        self.state.write().await.accounts.insert(
            access_key.to_string(),
            (storage_name.to_string(), role.to_string()),
        );
        Ok(())
    }

    async fn delete_service_account(&self, access_key: &str) -> Result<()> {
        self.check("delete_service_account").await?;
        self.state.write().await.accounts.remove(access_key);
        Ok(())
    }

    async fn list_service_accounts(&self, storage_name: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .iter()
            .filter(|(_, (bucket, _))| bucket == storage_name)
            .map(|(access, _)| access.clone())
            .collect())
    }

    fn service_url(&self) -> String {
        self.state
            .try_read()
            .map(|s| s.service_url.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(name: &str) -> Volume {
        Volume::new(
            std::path::Path::new("/tmp/volantix-mock"),
            "p1",
            VolumeType::Custom,
            ContentType::Filesystem,
            name,
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_fault_injection_scopes() {
        let driver = MockDriver::new();
        driver.fail_once("create_volume").await;

        assert!(driver.create_volume(&vol("v1"), None).await.is_err());
        driver.create_volume(&vol("v1"), None).await.unwrap();
        assert!(driver.has_volume(&vol("v1")).await.unwrap());

        driver.fail_always("delete_volume").await;
        assert!(driver.delete_volume(&vol("v1")).await.is_err());
        assert!(driver.delete_volume(&vol("v1")).await.is_err());
        assert_eq!(driver.call_count("delete_volume").await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_bookkeeping() {
        let driver = MockDriver::new();
        let parent = vol("v1");
        driver.create_volume(&parent, None).await.unwrap();

        driver
            .create_volume_snapshot(&parent.new_snapshot("s1"))
            .await
            .unwrap();
        driver
            .create_volume_snapshot(&parent.new_snapshot("s2"))
            .await
            .unwrap();
        assert_eq!(
            driver.volume_snapshots(&parent).await.unwrap(),
            vec!["s1".to_string(), "s2".to_string()]
        );

        driver
            .rename_volume_snapshot(&parent.new_snapshot("s1"), "first")
            .await
            .unwrap();
        driver
            .delete_volume_snapshot(&parent.new_snapshot("s2"))
            .await
            .unwrap();
        assert_eq!(
            driver.volume_snapshots(&parent).await.unwrap(),
            vec!["first".to_string()]
        );
    }

    #[tokio::test]
    async fn test_snapshot_listing_sorted_by_name() {
        let driver = MockDriver::new();
        let parent = vol("v1");
        driver.create_volume(&parent, None).await.unwrap();
        for leaf in ["snap2", "snap10", "snap1"] {
            driver
                .create_volume_snapshot(&parent.new_snapshot(leaf))
                .await
                .unwrap();
        }

        assert_eq!(
            driver.volume_snapshots(&parent).await.unwrap(),
            vec![
                "snap1".to_string(),
                "snap10".to_string(),
                "snap2".to_string()
            ]
        );
        // The raw helper keeps creation order.
        assert_eq!(
            driver.snapshot_leaves(VolumeType::Custom, "v1").await,
            vec![
                "snap2".to_string(),
                "snap10".to_string(),
                "snap1".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_blockers_reported_once() {
        let driver = MockDriver::new();
        let parent = vol("v1");
        driver.create_volume(&parent, None).await.unwrap();
        driver
            .create_volume_snapshot(&parent.new_snapshot("s1"))
            .await
            .unwrap();

        driver.set_restore_blockers(&["s2", "s3"]).await;
        let err = driver.restore_volume(&parent, "s1").await.unwrap_err();
        assert!(matches!(err, StorageError::DeleteSnapshots { ref names } if names.len() == 2));

        driver.restore_volume(&parent, "s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_instance_freeze_tracking() {
        let inst = MockInstance::new("default", "c1", InstanceKind::Container).running(true);
        assert!(inst.is_running().await);
        assert!(!inst.is_frozen().await);

        inst.freeze().await.unwrap();
        assert!(inst.is_frozen().await);
        inst.unfreeze().await.unwrap();
        assert_eq!(inst.freeze_count(), 1);
        assert_eq!(inst.unfreeze_count(), 1);
    }
}
