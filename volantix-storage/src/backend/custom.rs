//! Custom volume operations.
//!
//! Custom volumes are user-managed data volumes attached to instances or
//! exported over shares. Unlike instance volumes they are addressed by
//! project and name rather than an instance handle, and their storage names
//! always carry the project prefix. Deleting one cascades over its
//! snapshots. The engine has no view of the instances a volume is attached
//! to; operations that depend on attachment state take the answer as an
//! argument.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, warn};

use crate::backup::{BackupConfig, BackupInfo};
use crate::config;
use crate::drivers::{Volume, VolumeFiller};
use crate::error::{Result, StorageError};
use crate::events::EventKind;
use crate::locking::snapshot_lock_name;
use crate::migration::{
    self, ComparableSnapshot, InfoResponse, MigrationConn, MigrationInfo, VolumeSourceArgs,
    VolumeTargetArgs,
};
use crate::paths;
use crate::records::VolumeRecord;
use crate::rollback::{Rollback, UndoAction};
use crate::types::{parent_and_snapshot, ContentType, MountInfo, VolumeType, VolumeUsage};

use super::Backend;

fn validate_custom_volume_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(StorageError::Validation(format!(
            "Invalid volume name {name:?}"
        )));
    }
    Ok(())
}

impl Backend {
    async fn custom_record(&self, project: &str, name: &str) -> Result<VolumeRecord> {
        self.state
            .store
            .get_volume(project, &self.name, VolumeType::Custom, name)
            .await
    }

    async fn custom_volume(&self, project: &str, name: &str) -> Result<(VolumeRecord, Volume)> {
        let record = self.custom_record(project, name).await?;
        let vol = self.volume_for_record(&record);
        Ok((record, vol))
    }

    async fn custom_snapshot_records(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Vec<VolumeRecord>> {
        self.state
            .store
            .list_snapshots(project, &self.name, VolumeType::Custom, name)
            .await
    }

    /// Create an empty custom volume.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name))]
    pub async fn create_custom_volume(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: HashMap<String, String>,
        content_type: ContentType,
    ) -> Result<()> {
        self.is_status_ready().await?;
        validate_custom_volume_name(name)?;
        if content_type == ContentType::Iso {
            return Err(StorageError::Validation(
                "ISO volumes are populated from an image".to_string(),
            ));
        }
        if self
            .state
            .store
            .volume_exists(project, &self.name, VolumeType::Custom, name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume {name:?} already exists"
            )));
        }

        let storage = paths::storage_name(VolumeType::Custom, project, name);
        let vol = self
            .prepare_volume(VolumeType::Custom, content_type, &storage, config)
            .await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let mut record = VolumeRecord::new(
                project,
                &self.name,
                name,
                VolumeType::Custom,
                content_type,
                vol.config().clone(),
            );
            record.description = description.to_string();
            self.stage_volume_records(&mut rollback, Some(record), Vec::new())
                .await?;

            self.driver.create_volume(&vol, None).await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type: VolumeType::Custom,
                content_type,
                storage_name: vol.name().to_string(),
                config: vol.config().clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_added(project, VolumeType::Custom, name)
            .await;
        self.emit(EventKind::VolumeCreated, project, name).await;
        Ok(())
    }

    /// Copy a custom volume, optionally with its snapshots.
    ///
    /// When no config is given the source volume's config is carried over,
    /// stripped of keys this pool's driver does not recognize on cross-pool
    /// copies.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name, source = %src_name))]
    pub async fn create_custom_volume_from_copy(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: HashMap<String, String>,
        src_project: &str,
        src_name: &str,
        src_pool: &Arc<Backend>,
        with_snapshots: bool,
    ) -> Result<()> {
        self.is_status_ready().await?;
        src_pool.is_status_ready().await?;
        validate_custom_volume_name(name)?;
        if self
            .state
            .store
            .volume_exists(project, &self.name, VolumeType::Custom, name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume {name:?} already exists"
            )));
        }

        let (src_record, src_vol) = src_pool.custom_volume(src_project, src_name).await?;
        let src_snapshots = if with_snapshots {
            src_pool
                .custom_snapshot_records(src_project, src_name)
                .await?
        } else {
            Vec::new()
        };
        let leaves: Vec<String> = src_snapshots
            .iter()
            .filter_map(|s| parent_and_snapshot(&s.name).1.map(str::to_string))
            .collect();

        let same_pool = self.is_same_pool(src_pool);
        let base_config = if config.is_empty() {
            src_record.config.clone()
        } else {
            config
        };
        let (mut parent, snap_records) = self.adapt_records(
            project,
            name,
            VolumeType::Custom,
            src_record.content_type,
            base_config,
            &src_snapshots,
            !same_pool,
        );
        parent.description = description.to_string();

        let storage = paths::storage_name(VolumeType::Custom, project, name);
        let vol = self
            .prepare_volume(
                VolumeType::Custom,
                src_record.content_type,
                &storage,
                parent.config.clone(),
            )
            .await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.stage_volume_records(&mut rollback, Some(parent), snap_records)
                .await?;

            if same_pool {
                self.driver
                    .create_volume_from_copy(&vol, &src_vol, &leaves)
                    .await?;
            } else {
                let source_config = src_pool
                    .generate_custom_volume_backup_config(src_project, src_name)
                    .await?;
                self.transfer_volume(
                    src_pool,
                    src_vol.clone(),
                    vol.clone(),
                    source_config,
                    leaves.clone(),
                    false,
                    !with_snapshots,
                    false,
                    None,
                )
                .await?;
            }
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type: VolumeType::Custom,
                content_type: vol.content_type(),
                storage_name: vol.name().to_string(),
                config: vol.config().clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_added(project, VolumeType::Custom, name)
            .await;
        let mut details = HashMap::new();
        details.insert("source".to_string(), src_name.to_string());
        self.emit_with(EventKind::VolumeCreated, project, name, details)
            .await;
        Ok(())
    }

    /// Bring an existing custom volume up to date with a source volume.
    ///
    /// Snapshots present only on the target are deleted first. With
    /// `exclude_older` source snapshots older than the newest one the two
    /// sides share are not transferred.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name, source = %src_name))]
    pub async fn refresh_custom_volume(
        &self,
        project: &str,
        name: &str,
        src_project: &str,
        src_name: &str,
        src_pool: &Arc<Backend>,
        with_snapshots: bool,
        exclude_older: bool,
    ) -> Result<()> {
        self.is_status_ready().await?;
        src_pool.is_status_ready().await?;

        let (_, vol) = self.custom_volume(project, name).await?;
        let (src_record, src_vol) = src_pool.custom_volume(src_project, src_name).await?;

        let src_snapshots = if with_snapshots {
            src_pool
                .custom_snapshot_records(src_project, src_name)
                .await?
        } else {
            Vec::new()
        };
        let tgt_snapshots = self.custom_snapshot_records(project, name).await?;

        let to_comparable = |records: &[VolumeRecord]| -> Vec<ComparableSnapshot> {
            records
                .iter()
                .filter_map(|r| {
                    parent_and_snapshot(&r.name).1.map(|leaf| ComparableSnapshot {
                        name: leaf.to_string(),
                        created_at: r.created_at,
                    })
                })
                .collect()
        };
        let src_comp = to_comparable(&src_snapshots);
        let tgt_comp = to_comparable(&tgt_snapshots);
        let (sync_indexes, delete_indexes) =
            migration::compare_snapshots(&src_comp, &tgt_comp, exclude_older);

        for idx in &delete_indexes {
            let record = &tgt_snapshots[*idx];
            let leaf = &tgt_comp[*idx].name;
            debug!(snapshot = %record.name, "Removing target-only snapshot before refresh");
            self.driver
                .delete_volume_snapshot(&vol.new_snapshot(leaf))
                .await?;
            self.state
                .store
                .delete_volume(project, &self.name, VolumeType::Custom, &record.name)
                .await?;
        }

        let sync_records: Vec<VolumeRecord> = sync_indexes
            .iter()
            .map(|i| src_snapshots[*i].clone())
            .collect();
        let leaves: Vec<String> = sync_records
            .iter()
            .filter_map(|s| parent_and_snapshot(&s.name).1.map(str::to_string))
            .collect();

        let same_pool = self.is_same_pool(src_pool);
        let (_, snap_records) = self.adapt_records(
            project,
            name,
            VolumeType::Custom,
            src_record.content_type,
            src_record.config.clone(),
            &sync_records,
            !same_pool,
        );

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.stage_volume_records(&mut rollback, None, snap_records)
                .await?;

            if same_pool {
                self.driver.refresh_volume(&vol, &src_vol, &leaves).await?;
            } else {
                let source_config = src_pool
                    .generate_custom_volume_backup_config(src_project, src_name)
                    .await?;
                self.transfer_volume(
                    src_pool,
                    src_vol.clone(),
                    vol.clone(),
                    source_config,
                    leaves.clone(),
                    true,
                    !with_snapshots,
                    false,
                    None,
                )
                .await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        let mut details = HashMap::new();
        details.insert("source".to_string(), src_name.to_string());
        details.insert("refresh".to_string(), "true".to_string());
        self.emit_with(EventKind::VolumeUpdated, project, name, details)
            .await;
        Ok(())
    }

    /// Send a custom volume to a remote target.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name))]
    pub async fn migrate_custom_volume(
        &self,
        project: &str,
        name: &str,
        header: &mut MigrationConn,
        data: &mut MigrationConn,
        args: &mut VolumeSourceArgs,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (_, vol) = self.custom_volume(project, name).await?;

        let config = self
            .generate_custom_volume_backup_config(project, name)
            .await?;
        let response = migration::send_index_header(
            header,
            args.index_header_version,
            &MigrationInfo { config },
        )
        .await?;
        if let Some(refresh) = response.refresh {
            args.refresh = refresh;
        }
        self.driver.migrate_volume(&vol, data, args).await?;

        self.emit(EventKind::VolumeMigrated, project, name).await;
        Ok(())
    }

    /// Receive a custom volume from a remote source.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %args.name))]
    pub async fn create_custom_volume_from_migration(
        &self,
        project: &str,
        header: &mut MigrationConn,
        data: &mut MigrationConn,
        mut args: VolumeTargetArgs,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let name = args.name.clone();
        validate_custom_volume_name(&name)?;

        let info = migration::receive_index_header(header, args.index_header_version).await?;

        let target_exists = self
            .state
            .store
            .volume_exists(project, &self.name, VolumeType::Custom, &name)
            .await?;
        let mut refresh_override = None;
        if args.refresh && !target_exists {
            debug!("Refresh requested but target volume is missing, forcing full receive");
            args.refresh = false;
            refresh_override = Some(false);
        }
        if !args.refresh && target_exists {
            return Err(StorageError::conflict(format!(
                "Volume {name:?} already exists"
            )));
        }

        let mut content_type = ContentType::Filesystem;
        let mut src_snapshots: Vec<VolumeRecord> = Vec::new();
        if let Some(info) = &info {
            if let Some(volume) = &info.config.volume {
                args.config = volume.config.clone();
                content_type = volume.content_type;
            }
            src_snapshots = info
                .config
                .volume_snapshots
                .iter()
                .map(|s| {
                    let mut adapted = s.clone();
                    adapted.name = format!("{name}/{}", s.name);
                    adapted
                })
                .collect();
        }

        if args.index_header_version > 0 {
            migration::respond_index_header(header, &InfoResponse::ok(refresh_override)).await?;
        }

        let (mut parent, mut snap_records) = self.adapt_records(
            project,
            &name,
            VolumeType::Custom,
            content_type,
            args.config.clone(),
            &src_snapshots,
            true,
        );
        parent.description = args.description.clone();
        if args.volume_only {
            snap_records.clear();
        }
        args.snapshots = snap_records
            .iter()
            .filter_map(|s| parent_and_snapshot(&s.name).1.map(str::to_string))
            .collect();

        if args.refresh {
            let existing: Vec<String> = self
                .custom_snapshot_records(project, &name)
                .await?
                .iter()
                .map(|r| r.name.clone())
                .collect();
            snap_records.retain(|s| !existing.contains(&s.name));
        }

        let storage = paths::storage_name(VolumeType::Custom, project, &name);
        let vol = self
            .prepare_volume(VolumeType::Custom, content_type, &storage, parent.config.clone())
            .await?;

        let refresh = args.refresh;
        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let parent_record = if refresh { None } else { Some(parent) };
            self.stage_volume_records(&mut rollback, parent_record, snap_records)
                .await?;

            self.driver
                .create_volume_from_migration(&vol, data, &args)
                .await?;
            if !refresh {
                rollback.push(UndoAction::DeletePhysicalVolume {
                    vol_type: VolumeType::Custom,
                    content_type,
                    storage_name: vol.name().to_string(),
                    config: vol.config().clone(),
                });
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        if !refresh {
            self.authorize_volume_added(project, VolumeType::Custom, &name)
                .await;
        }
        self.emit(EventKind::VolumeCreated, project, &name).await;
        Ok(())
    }

    /// Rename a custom volume and all of its snapshot records.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name, new_name = %new_name))]
    pub async fn rename_custom_volume(
        &self,
        project: &str,
        name: &str,
        new_name: &str,
    ) -> Result<()> {
        self.is_status_ready().await?;
        validate_custom_volume_name(new_name)?;
        let (_, vol) = self.custom_volume(project, name).await?;
        if self
            .state
            .store
            .volume_exists(project, &self.name, VolumeType::Custom, new_name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume named {new_name:?} already exists"
            )));
        }

        let snapshots = self.custom_snapshot_records(project, name).await?;
        let new_storage = paths::storage_name(VolumeType::Custom, project, new_name);

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            for snap in &snapshots {
                let Some(leaf) = parent_and_snapshot(&snap.name).1 else {
                    continue;
                };
                let new_snap_name = format!("{new_name}/{leaf}");
                self.state
                    .store
                    .rename_volume(
                        project,
                        &self.name,
                        VolumeType::Custom,
                        &snap.name,
                        &new_snap_name,
                    )
                    .await?;
                rollback.push(UndoAction::RenameVolumeRecord {
                    project: project.to_string(),
                    vol_type: VolumeType::Custom,
                    from: new_snap_name,
                    to: snap.name.clone(),
                });
            }

            self.state
                .store
                .rename_volume(project, &self.name, VolumeType::Custom, name, new_name)
                .await?;
            rollback.push(UndoAction::RenameVolumeRecord {
                project: project.to_string(),
                vol_type: VolumeType::Custom,
                from: new_name.to_string(),
                to: name.to_string(),
            });

            self.driver.rename_volume(&vol, &new_storage).await?;
            rollback.push(UndoAction::RenamePhysicalVolume {
                vol_type: VolumeType::Custom,
                content_type: vol.content_type(),
                from: new_storage.clone(),
                to: vol.name().to_string(),
                config: vol.config().clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_renamed(project, VolumeType::Custom, name, new_name)
            .await;
        let mut details = HashMap::new();
        details.insert("old_name".to_string(), name.to_string());
        self.emit_with(EventKind::VolumeRenamed, project, new_name, details)
            .await;
        Ok(())
    }

    /// Apply config changes to a custom volume.
    ///
    /// ISO volumes are read-only. `block.filesystem` is fixed at creation.
    /// Turning `security.shifted` requires every attached instance to be
    /// stopped; whether one is running is the caller's knowledge.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name))]
    pub async fn update_custom_volume(
        &self,
        project: &str,
        name: &str,
        new_description: &str,
        new_config: HashMap<String, String>,
        used_by_running: bool,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (record, vol) = self.custom_volume(project, name).await?;

        let (changed, user_only) = config::detect_changed_config(&record.config, &new_config);
        if changed.is_empty() && record.description == new_description {
            return Ok(());
        }
        if !changed.is_empty() && record.content_type == ContentType::Iso {
            return Err(StorageError::Validation(
                "ISO volumes are read-only".to_string(),
            ));
        }
        if changed.contains_key("block.filesystem") {
            return Err(StorageError::Validation(
                "Volume filesystem cannot be changed after creation".to_string(),
            ));
        }
        if changed.contains_key("security.shifted") && used_by_running {
            return Err(StorageError::conflict(
                "Cannot change ownership shifting while the volume is in use by running instances",
            ));
        }
        config::validate_volume_config(
            VolumeType::Custom,
            record.content_type,
            &new_config,
            &self.driver.config_keys(),
        )?;

        let mut updated = record.clone();
        updated.description = new_description.to_string();
        updated.config = new_config;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.state.store.update_volume(updated.clone()).await?;
            rollback.push(UndoAction::RestoreVolumeRecord {
                record: record.clone(),
            });

            if !user_only {
                if let Some(new_size) = changed.get("size") {
                    let size = if new_size.is_empty() {
                        0
                    } else {
                        config::parse_size(new_size)?
                    };
                    self.driver.set_volume_quota(&vol, size, false).await?;
                }
                let mut rest = changed.clone();
                rest.remove("size");
                if !rest.is_empty() {
                    self.driver.update_volume(&vol, &rest).await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::VolumeUpdated, project, name).await;
        Ok(())
    }

    /// Update description and expiry of a custom volume snapshot. Snapshot
    /// config is frozen at creation time.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, snapshot = %name))]
    pub async fn update_custom_volume_snapshot(
        &self,
        project: &str,
        name: &str,
        new_description: &str,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.is_status_ready().await?;
        if parent_and_snapshot(name).1.is_none() {
            return Err(StorageError::Validation(format!(
                "{name:?} is not a snapshot name"
            )));
        }

        let mut record = self.custom_record(project, name).await?;
        record.description = new_description.to_string();
        record.expires_at = new_expires_at;
        self.state.store.update_volume(record).await?;

        self.emit(EventKind::SnapshotUpdated, project, name).await;
        Ok(())
    }

    /// Delete a custom volume together with its snapshots.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name))]
    pub async fn delete_custom_volume(&self, project: &str, name: &str) -> Result<()> {
        self.is_status_ready().await?;
        let (_, vol) = self.custom_volume(project, name).await?;

        for snap in self.custom_snapshot_records(project, name).await? {
            let Some(leaf) = parent_and_snapshot(&snap.name).1 else {
                continue;
            };
            self.driver
                .delete_volume_snapshot(&vol.new_snapshot(leaf))
                .await?;
            self.state
                .store
                .delete_volume(project, &self.name, VolumeType::Custom, &snap.name)
                .await?;
        }

        if self.driver.has_volume(&vol).await? {
            self.driver.delete_volume(&vol).await?;
        }
        self.state
            .store
            .delete_volume(project, &self.name, VolumeType::Custom, name)
            .await?;

        self.authorize_volume_deleted(project, VolumeType::Custom, name)
            .await;
        self.emit(EventKind::VolumeDeleted, project, name).await;
        Ok(())
    }

    /// Snapshot a custom volume.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %vol_name, snapshot = %leaf))]
    pub async fn create_custom_volume_snapshot(
        &self,
        project: &str,
        vol_name: &str,
        leaf: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.is_status_ready().await?;
        if leaf.is_empty() || leaf.contains('/') {
            return Err(StorageError::Validation(format!(
                "Invalid snapshot name {leaf:?}"
            )));
        }

        let (record, vol) = self.custom_volume(project, vol_name).await?;

        let _guard = self
            .state
            .locks
            .lock(&snapshot_lock_name(
                "CreateCustomVolumeSnapshot",
                &self.name,
                VolumeType::Custom,
                record.content_type,
                vol.name(),
            ))
            .await;

        let full_name = format!("{vol_name}/{leaf}");
        if self
            .state
            .store
            .volume_exists(project, &self.name, VolumeType::Custom, &full_name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Snapshot {full_name:?} already exists"
            )));
        }

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let mut snap_record = VolumeRecord::new(
                project,
                &self.name,
                &full_name,
                VolumeType::Custom,
                record.content_type,
                record.config.clone(),
            );
            snap_record.expires_at = expires_at;
            self.stage_volume_records(&mut rollback, Some(snap_record), Vec::new())
                .await?;

            let snap_handle = vol.new_snapshot(leaf);
            self.driver.create_volume_snapshot(&snap_handle).await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type: VolumeType::Custom,
                content_type: snap_handle.content_type(),
                storage_name: snap_handle.name().to_string(),
                config: snap_handle.config().clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::SnapshotCreated, project, &full_name)
            .await;
        Ok(())
    }

    /// Rename a custom volume snapshot to a new leaf name.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, snapshot = %name))]
    pub async fn rename_custom_volume_snapshot(
        &self,
        project: &str,
        name: &str,
        new_leaf: &str,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (parent, Some(_)) = parent_and_snapshot(name) else {
            return Err(StorageError::Validation(format!(
                "{name:?} is not a snapshot name"
            )));
        };
        if new_leaf.is_empty() || new_leaf.contains('/') {
            return Err(StorageError::Validation(format!(
                "Invalid snapshot name {new_leaf:?}"
            )));
        }

        let (_, snap_vol) = self.custom_volume(project, name).await?;
        let new_name = format!("{parent}/{new_leaf}");
        if self
            .state
            .store
            .volume_exists(project, &self.name, VolumeType::Custom, &new_name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Snapshot {new_name:?} already exists"
            )));
        }

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.state
                .store
                .rename_volume(project, &self.name, VolumeType::Custom, name, &new_name)
                .await?;
            rollback.push(UndoAction::RenameVolumeRecord {
                project: project.to_string(),
                vol_type: VolumeType::Custom,
                from: new_name.clone(),
                to: name.to_string(),
            });

            self.driver
                .rename_volume_snapshot(&snap_vol, new_leaf)
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::SnapshotRenamed, project, &new_name)
            .await;
        Ok(())
    }

    /// Delete one custom volume snapshot.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, snapshot = %name))]
    pub async fn delete_custom_volume_snapshot(&self, project: &str, name: &str) -> Result<()> {
        self.is_status_ready().await?;
        let (_, Some(leaf)) = parent_and_snapshot(name) else {
            return Err(StorageError::Validation(format!(
                "{name:?} is not a snapshot name"
            )));
        };

        let (_, snap_vol) = self.custom_volume(project, name).await?;

        let parent_vol = snap_vol.with_name(snap_vol.parent_name());
        let present = self.driver.volume_snapshots(&parent_vol).await?;
        if present.iter().any(|s| s == leaf) {
            self.driver.delete_volume_snapshot(&snap_vol).await?;
        }

        self.state
            .store
            .delete_volume(project, &self.name, VolumeType::Custom, name)
            .await?;

        self.emit(EventKind::SnapshotDeleted, project, name).await;
        Ok(())
    }

    /// Reset a custom volume to a snapshot.
    ///
    /// Refused while an attached instance is running. Blocking newer
    /// snapshots reported by the driver are deleted and the restore retried
    /// once.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name, snapshot = %leaf))]
    pub async fn restore_custom_volume(
        &self,
        project: &str,
        name: &str,
        leaf: &str,
        used_by_running: bool,
    ) -> Result<()> {
        self.is_status_ready().await?;
        if used_by_running {
            return Err(StorageError::conflict(
                "Cannot restore while the volume is in use by running instances",
            ));
        }

        let (_, vol) = self.custom_volume(project, name).await?;
        let snap_name = format!("{name}/{leaf}");
        self.custom_record(project, &snap_name).await?;

        let mut retried = false;
        loop {
            match self.driver.restore_volume(&vol, leaf).await {
                Ok(()) => break,
                Err(StorageError::DeleteSnapshots { names }) if !retried => {
                    retried = true;
                    warn!(blockers = ?names, "Deleting snapshots blocking the restore");
                    for blocker in names {
                        self.driver
                            .delete_volume_snapshot(&vol.new_snapshot(&blocker))
                            .await?;
                        self.state
                            .store
                            .delete_volume(
                                project,
                                &self.name,
                                VolumeType::Custom,
                                &format!("{name}/{blocker}"),
                            )
                            .await?;
                        self.emit(
                            EventKind::SnapshotDeleted,
                            project,
                            &format!("{name}/{blocker}"),
                        )
                        .await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let mut details = HashMap::new();
        details.insert("snapshot".to_string(), leaf.to_string());
        self.emit_with(EventKind::VolumeRestored, project, name, details)
            .await;
        Ok(())
    }

    /// Mount a custom volume.
    pub async fn mount_custom_volume(&self, project: &str, name: &str) -> Result<MountInfo> {
        self.is_status_ready().await?;
        let (_, vol) = self.custom_volume(project, name).await?;
        self.driver.mount_volume(&vol).await
    }

    /// Unmount a custom volume.
    pub async fn unmount_custom_volume(&self, project: &str, name: &str) -> Result<bool> {
        let (_, vol) = self.custom_volume(project, name).await?;
        self.driver.unmount_volume(&vol).await
    }

    /// Disk space accounting for a custom volume.
    pub async fn get_custom_volume_usage(&self, project: &str, name: &str) -> Result<VolumeUsage> {
        self.is_status_ready().await?;
        let (_, vol) = self.custom_volume(project, name).await?;
        self.driver.volume_usage(&vol).await
    }

    /// Path of the block device backing a block-content custom volume.
    pub async fn get_custom_volume_disk(&self, project: &str, name: &str) -> Result<PathBuf> {
        self.is_status_ready().await?;
        let (record, vol) = self.custom_volume(project, name).await?;
        if record.content_type != ContentType::Block {
            return Err(StorageError::Validation(format!(
                "Volume {name:?} has no block device"
            )));
        }
        self.driver.volume_disk_path(&vol).await
    }

    /// Create a custom volume holding an ISO image, unpacked by the filler.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name))]
    pub async fn create_custom_volume_from_iso(
        &self,
        project: &str,
        name: &str,
        filler: &dyn VolumeFiller,
        size: u64,
    ) -> Result<()> {
        self.is_status_ready().await?;
        validate_custom_volume_name(name)?;
        if self
            .state
            .store
            .volume_exists(project, &self.name, VolumeType::Custom, name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume {name:?} already exists"
            )));
        }

        let mut config = HashMap::new();
        if size > 0 {
            config.insert("size".to_string(), size.to_string());
        }
        let storage = paths::storage_name(VolumeType::Custom, project, name);
        let vol = self
            .prepare_volume(VolumeType::Custom, ContentType::Iso, &storage, config)
            .await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let record = VolumeRecord::new(
                project,
                &self.name,
                name,
                VolumeType::Custom,
                ContentType::Iso,
                vol.config().clone(),
            );
            self.stage_volume_records(&mut rollback, Some(record), Vec::new())
                .await?;

            self.driver.create_volume(&vol, Some(filler)).await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type: VolumeType::Custom,
                content_type: ContentType::Iso,
                storage_name: vol.name().to_string(),
                config: vol.config().clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_added(project, VolumeType::Custom, name)
            .await;
        self.emit(EventKind::VolumeCreated, project, name).await;
        Ok(())
    }

    /// Export a custom volume (and optionally its snapshots) into a sink.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, volume = %name))]
    pub async fn backup_custom_volume(
        &self,
        project: &str,
        name: &str,
        target: &mut (dyn AsyncWrite + Send + Unpin),
        with_snapshots: bool,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (_, vol) = self.custom_volume(project, name).await?;

        let leaves: Vec<String> = if with_snapshots {
            self.custom_snapshot_records(project, name)
                .await?
                .iter()
                .filter_map(|s| parent_and_snapshot(&s.name).1.map(str::to_string))
                .collect()
        } else {
            Vec::new()
        };

        self.driver.backup_volume(&vol, target, &leaves).await
    }

    /// Recreate a custom volume from an exported archive.
    ///
    /// Records come from the archive's descriptor when present; otherwise
    /// they are synthesized from the leaf list. When the driver asks for
    /// post-import processing the recorded size is re-applied without the
    /// usual shrink safety.
    #[instrument(skip_all, fields(pool = %self.name, project = %info.project, volume = %info.name))]
    pub async fn create_custom_volume_from_backup(
        &self,
        info: &BackupInfo,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.is_status_ready().await?;
        validate_custom_volume_name(&info.name)?;
        if self
            .state
            .store
            .volume_exists(&info.project, &self.name, VolumeType::Custom, &info.name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume {:?} already exists",
                info.name
            )));
        }

        let descriptor_volume = info.config.as_ref().and_then(|c| c.volume.as_ref());
        let content_type = descriptor_volume
            .map(|v| v.content_type)
            .unwrap_or(ContentType::Filesystem);
        let base_config = descriptor_volume
            .map(|v| v.config.clone())
            .unwrap_or_default();

        let descriptor_snapshots: Vec<VolumeRecord> = match &info.config {
            Some(config) if !config.volume_snapshots.is_empty() => config
                .volume_snapshots
                .iter()
                .map(|s| {
                    let mut adapted = s.clone();
                    adapted.name = format!("{}/{}", info.name, s.name);
                    adapted
                })
                .collect(),
            _ => info
                .snapshots
                .iter()
                .map(|leaf| {
                    VolumeRecord::new(
                        &info.project,
                        &self.name,
                        &format!("{}/{leaf}", info.name),
                        VolumeType::Custom,
                        content_type,
                        base_config.clone(),
                    )
                })
                .collect(),
        };

        let (parent, snap_records) = self.adapt_records(
            &info.project,
            &info.name,
            VolumeType::Custom,
            content_type,
            base_config,
            &descriptor_snapshots,
            true,
        );

        let storage = paths::storage_name(VolumeType::Custom, &info.project, &info.name);
        let vol = self
            .prepare_volume(VolumeType::Custom, content_type, &storage, parent.config.clone())
            .await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.stage_volume_records(&mut rollback, Some(parent), snap_records)
                .await?;

            let needs_tuning = self
                .driver
                .create_volume_from_backup(&vol, source, info)
                .await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type: VolumeType::Custom,
                content_type,
                storage_name: vol.name().to_string(),
                config: vol.config().clone(),
            });

            if needs_tuning {
                if let Some(size) = vol.size()? {
                    self.driver.set_volume_quota(&vol, size, true).await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_added(&info.project, VolumeType::Custom, &info.name)
            .await;
        self.emit(EventKind::VolumeCreated, &info.project, &info.name)
            .await;
        Ok(())
    }

    /// Build the backup descriptor for a custom volume.
    pub async fn generate_custom_volume_backup_config(
        &self,
        project: &str,
        name: &str,
    ) -> Result<BackupConfig> {
        let record = self.custom_record(project, name).await?;

        let volume_snapshots = self
            .custom_snapshot_records(project, name)
            .await?
            .into_iter()
            .map(|mut r| {
                let leaf = parent_and_snapshot(&r.name).1.map(str::to_string);
                if let Some(leaf) = leaf {
                    r.name = leaf;
                }
                r
            })
            .collect();

        Ok(BackupConfig {
            pool: Some(self.pool_record().await),
            volume: Some(record),
            volume_snapshots,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EngineState;
    use crate::mock::MockDriver;
    use crate::records::PoolRecord;
    use crate::types::PoolStatus;

    async fn backend() -> (Arc<EngineState>, MockDriver, Arc<Backend>) {
        let state = EngineState::builder()
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
        let backend = Arc::new(Backend::new(pool, driver.clone(), state.clone()));
        backend.create().await.unwrap();
        (state, driver, backend)
    }

    #[tokio::test]
    async fn test_create_custom_volume_records_and_storage() {
        let (state, driver, backend) = backend().await;

        backend
            .create_custom_volume(
                "default",
                "vol1",
                "scratch space",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();

        let record = state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap();
        assert_eq!(record.description, "scratch space");
        assert!(driver
            .volume_names()
            .await
            .contains(&"default_vol1".to_string()));

        let err = backend
            .create_custom_volume(
                "default",
                "vol1",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_record() {
        let (state, driver, backend) = backend().await;
        driver.fail_once("create_volume").await;

        backend
            .create_custom_volume(
                "default",
                "vol1",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap_err();

        assert!(!state
            .store
            .volume_exists("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap());
        assert!(!driver
            .volume_names()
            .await
            .contains(&"default_vol1".to_string()));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_names() {
        let (_state, _driver, backend) = backend().await;

        for bad in ["", "a/b"] {
            let err = backend
                .create_custom_volume(
                    "default",
                    bad,
                    "",
                    HashMap::new(),
                    ContentType::Filesystem,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::Validation(_)), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_project_prefix_in_storage_name() {
        let (state, driver, backend) = backend().await;

        backend
            .create_custom_volume(
                "web",
                "vol1",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();

        assert!(driver.volume_names().await.contains(&"web_vol1".to_string()));
        assert!(state
            .store
            .get_volume("web", "p1", VolumeType::Custom, "vol1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_copy_with_and_without_snapshots() {
        let (state, driver, backend) = backend().await;
        backend
            .create_custom_volume(
                "default",
                "src",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();
        backend
            .create_custom_volume_snapshot("default", "src", "s1", None)
            .await
            .unwrap();

        backend
            .create_custom_volume_from_copy(
                "default",
                "full",
                "copy",
                HashMap::new(),
                "default",
                "src",
                &backend,
                true,
            )
            .await
            .unwrap();
        assert_eq!(
            state
                .store
                .list_snapshots("default", "p1", VolumeType::Custom, "full")
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            driver
                .snapshot_leaves(VolumeType::Custom, "default_full")
                .await,
            vec!["s1".to_string()]
        );

        backend
            .create_custom_volume_from_copy(
                "default",
                "bare",
                "",
                HashMap::new(),
                "default",
                "src",
                &backend,
                false,
            )
            .await
            .unwrap();
        assert!(state
            .store
            .list_snapshots("default", "p1", VolumeType::Custom, "bare")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_deleted_copy_source_held_until_last_clone_goes() {
        let (state, driver, backend) = backend().await;
        backend
            .create_custom_volume(
                "default",
                "base",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();
        for name in ["copy1", "copy2"] {
            backend
                .create_custom_volume_from_copy(
                    "default",
                    name,
                    "",
                    HashMap::new(),
                    "default",
                    "base",
                    &backend,
                    false,
                )
                .await
                .unwrap();
        }

        // The record goes, but the driver keeps the data deferred while
        // both clones still reference it.
        backend.delete_custom_volume("default", "base").await.unwrap();
        assert!(!state
            .store
            .volume_exists("default", "p1", VolumeType::Custom, "base")
            .await
            .unwrap());
        assert!(!driver
            .volume_names()
            .await
            .contains(&"default_base".to_string()));
        assert!(driver
            .deferred_names()
            .await
            .contains(&"default_base".to_string()));

        backend.delete_custom_volume("default", "copy1").await.unwrap();
        assert!(driver
            .deferred_names()
            .await
            .contains(&"default_base".to_string()));

        // Last dependent gone, the cascade reclaims the source.
        backend.delete_custom_volume("default", "copy2").await.unwrap();
        assert!(driver.deferred_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_exclude_older_skips_predecessors() {
        let (state, _driver, backend) = backend().await;
        backend
            .create_custom_volume(
                "default",
                "src",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();
        backend
            .create_custom_volume_snapshot("default", "src", "old", None)
            .await
            .unwrap();
        backend
            .create_custom_volume_snapshot("default", "src", "new", None)
            .await
            .unwrap();

        backend
            .create_custom_volume_from_copy(
                "default",
                "dst",
                "",
                HashMap::new(),
                "default",
                "src",
                &backend,
                true,
            )
            .await
            .unwrap();
        backend
            .delete_custom_volume_snapshot("default", "dst/old")
            .await
            .unwrap();

        // The shared newest snapshot fences off everything before it.
        backend
            .refresh_custom_volume("default", "dst", "default", "src", &backend, true, true)
            .await
            .unwrap();
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "dst/old")
            .await
            .unwrap_err()
            .is_not_found());

        // Without the fence the older snapshot is transferred again.
        backend
            .refresh_custom_volume("default", "dst", "default", "src", &backend, true, false)
            .await
            .unwrap();
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "dst/old")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_update_rules() {
        let (state, driver, backend) = backend().await;
        let mut config = HashMap::new();
        config.insert("size".to_string(), "2GiB".to_string());
        backend
            .create_custom_volume("default", "vol1", "", config, ContentType::Filesystem)
            .await
            .unwrap();

        // Filesystem is fixed at creation.
        let mut new_config = HashMap::new();
        new_config.insert("size".to_string(), "2GiB".to_string());
        new_config.insert("block.filesystem".to_string(), "xfs".to_string());
        let err = backend
            .update_custom_volume("default", "vol1", "", new_config, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));

        // Ownership shifting waits for attached instances to stop.
        let mut new_config = HashMap::new();
        new_config.insert("size".to_string(), "2GiB".to_string());
        new_config.insert("security.shifted".to_string(), "true".to_string());
        let err = backend
            .update_custom_volume("default", "vol1", "", new_config.clone(), true)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        backend
            .update_custom_volume("default", "vol1", "", new_config, false)
            .await
            .unwrap();

        // Size changes go through the quota path.
        let mut new_config = HashMap::new();
        new_config.insert("size".to_string(), "4GiB".to_string());
        new_config.insert("security.shifted".to_string(), "true".to_string());
        backend
            .update_custom_volume("default", "vol1", "bigger", new_config, false)
            .await
            .unwrap();
        assert_eq!(driver.call_count("set_volume_quota").await, 1);
        let record = state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap();
        assert_eq!(record.description, "bigger");
        assert_eq!(record.config.get("size").map(String::as_str), Some("4GiB"));
    }

    #[tokio::test]
    async fn test_iso_volumes_are_read_only() {
        let (_state, _driver, backend) = backend().await;

        struct IsoFiller;

        #[async_trait::async_trait]
        impl VolumeFiller for IsoFiller {
            async fn fill(&self, _vol: &Volume, _root: &std::path::Path) -> Result<u64> {
                Ok(0)
            }
        }

        backend
            .create_custom_volume_from_iso("default", "media", &IsoFiller, 1 << 20)
            .await
            .unwrap();

        let mut new_config = HashMap::new();
        new_config.insert("size".to_string(), "5GiB".to_string());
        let err = backend
            .update_custom_volume("default", "media", "", new_config, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));

        // Description-only updates stay allowed.
        backend
            .update_custom_volume(
                "default",
                "media",
                "install media",
                {
                    let mut c = HashMap::new();
                    c.insert("size".to_string(), (1u64 << 20).to_string());
                    c
                },
                false,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_expiry_and_update() {
        let (state, _driver, backend) = backend().await;
        backend
            .create_custom_volume(
                "default",
                "vol1",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();

        let expiry = Utc::now() + chrono::Duration::days(7);
        backend
            .create_custom_volume_snapshot("default", "vol1", "s1", Some(expiry))
            .await
            .unwrap();

        let record = state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "vol1/s1")
            .await
            .unwrap();
        assert_eq!(record.expires_at, Some(expiry));

        backend
            .update_custom_volume_snapshot("default", "vol1/s1", "weekly", None)
            .await
            .unwrap();
        let record = state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "vol1/s1")
            .await
            .unwrap();
        assert_eq!(record.description, "weekly");
        assert_eq!(record.expires_at, None);
    }

    #[tokio::test]
    async fn test_delete_cascades_snapshots() {
        let (state, driver, backend) = backend().await;
        backend
            .create_custom_volume(
                "default",
                "vol1",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();
        backend
            .create_custom_volume_snapshot("default", "vol1", "s1", None)
            .await
            .unwrap();
        backend
            .create_custom_volume_snapshot("default", "vol1", "s2", None)
            .await
            .unwrap();

        backend.delete_custom_volume("default", "vol1").await.unwrap();

        assert!(driver.volume_names().await.is_empty());
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(state
            .store
            .list_snapshots("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_restore_refused_while_in_use() {
        let (_state, _driver, backend) = backend().await;
        backend
            .create_custom_volume(
                "default",
                "vol1",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();
        backend
            .create_custom_volume_snapshot("default", "vol1", "s1", None)
            .await
            .unwrap();

        let err = backend
            .restore_custom_volume("default", "vol1", "s1", true)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        backend
            .restore_custom_volume("default", "vol1", "s1", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_block_volume_disk_path() {
        let (_state, _driver, backend) = backend().await;
        backend
            .create_custom_volume(
                "default",
                "blk",
                "",
                HashMap::new(),
                ContentType::Block,
            )
            .await
            .unwrap();

        let path = backend
            .get_custom_volume_disk("default", "blk")
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/mock/default_blk"));

        backend
            .create_custom_volume(
                "default",
                "fs",
                "",
                HashMap::new(),
                ContentType::Filesystem,
            )
            .await
            .unwrap();
        assert!(backend.get_custom_volume_disk("default", "fs").await.is_err());
    }

    #[tokio::test]
    async fn test_backup_export_import_round_trip() {
        let (state, driver, backend) = backend().await;
        let mut config = HashMap::new();
        config.insert("size".to_string(), "2GiB".to_string());
        backend
            .create_custom_volume("default", "src", "", config, ContentType::Filesystem)
            .await
            .unwrap();
        backend
            .create_custom_volume_snapshot("default", "src", "s1", None)
            .await
            .unwrap();

        let descriptor = backend
            .generate_custom_volume_backup_config("default", "src")
            .await
            .unwrap();
        assert_eq!(descriptor.volume_snapshot_names(), vec!["s1".to_string()]);

        let (mut sink, mut capture) = migration::pipe_pair(migration::DEFAULT_PIPE_CAPACITY);
        let b = backend.clone();
        let exporter = tokio::spawn(async move {
            b.backup_custom_volume("default", "src", &mut sink, true)
                .await
        });
        let mut archive = Vec::new();
        use tokio::io::AsyncReadExt;
        capture.read_to_end(&mut archive).await.unwrap();
        exporter.await.unwrap().unwrap();
        assert!(!archive.is_empty());

        driver.set_backup_post_hook(true).await;
        let info = BackupInfo {
            project: "default".to_string(),
            name: "restored".to_string(),
            pool: "p1".to_string(),
            snapshots: vec!["s1".to_string()],
            optimized_storage: false,
            config: Some(descriptor),
        };
        let (mut feed, mut source) = migration::pipe_pair(migration::DEFAULT_PIPE_CAPACITY);
        let payload = archive.clone();
        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            feed.write_all(&payload).await.unwrap();
            feed.shutdown().await.unwrap();
        });
        backend
            .create_custom_volume_from_backup(&info, &mut source)
            .await
            .unwrap();
        feeder.await.unwrap();

        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "restored")
            .await
            .is_ok());
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Custom, "restored/s1")
            .await
            .is_ok());
        assert_eq!(
            driver
                .snapshot_leaves(VolumeType::Custom, "default_restored")
                .await,
            vec!["s1".to_string()]
        );
        assert_eq!(driver.call_count("set_volume_quota").await, 1);
    }
}
