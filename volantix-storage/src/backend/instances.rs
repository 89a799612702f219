//! Instance volume operations.
//!
//! Instances own exactly one root volume (filesystem for containers, block
//! for virtual machines) plus any number of snapshots. Record rows hold the
//! logical `parent/leaf` names; storage-level names carry the project
//! prefix. Creates follow record-then-driver ordering, deletes run
//! physical-first, and every copy of a running instance goes through the
//! freeze policy before the driver touches the volume.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::backup::{write_backup_file, BackupConfig};
use crate::config;
use crate::drivers::{Volume, VolumeFiller};
use crate::error::{Result, StorageError};
use crate::events::EventKind;
use crate::instance::Instance;
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

impl Backend {
    pub(super) fn instance_storage(&self, inst: &dyn Instance) -> String {
        paths::storage_name(inst.kind().volume_type(), inst.project(), inst.name())
    }

    pub(super) fn instance_handle(&self, inst: &dyn Instance, config: HashMap<String, String>) -> Volume {
        self.volume_handle(
            inst.kind().volume_type(),
            inst.kind().content_type(),
            &self.instance_storage(inst),
            config,
        )
    }

    async fn instance_record(&self, inst: &dyn Instance) -> Result<VolumeRecord> {
        self.state
            .store
            .get_volume(
                inst.project(),
                &self.name,
                inst.kind().volume_type(),
                inst.name(),
            )
            .await
    }

    async fn instance_volume(&self, inst: &dyn Instance) -> Result<(VolumeRecord, Volume)> {
        let record = self.instance_record(inst).await?;
        let vol = self.volume_for_record(&record);
        Ok((record, vol))
    }

    async fn instance_snapshot_records(&self, inst: &dyn Instance) -> Result<Vec<VolumeRecord>> {
        self.state
            .store
            .list_snapshots(
                inst.project(),
                &self.name,
                inst.kind().volume_type(),
                inst.name(),
            )
            .await
    }

    /// Requested root disk size of the instance, when one is configured.
    fn instance_root_size(inst: &dyn Instance) -> Result<Option<u64>> {
        match inst.root_disk_config().get("size") {
            Some(v) if !v.is_empty() => Ok(Some(config::parse_size(v)?)),
            _ => Ok(None),
        }
    }

    pub(super) async fn stage_instance_symlink(
        &self,
        rollback: &mut Rollback,
        inst: &dyn Instance,
        vol: &Volume,
    ) -> Result<()> {
        let link = paths::instance_symlink_path(
            &self.state.var_dir,
            inst.kind().volume_type(),
            inst.project(),
            inst.name(),
        );
        paths::ensure_symlink(&link, &vol.mount_path()).await?;
        rollback.push(UndoAction::RemoveSymlink { link });
        Ok(())
    }

    pub(super) async fn stage_snapshots_symlink(
        &self,
        rollback: &mut Rollback,
        inst: &dyn Instance,
    ) -> Result<()> {
        let vol_type = inst.kind().volume_type();
        let link = paths::instance_snapshots_symlink_path(
            &self.state.var_dir,
            vol_type,
            inst.project(),
            inst.name(),
        );
        let target = paths::volume_snapshots_mount_path(
            &self.state.var_dir,
            &self.name,
            vol_type,
            &self.instance_storage(inst),
        );
        paths::ensure_symlink(&link, &target).await?;
        rollback.push(UndoAction::RemoveSymlink { link });
        Ok(())
    }

    /// Create an empty root volume for a new instance.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name()))]
    pub async fn create_instance(
        &self,
        inst: &dyn Instance,
        config: HashMap<String, String>,
    ) -> Result<()> {
        self.is_status_ready().await?;
        if inst.is_snapshot() {
            return Err(StorageError::Validation(
                "Snapshot instances cannot own a new volume".to_string(),
            ));
        }

        let vol_type = inst.kind().volume_type();
        if self
            .state
            .store
            .volume_exists(inst.project(), &self.name, vol_type, inst.name())
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume for instance {:?} already exists",
                inst.name()
            )));
        }

        let vol = self
            .prepare_volume(
                vol_type,
                inst.kind().content_type(),
                &self.instance_storage(inst),
                config,
            )
            .await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let record = VolumeRecord::new(
                inst.project(),
                &self.name,
                inst.name(),
                vol_type,
                inst.kind().content_type(),
                vol.config().clone(),
            );
            self.stage_volume_records(&mut rollback, Some(record), Vec::new())
                .await?;

            self.driver.create_volume(&vol, None).await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type,
                content_type: vol.content_type(),
                storage_name: vol.name().to_string(),
                config: vol.config().clone(),
            });

            self.stage_instance_symlink(&mut rollback, inst, &vol).await
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_added(inst.project(), vol_type, inst.name())
            .await;
        self.emit(EventKind::VolumeCreated, inst.project(), inst.name())
            .await;
        Ok(())
    }

    /// Copy another instance's root volume (and optionally its snapshots)
    /// into a volume for `inst`.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name(), source = %src.name()))]
    pub async fn create_instance_from_copy(
        &self,
        inst: &dyn Instance,
        src: &dyn Instance,
        src_pool: &Arc<Backend>,
        volume_only: bool,
        allow_inconsistent: bool,
    ) -> Result<()> {
        self.is_status_ready().await?;
        src_pool.is_status_ready().await?;
        if inst.kind() != src.kind() {
            return Err(StorageError::Validation(
                "Source and target instance kinds do not match".to_string(),
            ));
        }

        let vol_type = inst.kind().volume_type();
        let content_type = inst.kind().content_type();
        if self
            .state
            .store
            .volume_exists(inst.project(), &self.name, vol_type, inst.name())
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume for instance {:?} already exists",
                inst.name()
            )));
        }

        let (src_record, src_vol) = src_pool.instance_volume(src).await?;
        let src_snapshots = if volume_only {
            Vec::new()
        } else {
            src_pool.instance_snapshot_records(src).await?
        };
        let leaves: Vec<String> = src_snapshots
            .iter()
            .filter_map(|s| parent_and_snapshot(&s.name).1.map(str::to_string))
            .collect();

        let same_pool = self.is_same_pool(src_pool);
        let (parent, snap_records) = self.adapt_records(
            inst.project(),
            inst.name(),
            vol_type,
            content_type,
            src_record.config.clone(),
            &src_snapshots,
            !same_pool,
        );
        let vol = self
            .prepare_volume(
                vol_type,
                content_type,
                &self.instance_storage(inst),
                parent.config.clone(),
            )
            .await?;

        let frozen = src_pool
            .freeze_for_transfer(src, allow_inconsistent)
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
                    .generate_instance_backup_config(src, !volume_only)
                    .await?;
                self.transfer_volume(
                    src_pool,
                    src_vol.clone(),
                    vol.clone(),
                    source_config,
                    leaves.clone(),
                    false,
                    volume_only,
                    allow_inconsistent,
                    Self::instance_root_size(inst)?,
                )
                .await?;
            }
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type,
                content_type,
                storage_name: vol.name().to_string(),
                config: vol.config().clone(),
            });

            self.stage_instance_symlink(&mut rollback, inst, &vol).await?;
            if !leaves.is_empty() {
                self.stage_snapshots_symlink(&mut rollback, inst).await?;
            }
            Ok(())
        }
        .await;
        src_pool.thaw_after(src, frozen).await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_added(inst.project(), vol_type, inst.name())
            .await;
        let mut details = HashMap::new();
        details.insert("source".to_string(), src.name().to_string());
        self.emit_with(EventKind::VolumeCreated, inst.project(), inst.name(), details)
            .await;
        Ok(())
    }

    /// Bring an existing instance volume up to date with a source instance.
    ///
    /// Snapshots present only on the target are deleted first; missing
    /// source snapshots are transferred. Running the refresh twice in a row
    /// leaves the target unchanged.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name(), source = %src.name()))]
    pub async fn refresh_instance(
        &self,
        inst: &dyn Instance,
        src: &dyn Instance,
        src_pool: &Arc<Backend>,
        volume_only: bool,
        allow_inconsistent: bool,
    ) -> Result<()> {
        self.is_status_ready().await?;
        src_pool.is_status_ready().await?;
        if inst.kind() != src.kind() {
            return Err(StorageError::Validation(
                "Source and target instance kinds do not match".to_string(),
            ));
        }

        let vol_type = inst.kind().volume_type();
        let content_type = inst.kind().content_type();
        let (_, vol) = self.instance_volume(inst).await?;
        let (src_record, src_vol) = src_pool.instance_volume(src).await?;

        let src_snapshots = if volume_only {
            Vec::new()
        } else {
            src_pool.instance_snapshot_records(src).await?
        };
        let tgt_snapshots = self.instance_snapshot_records(inst).await?;

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
            migration::compare_snapshots(&src_comp, &tgt_comp, false);

        // Drop target-only snapshots before transferring anything. These are
        // forward deletes, not rollback candidates: a failed refresh must not
        // resurrect snapshots the source no longer has.
        for idx in &delete_indexes {
            let record = &tgt_snapshots[*idx];
            let leaf = &tgt_comp[*idx].name;
            debug!(snapshot = %record.name, "Removing target-only snapshot before refresh");
            self.driver
                .delete_volume_snapshot(&vol.new_snapshot(leaf))
                .await?;
            self.state
                .store
                .delete_volume(inst.project(), &self.name, vol_type, &record.name)
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
            inst.project(),
            inst.name(),
            vol_type,
            content_type,
            src_record.config.clone(),
            &sync_records,
            !same_pool,
        );

        let frozen = src_pool
            .freeze_for_transfer(src, allow_inconsistent)
            .await?;
        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.stage_volume_records(&mut rollback, None, snap_records)
                .await?;

            if same_pool {
                self.driver.refresh_volume(&vol, &src_vol, &leaves).await?;
            } else {
                let source_config = src_pool
                    .generate_instance_backup_config(src, !volume_only)
                    .await?;
                self.transfer_volume(
                    src_pool,
                    src_vol.clone(),
                    vol.clone(),
                    source_config,
                    leaves.clone(),
                    true,
                    volume_only,
                    allow_inconsistent,
                    None,
                )
                .await?;
            }
            Ok(())
        }
        .await;
        src_pool.thaw_after(src, frozen).await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        let mut details = HashMap::new();
        details.insert("source".to_string(), src.name().to_string());
        details.insert("refresh".to_string(), "true".to_string());
        self.emit_with(EventKind::VolumeUpdated, inst.project(), inst.name(), details)
            .await;
        Ok(())
    }

    /// Create an instance volume from an image, through the image cache
    /// when the driver supports it.
    ///
    /// When the cached image cannot be resized down to the requested root
    /// size the copy is abandoned and the image is unpacked directly into
    /// the new volume instead.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name(), fingerprint = %fingerprint))]
    pub async fn create_instance_from_image(
        &self,
        inst: &dyn Instance,
        fingerprint: &str,
        filler: &dyn VolumeFiller,
        config: HashMap<String, String>,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let vol_type = inst.kind().volume_type();
        let content_type = inst.kind().content_type();
        if self
            .state
            .store
            .volume_exists(inst.project(), &self.name, vol_type, inst.name())
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume for instance {:?} already exists",
                inst.name()
            )));
        }

        let vol = self
            .prepare_volume(
                vol_type,
                content_type,
                &self.instance_storage(inst),
                config,
            )
            .await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let record = VolumeRecord::new(
                inst.project(),
                &self.name,
                inst.name(),
                vol_type,
                content_type,
                vol.config().clone(),
            );
            self.stage_volume_records(&mut rollback, Some(record), Vec::new())
                .await?;

            let mut direct_unpack = !self.driver.info().optimized_images;
            if !direct_unpack {
                match self
                    .clone_from_cached_image(inst, &vol, fingerprint, filler, content_type)
                    .await
                {
                    Ok(()) => {}
                    Err(StorageError::CannotBeShrunk(reason)) => {
                        debug!(
                            fingerprint = %fingerprint,
                            reason = %reason,
                            "Cached image larger than requested size, unpacking directly"
                        );
                        direct_unpack = true;
                    }
                    Err(e) => {
                        warn!(
                            fingerprint = %fingerprint,
                            error = %e,
                            "Image cache unusable, unpacking directly"
                        );
                        direct_unpack = true;
                    }
                }
            }
            if direct_unpack {
                self.driver.create_volume(&vol, Some(filler)).await?;
            }
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type,
                content_type,
                storage_name: vol.name().to_string(),
                config: vol.config().clone(),
            });

            self.stage_instance_symlink(&mut rollback, inst, &vol).await
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.authorize_volume_added(inst.project(), vol_type, inst.name())
            .await;
        let mut details = HashMap::new();
        details.insert("image".to_string(), fingerprint.to_string());
        self.emit_with(EventKind::VolumeCreated, inst.project(), inst.name(), details)
            .await;
        Ok(())
    }

    /// Copy the cached image volume into a new instance volume and resize
    /// it to the requested root size.
    async fn clone_from_cached_image(
        &self,
        inst: &dyn Instance,
        vol: &Volume,
        fingerprint: &str,
        filler: &dyn VolumeFiller,
        content_type: ContentType,
    ) -> Result<()> {
        self.ensure_image(fingerprint, filler, content_type).await?;

        let image_record = self
            .state
            .store
            .get_volume(
                paths::DEFAULT_PROJECT,
                &self.name,
                VolumeType::Image,
                fingerprint,
            )
            .await?;
        let image_vol = self.volume_for_record(&image_record);

        self.driver
            .create_volume_from_copy(vol, &image_vol, &[])
            .await?;

        if let Some(size) = Self::instance_root_size(inst)? {
            if let Err(e) = self.driver.set_volume_quota(vol, size, false).await {
                // Leave no half-sized clone behind when falling back.
                if matches!(e, StorageError::CannotBeShrunk(_)) {
                    self.driver.delete_volume(vol).await?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Receive an instance volume from a remote source.
    ///
    /// The index header arrives on `header`, volume data on `data`. A
    /// refresh request against a missing target volume is downgraded to a
    /// full receive and the override is reported back to the source.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name()))]
    pub async fn create_instance_from_migration(
        &self,
        inst: &dyn Instance,
        header: &mut MigrationConn,
        data: &mut MigrationConn,
        mut args: VolumeTargetArgs,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let vol_type = inst.kind().volume_type();
        let content_type = inst.kind().content_type();

        let info = migration::receive_index_header(header, args.index_header_version).await?;

        let target_exists = self
            .state
            .store
            .volume_exists(inst.project(), &self.name, vol_type, inst.name())
            .await?;
        let mut refresh_override = None;
        if args.refresh && !target_exists {
            debug!("Refresh requested but target volume is missing, forcing full receive");
            args.refresh = false;
            refresh_override = Some(false);
        }
        if !args.refresh && target_exists {
            return Err(StorageError::conflict(format!(
                "Volume for instance {:?} already exists",
                inst.name()
            )));
        }

        let mut src_snapshots: Vec<VolumeRecord> = Vec::new();
        if let Some(info) = &info {
            if info.config.instance.is_some() {
                info.config.check_snapshot_consistency()?;
            }
            if let Some(volume) = &info.config.volume {
                args.config = volume.config.clone();
            }
            // Source snapshot records come through under their leaf names.
            src_snapshots = info
                .config
                .volume_snapshots
                .iter()
                .map(|s| {
                    let mut adapted = s.clone();
                    adapted.name = format!("{}/{}", inst.name(), s.name);
                    adapted
                })
                .collect();
        }
        if let Some(size) = Self::instance_root_size(inst)? {
            args.volume_size = Some(size);
        }

        if args.index_header_version > 0 {
            migration::respond_index_header(header, &InfoResponse::ok(refresh_override)).await?;
        }

        let (parent, mut snap_records) = self.adapt_records(
            inst.project(),
            inst.name(),
            vol_type,
            content_type,
            args.config.clone(),
            &src_snapshots,
            true,
        );
        if args.volume_only {
            snap_records.clear();
        }
        args.snapshots = snap_records
            .iter()
            .filter_map(|s| parent_and_snapshot(&s.name).1.map(str::to_string))
            .collect();

        if args.refresh {
            let existing: Vec<String> = self
                .instance_snapshot_records(inst)
                .await?
                .iter()
                .map(|r| r.name.clone())
                .collect();
            snap_records.retain(|s| !existing.contains(&s.name));
        }

        let vol = self
            .prepare_volume(
                vol_type,
                content_type,
                &self.instance_storage(inst),
                parent.config.clone(),
            )
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
                    vol_type,
                    content_type,
                    storage_name: vol.name().to_string(),
                    config: vol.config().clone(),
                });
                self.stage_instance_symlink(&mut rollback, inst, &vol).await?;
                if !args.snapshots.is_empty() {
                    self.stage_snapshots_symlink(&mut rollback, inst).await?;
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

        if !refresh {
            self.authorize_volume_added(inst.project(), vol_type, inst.name())
                .await;
        }
        self.emit(EventKind::VolumeCreated, inst.project(), inst.name())
            .await;
        Ok(())
    }

    /// Send an instance volume to a remote target.
    ///
    /// The target may override the refresh mode through the index header
    /// acknowledgement; the adjusted mode is reflected back into `args`.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name()))]
    pub async fn migrate_instance(
        &self,
        inst: &dyn Instance,
        header: &mut MigrationConn,
        data: &mut MigrationConn,
        args: &mut VolumeSourceArgs,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (_, vol) = self.instance_volume(inst).await?;

        let frozen = self
            .freeze_for_transfer(inst, args.allow_inconsistent)
            .await?;
        let sent: Result<()> = async {
            let config = self
                .generate_instance_backup_config(inst, !args.volume_only)
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
            self.driver.migrate_volume(&vol, data, args).await
        }
        .await;
        self.thaw_after(inst, frozen).await;
        sent?;

        self.emit(EventKind::VolumeMigrated, inst.project(), inst.name())
            .await;
        Ok(())
    }

    /// Rename an instance volume and all of its snapshots.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name(), new_name = %new_name))]
    pub async fn rename_instance(&self, inst: &dyn Instance, new_name: &str) -> Result<()> {
        self.is_status_ready().await?;
        let vol_type = inst.kind().volume_type();
        let (record, vol) = self.instance_volume(inst).await?;
        if self
            .state
            .store
            .volume_exists(inst.project(), &self.name, vol_type, new_name)
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Volume named {new_name:?} already exists"
            )));
        }

        let snapshots = self.instance_snapshot_records(inst).await?;
        let new_storage = paths::storage_name(vol_type, inst.project(), new_name);

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
                        inst.project(),
                        &self.name,
                        vol_type,
                        &snap.name,
                        &new_snap_name,
                    )
                    .await?;
                rollback.push(UndoAction::RenameVolumeRecord {
                    project: inst.project().to_string(),
                    vol_type,
                    from: new_snap_name,
                    to: snap.name.clone(),
                });
            }

            self.state
                .store
                .rename_volume(
                    inst.project(),
                    &self.name,
                    vol_type,
                    inst.name(),
                    new_name,
                )
                .await?;
            rollback.push(UndoAction::RenameVolumeRecord {
                project: inst.project().to_string(),
                vol_type,
                from: new_name.to_string(),
                to: inst.name().to_string(),
            });

            self.driver.rename_volume(&vol, &new_storage).await?;
            rollback.push(UndoAction::RenamePhysicalVolume {
                vol_type,
                content_type: vol.content_type(),
                from: new_storage.clone(),
                to: vol.name().to_string(),
                config: vol.config().clone(),
            });

            let old_link = paths::instance_symlink_path(
                &self.state.var_dir,
                vol_type,
                inst.project(),
                inst.name(),
            );
            paths::remove_symlink(&old_link).await?;
            rollback.push(UndoAction::EnsureSymlink {
                link: old_link,
                target: vol.mount_path(),
            });

            let new_vol = vol.with_name(&new_storage);
            let new_link = paths::instance_symlink_path(
                &self.state.var_dir,
                vol_type,
                inst.project(),
                new_name,
            );
            paths::ensure_symlink(&new_link, &new_vol.mount_path()).await?;
            rollback.push(UndoAction::RemoveSymlink { link: new_link });

            if !snapshots.is_empty() {
                let old_snap_link = paths::instance_snapshots_symlink_path(
                    &self.state.var_dir,
                    vol_type,
                    inst.project(),
                    inst.name(),
                );
                let old_snap_target = paths::volume_snapshots_mount_path(
                    &self.state.var_dir,
                    &self.name,
                    vol_type,
                    vol.name(),
                );
                paths::remove_symlink(&old_snap_link).await?;
                rollback.push(UndoAction::EnsureSymlink {
                    link: old_snap_link,
                    target: old_snap_target,
                });

                let new_snap_link = paths::instance_snapshots_symlink_path(
                    &self.state.var_dir,
                    vol_type,
                    inst.project(),
                    new_name,
                );
                let new_snap_target = paths::volume_snapshots_mount_path(
                    &self.state.var_dir,
                    &self.name,
                    vol_type,
                    &new_storage,
                );
                paths::ensure_symlink(&new_snap_link, &new_snap_target).await?;
                rollback.push(UndoAction::RemoveSymlink {
                    link: new_snap_link,
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

        self.authorize_volume_renamed(inst.project(), vol_type, inst.name(), new_name)
            .await;
        let mut details = HashMap::new();
        details.insert("old_name".to_string(), record.name.clone());
        self.emit_with(EventKind::VolumeRenamed, inst.project(), new_name, details)
            .await;
        Ok(())
    }

    /// Delete an instance's root volume. Refused while snapshots remain.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name()))]
    pub async fn delete_instance(&self, inst: &dyn Instance) -> Result<()> {
        self.is_status_ready().await?;
        let vol_type = inst.kind().volume_type();
        let (_, vol) = self.instance_volume(inst).await?;

        let snapshots = self.instance_snapshot_records(inst).await?;
        if !snapshots.is_empty() {
            return Err(StorageError::conflict(format!(
                "Instance {:?} still has {} snapshot(s)",
                inst.name(),
                snapshots.len()
            )));
        }

        if self.driver.has_volume(&vol).await? {
            self.driver.delete_volume(&vol).await?;
        }

        paths::remove_symlink(&paths::instance_symlink_path(
            &self.state.var_dir,
            vol_type,
            inst.project(),
            inst.name(),
        ))
        .await?;
        paths::remove_symlink(&paths::instance_snapshots_symlink_path(
            &self.state.var_dir,
            vol_type,
            inst.project(),
            inst.name(),
        ))
        .await?;

        self.state
            .store
            .delete_volume(inst.project(), &self.name, vol_type, inst.name())
            .await?;

        self.authorize_volume_deleted(inst.project(), vol_type, inst.name())
            .await;
        self.emit(EventKind::VolumeDeleted, inst.project(), inst.name())
            .await;
        Ok(())
    }

    /// Apply config changes to an instance volume.
    ///
    /// Size changes go through [`Backend::set_instance_quota`] and are
    /// rejected here.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name()))]
    pub async fn update_instance(
        &self,
        inst: &dyn Instance,
        new_description: &str,
        new_config: HashMap<String, String>,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (record, vol) = self.instance_volume(inst).await?;

        let (changed, user_only) = config::detect_changed_config(&record.config, &new_config);
        if changed.is_empty() && record.description == new_description {
            return Ok(());
        }
        if changed.contains_key("size") {
            return Err(StorageError::Validation(
                "Volume size is managed through the root disk device".to_string(),
            ));
        }
        config::validate_volume_config(
            record.vol_type,
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
                self.driver.update_volume(&vol, &changed).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::VolumeUpdated, inst.project(), inst.name())
            .await;
        Ok(())
    }

    /// Snapshot an instance volume.
    ///
    /// `snap_inst` is the snapshot instance handle (named `parent/leaf`),
    /// `src` the running parent. Creation of concurrent snapshots of one
    /// volume is serialized through an advisory lock.
    #[instrument(skip_all, fields(pool = %self.name, project = %src.project(), snapshot = %snap_inst.name()))]
    pub async fn create_instance_snapshot(
        &self,
        snap_inst: &dyn Instance,
        src: &dyn Instance,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (parent, Some(leaf)) = parent_and_snapshot(snap_inst.name()) else {
            return Err(StorageError::Validation(format!(
                "{:?} is not a snapshot name",
                snap_inst.name()
            )));
        };
        if parent != src.name() {
            return Err(StorageError::Validation(format!(
                "Snapshot {:?} does not belong to instance {:?}",
                snap_inst.name(),
                src.name()
            )));
        }

        let vol_type = src.kind().volume_type();
        let (src_record, vol) = self.instance_volume(src).await?;

        let _guard = self
            .state
            .locks
            .lock(&snapshot_lock_name(
                "CreateInstanceSnapshot",
                &self.name,
                vol_type,
                src.kind().content_type(),
                vol.name(),
            ))
            .await;

        if self
            .state
            .store
            .volume_exists(src.project(), &self.name, vol_type, snap_inst.name())
            .await?
        {
            return Err(StorageError::conflict(format!(
                "Snapshot {:?} already exists",
                snap_inst.name()
            )));
        }

        let frozen = self.freeze_for_transfer(src, false).await?;
        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let record = VolumeRecord::new(
                src.project(),
                &self.name,
                snap_inst.name(),
                vol_type,
                src.kind().content_type(),
                src_record.config.clone(),
            );
            self.stage_volume_records(&mut rollback, Some(record), Vec::new())
                .await?;

            let snap_handle = vol.new_snapshot(leaf);
            self.driver.create_volume_snapshot(&snap_handle).await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type,
                content_type: snap_handle.content_type(),
                storage_name: snap_handle.name().to_string(),
                config: snap_handle.config().clone(),
            });

            self.stage_snapshots_symlink(&mut rollback, src).await
        }
        .await;
        self.thaw_after(src, frozen).await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::SnapshotCreated, src.project(), snap_inst.name())
            .await;
        Ok(())
    }

    /// Rename an instance snapshot to a new leaf name.
    #[instrument(skip_all, fields(pool = %self.name, project = %snap_inst.project(), snapshot = %snap_inst.name()))]
    pub async fn rename_instance_snapshot(
        &self,
        snap_inst: &dyn Instance,
        new_leaf: &str,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let (parent, Some(_)) = parent_and_snapshot(snap_inst.name()) else {
            return Err(StorageError::Validation(format!(
                "{:?} is not a snapshot name",
                snap_inst.name()
            )));
        };
        if new_leaf.contains('/') || new_leaf.is_empty() {
            return Err(StorageError::Validation(format!(
                "Invalid snapshot name {new_leaf:?}"
            )));
        }

        let vol_type = snap_inst.kind().volume_type();
        let (_, snap_vol) = self.instance_volume(snap_inst).await?;
        let new_name = format!("{parent}/{new_leaf}");
        if self
            .state
            .store
            .volume_exists(snap_inst.project(), &self.name, vol_type, &new_name)
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
                .rename_volume(
                    snap_inst.project(),
                    &self.name,
                    vol_type,
                    snap_inst.name(),
                    &new_name,
                )
                .await?;
            rollback.push(UndoAction::RenameVolumeRecord {
                project: snap_inst.project().to_string(),
                vol_type,
                from: new_name.clone(),
                to: snap_inst.name().to_string(),
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

        self.emit(
            EventKind::SnapshotRenamed,
            snap_inst.project(),
            &new_name,
        )
        .await;
        Ok(())
    }

    /// Delete one instance snapshot.
    #[instrument(skip_all, fields(pool = %self.name, project = %snap_inst.project(), snapshot = %snap_inst.name()))]
    pub async fn delete_instance_snapshot(&self, snap_inst: &dyn Instance) -> Result<()> {
        self.is_status_ready().await?;
        let (_, Some(leaf)) = parent_and_snapshot(snap_inst.name()) else {
            return Err(StorageError::Validation(format!(
                "{:?} is not a snapshot name",
                snap_inst.name()
            )));
        };

        let vol_type = snap_inst.kind().volume_type();
        let (_, snap_vol) = self.instance_volume(snap_inst).await?;

        let parent_vol = snap_vol.with_name(snap_vol.parent_name());
        let present = self.driver.volume_snapshots(&parent_vol).await?;
        if present.iter().any(|s| s == leaf) {
            self.driver.delete_volume_snapshot(&snap_vol).await?;
        }

        paths::remove_symlink_if_target_empty(&paths::instance_snapshots_symlink_path(
            &self.state.var_dir,
            vol_type,
            snap_inst.project(),
            parent_and_snapshot(snap_inst.name()).0,
        ))
        .await?;

        self.state
            .store
            .delete_volume(
                snap_inst.project(),
                &self.name,
                vol_type,
                snap_inst.name(),
            )
            .await?;

        self.emit(
            EventKind::SnapshotDeleted,
            snap_inst.project(),
            snap_inst.name(),
        )
        .await;
        Ok(())
    }

    /// Reset an instance volume to a snapshot.
    ///
    /// When the driver reports blocking snapshots (those newer than the
    /// restore target) they are deleted and the restore retried once.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name(), snapshot = %leaf))]
    pub async fn restore_instance_snapshot(&self, inst: &dyn Instance, leaf: &str) -> Result<()> {
        self.is_status_ready().await?;
        if inst.is_running().await {
            return Err(StorageError::conflict(format!(
                "Instance {:?} must be stopped before restore",
                inst.name()
            )));
        }

        let vol_type = inst.kind().volume_type();
        let (record, vol) = self.instance_volume(inst).await?;
        let snap_name = format!("{}/{leaf}", inst.name());
        let snap_record = self
            .state
            .store
            .get_volume(inst.project(), &self.name, vol_type, &snap_name)
            .await?;

        let mut retried = false;
        loop {
            match self.driver.restore_volume(&vol, leaf).await {
                Ok(()) => break,
                Err(StorageError::DeleteSnapshots { names }) if !retried => {
                    retried = true;
                    warn!(
                        blockers = ?names,
                        "Deleting snapshots blocking the restore"
                    );
                    for blocker in names {
                        self.driver
                            .delete_volume_snapshot(&vol.new_snapshot(&blocker))
                            .await?;
                        self.state
                            .store
                            .delete_volume(
                                inst.project(),
                                &self.name,
                                vol_type,
                                &format!("{}/{blocker}", inst.name()),
                            )
                            .await?;
                        self.emit(
                            EventKind::SnapshotDeleted,
                            inst.project(),
                            &format!("{}/{blocker}", inst.name()),
                        )
                        .await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // The volume's config reverts with its data.
        let mut restored = record.clone();
        restored.config = snap_record.config.clone();
        self.state.store.update_volume(restored).await?;

        let mut details = HashMap::new();
        details.insert("snapshot".to_string(), leaf.to_string());
        self.emit_with(EventKind::VolumeRestored, inst.project(), inst.name(), details)
            .await;
        Ok(())
    }

    /// Mount an instance's root volume.
    pub async fn mount_instance(&self, inst: &dyn Instance) -> Result<MountInfo> {
        self.is_status_ready().await?;
        let (_, vol) = self.instance_volume(inst).await?;
        self.driver.mount_volume(&vol).await
    }

    /// Unmount an instance's root volume.
    pub async fn unmount_instance(&self, inst: &dyn Instance) -> Result<bool> {
        let (_, vol) = self.instance_volume(inst).await?;
        self.driver.unmount_volume(&vol).await
    }

    /// Disk space accounting for an instance volume.
    pub async fn instance_usage(&self, inst: &dyn Instance) -> Result<VolumeUsage> {
        self.is_status_ready().await?;
        let (_, vol) = self.instance_volume(inst).await?;
        self.driver.volume_usage(&vol).await
    }

    /// Apply a new size to an instance's root volume.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name(), size = size))]
    pub async fn set_instance_quota(&self, inst: &dyn Instance, size: u64) -> Result<()> {
        self.is_status_ready().await?;
        let (record, vol) = self.instance_volume(inst).await?;

        self.driver.set_volume_quota(&vol, size, false).await?;

        let mut updated = record;
        updated
            .config
            .insert("size".to_string(), size.to_string());
        self.state.store.update_volume(updated).await?;
        Ok(())
    }

    /// Build the backup descriptor for an instance volume.
    pub async fn generate_instance_backup_config(
        &self,
        inst: &dyn Instance,
        with_snapshots: bool,
    ) -> Result<BackupConfig> {
        let record = self.instance_record(inst).await?;

        let mut config = BackupConfig {
            instance: Some(inst.render_info()),
            pool: Some(self.pool_record().await),
            volume: Some(record),
            ..Default::default()
        };

        if with_snapshots {
            config.snapshots = inst.snapshot_infos();
            config.volume_snapshots = self
                .instance_snapshot_records(inst)
                .await?
                .into_iter()
                .map(|mut r| {
                    // Stored under leaf names; the parent prefix is implied.
                    let leaf = parent_and_snapshot(&r.name).1.map(str::to_string);
                    if let Some(leaf) = leaf {
                        r.name = leaf;
                    }
                    r
                })
                .collect();
        }

        Ok(config)
    }

    /// Rewrite the `backup.yaml` inside an instance volume.
    ///
    /// Snapshot instances carry no backup file of their own.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name()))]
    pub async fn update_instance_backup_file(&self, inst: &dyn Instance) -> Result<()> {
        if inst.is_snapshot() {
            return Ok(());
        }
        self.is_status_ready().await?;

        let config = self.generate_instance_backup_config(inst, true).await?;
        let (_, vol) = self.instance_volume(inst).await?;

        self.driver.mount_volume(&vol).await?;
        let written = write_backup_file(&vol.mount_path(), &config).await;
        if let Err(e) = self.driver.unmount_volume(&vol).await {
            warn!(error = %e, "Failed unmounting volume after backup file update");
        }
        written
    }

    /// Reconcile a backup descriptor's snapshot list with the snapshots
    /// physically present on the volume.
    ///
    /// With `delete_missing` the records and physical snapshots without a
    /// counterpart are pruned; otherwise any difference is an error. Returns
    /// the leaves present on both sides.
    #[instrument(skip_all, fields(pool = %self.name, project = %project))]
    pub async fn check_instance_backup_file_snapshots(
        &self,
        backup_config: &BackupConfig,
        project: &str,
        delete_missing: bool,
    ) -> Result<Vec<String>> {
        self.is_status_ready().await?;
        let info = backup_config.instance.as_ref().ok_or_else(|| {
            StorageError::Validation("Backup descriptor has no instance section".to_string())
        })?;

        let vol_type = info.kind.volume_type();
        let storage = paths::storage_name(vol_type, project, &info.name);
        let vol = self.volume_handle(
            vol_type,
            info.kind.content_type(),
            &storage,
            backup_config
                .volume
                .as_ref()
                .map(|v| v.config.clone())
                .unwrap_or_default(),
        );

        let present = self.driver.volume_snapshots(&vol).await?;
        let expected = backup_config.snapshot_names();

        let mut surviving = Vec::new();
        for leaf in &expected {
            if present.iter().any(|p| p == leaf) {
                surviving.push(leaf.clone());
                continue;
            }
            if !delete_missing {
                return Err(StorageError::BackupSnapshotMismatch(format!(
                    "Snapshot {leaf:?} exists in the descriptor but not on storage"
                )));
            }
            let record_name = format!("{}/{leaf}", info.name);
            match self
                .state
                .store
                .delete_volume(project, &self.name, vol_type, &record_name)
                .await
            {
                Ok(()) => {
                    debug!(snapshot = %record_name, "Pruned record for missing snapshot")
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        for leaf in &present {
            if expected.iter().any(|e| e == leaf) {
                continue;
            }
            if !delete_missing {
                return Err(StorageError::BackupSnapshotMismatch(format!(
                    "Snapshot {leaf:?} exists on storage but not in the descriptor"
                )));
            }
            debug!(snapshot = %leaf, "Deleting snapshot absent from the descriptor");
            self.driver
                .delete_volume_snapshot(&vol.new_snapshot(leaf))
                .await?;
        }

        Ok(surviving)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EngineState;
    use crate::instance::InstanceKind;
    use crate::mock::{MockDriver, MockInstance};
    use crate::records::PoolRecord;
    use crate::types::PoolStatus;
    use std::time::Duration;

    async fn backend_with(name: &str) -> (Arc<EngineState>, MockDriver, Arc<Backend>) {
        let state = EngineState::builder()
            .var_dir(std::env::temp_dir().join(format!("volantix-{}", uuid::Uuid::new_v4())))
            .build();
        let driver = MockDriver::new();
        let pool = PoolRecord {
            name: name.to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: HashMap::new(),
            status: PoolStatus::Pending,
        };
        let backend = Arc::new(Backend::new(pool, driver.clone(), state.clone()));
        backend.create().await.unwrap();
        (state, driver, backend)
    }

    fn container(name: &str) -> MockInstance {
        MockInstance::new("default", name, InstanceKind::Container)
    }

    #[tokio::test]
    async fn test_create_instance_records_volume_and_symlink() {
        let (state, driver, backend) = backend_with("p1").await;
        let inst = container("c1");

        backend.create_instance(&inst, HashMap::new()).await.unwrap();

        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1")
            .await
            .is_ok());
        assert!(driver.volume_names().await.contains(&"c1".to_string()));

        let link = paths::instance_symlink_path(
            &state.var_dir,
            VolumeType::Container,
            "default",
            "c1",
        );
        assert!(tokio::fs::symlink_metadata(&link).await.is_ok());

        let err = backend
            .create_instance(&inst, HashMap::new())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_create_instance_failure_reverts_everything() {
        let (state, driver, backend) = backend_with("p1").await;
        driver.fail_once("create_volume").await;
        let inst = container("c1");

        assert!(backend.create_instance(&inst, HashMap::new()).await.is_err());

        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(driver.volume_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_copy_same_pool_uses_single_driver_copy() {
        let (state, driver, backend) = backend_with("p1").await;
        let src = container("c1").running(true);
        backend.create_instance(&src, HashMap::new()).await.unwrap();
        backend
            .create_instance_snapshot(&container("c1/s1").snapshot(), &src)
            .await
            .unwrap();
        backend
            .create_instance_snapshot(&container("c1/s2").snapshot(), &src)
            .await
            .unwrap();

        let dst = container("c2");
        backend
            .create_instance_from_copy(&dst, &src, &backend, false, false)
            .await
            .unwrap();

        assert_eq!(driver.call_count("create_volume_from_copy").await, 1);
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c2")
            .await
            .is_ok());
        let snaps = state
            .store
            .list_snapshots("default", "p1", VolumeType::Container, "c2")
            .await
            .unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(
            driver.snapshot_leaves(VolumeType::Container, "c2").await,
            vec!["s1".to_string(), "s2".to_string()]
        );

        // The running source was frozen for the copy and thawed after.
        assert_eq!(src.freeze_count(), 3);
        assert_eq!(src.unfreeze_count(), 3);
        assert!(!src.is_frozen().await);
    }

    #[tokio::test]
    async fn test_copy_failure_rolls_back_records() {
        let (state, driver, backend) = backend_with("p1").await;
        let src = container("c1");
        backend.create_instance(&src, HashMap::new()).await.unwrap();
        backend
            .create_instance_snapshot(&container("c1/s1").snapshot(), &src)
            .await
            .unwrap();

        driver.fail_once("create_volume_from_copy").await;
        let dst = container("c2");
        assert!(backend
            .create_instance_from_copy(&dst, &src, &backend, false, false)
            .await
            .is_err());

        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c2")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(state
            .store
            .list_snapshots("default", "p1", VolumeType::Container, "c2")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_copy_across_pools_transfers_volume() {
        let (state, _driver1, backend1) = backend_with("p1").await;
        let driver2 = MockDriver::new();
        let pool2 = PoolRecord {
            name: "p2".to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: HashMap::new(),
            status: PoolStatus::Pending,
        };
        let backend2 = Arc::new(Backend::new(pool2, driver2.clone(), state.clone()));
        backend2.create().await.unwrap();

        let src = container("c1");
        backend1.create_instance(&src, HashMap::new()).await.unwrap();
        backend1
            .create_instance_snapshot(&container("c1/s1").snapshot(), &src)
            .await
            .unwrap();

        let dst = container("c1");
        backend2
            .create_instance_from_copy(&dst, &src, &backend1, false, false)
            .await
            .unwrap();

        assert!(driver2.volume_names().await.contains(&"c1".to_string()));
        assert_eq!(
            driver2.snapshot_leaves(VolumeType::Container, "c1").await,
            vec!["s1".to_string()]
        );
        assert!(state
            .store
            .get_volume("default", "p2", VolumeType::Container, "c1")
            .await
            .is_ok());
        assert_eq!(driver2.call_count("create_volume_from_migration").await, 1);
    }

    #[tokio::test]
    async fn test_transfer_failure_aborts_peer_quickly() {
        let (state, driver1, backend1) = backend_with("p1").await;
        let driver2 = MockDriver::new();
        let pool2 = PoolRecord {
            name: "p2".to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: HashMap::new(),
            status: PoolStatus::Pending,
        };
        let backend2 = Arc::new(Backend::new(pool2, driver2.clone(), state.clone()));
        backend2.create().await.unwrap();

        let src = container("c1");
        backend1.create_instance(&src, HashMap::new()).await.unwrap();

        driver1.fail_once("migrate_volume").await;
        driver2.hold_transfers().await;

        let dst = container("c1");
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            backend2.create_instance_from_copy(&dst, &src, &backend1, true, false),
        )
        .await
        .expect("transfer failure must unwind, not hang");
        assert!(outcome.is_err());

        assert!(state
            .store
            .get_volume("default", "p2", VolumeType::Container, "c1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_refresh_drops_target_only_snapshots() {
        let (state, _driver1, backend1) = backend_with("p1").await;
        let driver2 = MockDriver::new();
        let pool2 = PoolRecord {
            name: "p2".to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: HashMap::new(),
            status: PoolStatus::Pending,
        };
        let backend2 = Arc::new(Backend::new(pool2, driver2.clone(), state.clone()));
        backend2.create().await.unwrap();

        let src = container("c1");
        backend1.create_instance(&src, HashMap::new()).await.unwrap();
        backend1
            .create_instance_snapshot(&container("c1/common").snapshot(), &src)
            .await
            .unwrap();

        // Target starts as a full copy, then grows a snapshot of its own.
        let dst = container("c1");
        backend2
            .create_instance_from_copy(&dst, &src, &backend1, false, false)
            .await
            .unwrap();
        backend2
            .create_instance_snapshot(&container("c1/local-only").snapshot(), &dst)
            .await
            .unwrap();

        backend2
            .refresh_instance(&dst, &src, &backend1, false, false)
            .await
            .unwrap();

        let leaves = driver2.snapshot_leaves(VolumeType::Container, "c1").await;
        assert!(leaves.contains(&"common".to_string()));
        assert!(!leaves.contains(&"local-only".to_string()));
        assert!(state
            .store
            .get_volume("default", "p2", VolumeType::Container, "c1/local-only")
            .await
            .unwrap_err()
            .is_not_found());

        // A second refresh has nothing left to reconcile.
        backend2
            .refresh_instance(&dst, &src, &backend1, false, false)
            .await
            .unwrap();
        let snaps = state
            .store
            .list_snapshots("default", "p2", VolumeType::Container, "c1")
            .await
            .unwrap();
        assert_eq!(snaps.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_moves_records_snapshots_and_storage() {
        let (state, driver, backend) = backend_with("p1").await;
        let inst = container("c1");
        backend.create_instance(&inst, HashMap::new()).await.unwrap();
        backend
            .create_instance_snapshot(&container("c1/s1").snapshot(), &inst)
            .await
            .unwrap();

        backend.rename_instance(&inst, "c2").await.unwrap();

        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c2/s1")
            .await
            .is_ok());
        assert!(driver.volume_names().await.contains(&"c2".to_string()));
    }

    #[tokio::test]
    async fn test_rename_failure_restores_records() {
        let (state, driver, backend) = backend_with("p1").await;
        let inst = container("c1");
        backend.create_instance(&inst, HashMap::new()).await.unwrap();
        backend
            .create_instance_snapshot(&container("c1/s1").snapshot(), &inst)
            .await
            .unwrap();

        driver.fail_once("rename_volume").await;
        assert!(backend.rename_instance(&inst, "c2").await.is_err());

        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1")
            .await
            .is_ok());
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1/s1")
            .await
            .is_ok());
        assert!(driver.volume_names().await.contains(&"c1".to_string()));
    }

    #[tokio::test]
    async fn test_delete_refused_while_snapshots_exist() {
        let (state, driver, backend) = backend_with("p1").await;
        let inst = container("c1");
        backend.create_instance(&inst, HashMap::new()).await.unwrap();
        backend
            .create_instance_snapshot(&container("c1/s1").snapshot(), &inst)
            .await
            .unwrap();

        let err = backend.delete_instance(&inst).await.unwrap_err();
        assert!(err.is_conflict());

        backend
            .delete_instance_snapshot(&container("c1/s1").snapshot())
            .await
            .unwrap();
        backend.delete_instance(&inst).await.unwrap();

        assert!(driver.volume_names().await.is_empty());
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_snapshot_creation_is_serialized() {
        let (_state, driver, backend) = backend_with("p1").await;
        let inst = Arc::new(container("c1"));
        backend
            .create_instance(inst.as_ref(), HashMap::new())
            .await
            .unwrap();

        driver.set_op_delay(Duration::from_millis(25)).await;
        let b1 = backend.clone();
        let b2 = backend.clone();
        let i1 = inst.clone();
        let i2 = inst.clone();
        let (r1, r2) = tokio::join!(
            async move {
                b1.create_instance_snapshot(&container("c1/s1").snapshot(), i1.as_ref())
                    .await
            },
            async move {
                b2.create_instance_snapshot(&container("c1/s2").snapshot(), i2.as_ref())
                    .await
            },
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(driver.max_in_flight().await, 1);
        assert_eq!(
            driver
                .snapshot_leaves(VolumeType::Container, "c1")
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_restore_refused_while_running() {
        let (_state, _driver, backend) = backend_with("p1").await;
        let inst = container("c1").running(true);
        backend.create_instance(&inst, HashMap::new()).await.unwrap();

        let err = backend
            .restore_instance_snapshot(&inst, "s1")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_restore_deletes_blockers_then_retries_once() {
        let (state, driver, backend) = backend_with("p1").await;
        let inst = container("c1");
        backend.create_instance(&inst, HashMap::new()).await.unwrap();
        backend
            .create_instance_snapshot(&container("c1/s1").snapshot(), &inst)
            .await
            .unwrap();
        backend
            .create_instance_snapshot(&container("c1/s2").snapshot(), &inst)
            .await
            .unwrap();

        driver.set_restore_blockers(&["s2"]).await;
        backend.restore_instance_snapshot(&inst, "s1").await.unwrap();

        assert_eq!(driver.call_count("restore_volume").await, 2);
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1/s2")
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(
            driver.snapshot_leaves(VolumeType::Container, "c1").await,
            vec!["s1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_update_rejects_size_changes() {
        let (_state, _driver, backend) = backend_with("p1").await;
        let inst = container("c1");
        backend.create_instance(&inst, HashMap::new()).await.unwrap();

        let mut new_config = HashMap::new();
        new_config.insert("size".to_string(), "20GiB".to_string());
        let err = backend
            .update_instance(&inst, "", new_config)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_migration_pair_over_pipes() {
        let (state, _driver1, backend1) = backend_with("p1").await;
        let driver2 = MockDriver::new();
        let pool2 = PoolRecord {
            name: "p2".to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: HashMap::new(),
            status: PoolStatus::Pending,
        };
        let backend2 = Arc::new(Backend::new(pool2, driver2.clone(), state.clone()));
        backend2.create().await.unwrap();

        let src = container("c1").with_snapshot("s1");
        backend1.create_instance(&src, HashMap::new()).await.unwrap();
        backend1
            .create_instance_snapshot(&container("c1/s1").snapshot(), &src)
            .await
            .unwrap();

        let (mut header_a, mut header_b) = migration::pipe_pair(migration::DEFAULT_PIPE_CAPACITY);
        let (mut data_a, mut data_b) = migration::pipe_pair(migration::DEFAULT_PIPE_CAPACITY);

        let mut source_args = VolumeSourceArgs {
            index_header_version: migration::INDEX_HEADER_VERSION,
            name: "c1".to_string(),
            snapshots: vec!["s1".to_string()],
            migration_type: migration::fallback_migration_type(ContentType::Filesystem),
            volume_only: false,
            refresh: false,
            allow_inconsistent: false,
            cluster_move: false,
        };
        let target_args = VolumeTargetArgs {
            index_header_version: migration::INDEX_HEADER_VERSION,
            name: "c1".to_string(),
            description: String::new(),
            config: HashMap::new(),
            snapshots: Vec::new(),
            migration_type: migration::fallback_migration_type(ContentType::Filesystem),
            refresh: false,
            volume_size: None,
            volume_only: false,
            cluster_move: false,
        };

        let dst = container("c1");
        let (sent, received) = tokio::join!(
            backend1.migrate_instance(&src, &mut header_a, &mut data_a, &mut source_args),
            backend2.create_instance_from_migration(&dst, &mut header_b, &mut data_b, target_args),
        );
        sent.unwrap();
        received.unwrap();

        assert!(state
            .store
            .get_volume("default", "p2", VolumeType::Container, "c1")
            .await
            .is_ok());
        assert!(state
            .store
            .get_volume("default", "p2", VolumeType::Container, "c1/s1")
            .await
            .is_ok());
        assert_eq!(
            driver2.snapshot_leaves(VolumeType::Container, "c1").await,
            vec!["s1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_backup_file_snapshot_reconciliation() {
        let (state, driver, backend) = backend_with("p1").await;
        let inst = container("c1").with_snapshot("s1").with_snapshot("s2");
        backend.create_instance(&inst, HashMap::new()).await.unwrap();
        backend
            .create_instance_snapshot(&container("c1/s1").snapshot(), &inst)
            .await
            .unwrap();
        backend
            .create_instance_snapshot(&container("c1/s2").snapshot(), &inst)
            .await
            .unwrap();

        let descriptor = backend
            .generate_instance_backup_config(&inst, true)
            .await
            .unwrap();

        // Lose one snapshot behind the engine's back.
        driver
            .seed_volume(
                VolumeType::Container,
                ContentType::Filesystem,
                "c1",
                &["s1"],
            )
            .await;

        let err = backend
            .check_instance_backup_file_snapshots(&descriptor, "default", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BackupSnapshotMismatch(_)));

        let surviving = backend
            .check_instance_backup_file_snapshots(&descriptor, "default", true)
            .await
            .unwrap();
        assert_eq!(surviving, vec!["s1".to_string()]);
        assert!(state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1/s2")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_quota_updates_record() {
        let (state, _driver, backend) = backend_with("p1").await;
        let inst = container("c1");
        backend.create_instance(&inst, HashMap::new()).await.unwrap();

        backend.set_instance_quota(&inst, 4 << 30).await.unwrap();

        let record = state
            .store
            .get_volume("default", "p1", VolumeType::Container, "c1")
            .await
            .unwrap();
        assert_eq!(
            record.config.get("size"),
            Some(&(4u64 << 30).to_string())
        );
    }
}
