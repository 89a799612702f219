//! Reconstruction of lost records from on-disk state.
//!
//! After a database loss the pool's physical inventory is the only truth
//! left. The scanner walks the driver's raw volume listing and reports every
//! volume no record knows about, as an importable descriptor: instance
//! volumes carry their own `backup.yaml` and are validated against it, while
//! custom volumes and buckets get a descriptor synthesized from the pool's
//! current defaults. Inconsistencies are reported, never repaired in place.

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::backup::{read_backup_file, BackupConfig};
use crate::drivers::Volume;
use crate::error::{Result, StorageError};
use crate::instance::Instance;
use crate::paths;
use crate::records::{BucketRecord, VolumeRecord};
use crate::rollback::Rollback;
use crate::types::{ContentType, VolumeType};

use super::Backend;

impl Backend {
    /// Walk the driver's volume inventory and report volumes without
    /// records.
    ///
    /// `known_instances` lists the (project, name) pairs of instances the
    /// caller still knows about; an instance volume is only unknown when
    /// neither the instance nor its volume record exists. A volume known on
    /// one side but not the other is an inconsistency and fails the scan.
    #[instrument(skip_all, fields(pool = %self.name))]
    pub async fn list_unknown_volumes(
        &self,
        known_instances: &[(String, String)],
    ) -> Result<Vec<BackupConfig>> {
        self.is_status_ready().await?;
        let pool = self.pool_record().await;

        let mut unknown = Vec::new();
        for listed in self.driver.list_volumes(&pool).await? {
            if listed.is_snapshot() {
                continue;
            }

            let found = match listed.volume_type() {
                VolumeType::Container | VolumeType::VirtualMachine => {
                    if listed.volume_type() == VolumeType::VirtualMachine
                        && listed.content_type() == ContentType::Filesystem
                    {
                        return Err(StorageError::Internal(format!(
                            "Virtual machine volume {:?} reported with filesystem content",
                            listed.name()
                        )));
                    }
                    self.detect_unknown_instance_volume(&listed, known_instances)
                        .await?
                }
                VolumeType::Custom => self.detect_unknown_custom_volume(&listed).await?,
                VolumeType::Bucket => self.detect_unknown_bucket(&listed).await?,
                // Cached image volumes are not worth importing; the next
                // image unpack deletes strays and rebuilds the cache.
                VolumeType::Image => None,
            };

            if let Some(config) = found {
                debug!(volume = %listed.name(), "Found volume without records");
                unknown.push(config);
            }
        }

        Ok(unknown)
    }

    async fn detect_unknown_instance_volume(
        &self,
        listed: &Volume,
        known_instances: &[(String, String)],
    ) -> Result<Option<BackupConfig>> {
        let (project, name) = paths::instance_storage_name_parts(listed.name());
        let instance_known = known_instances
            .iter()
            .any(|(p, n)| *p == project && *n == name);
        let record_exists = self
            .state
            .store
            .volume_exists(&project, &self.name, listed.volume_type(), &name)
            .await?;

        if instance_known && record_exists {
            return Ok(None);
        }
        if instance_known != record_exists {
            return Err(StorageError::Internal(format!(
                "Instance {name:?} in project {project:?} is inconsistent: \
                 instance known: {instance_known}, volume record: {record_exists}"
            )));
        }

        // Neither side knows the volume. The backup file inside it is the
        // only remaining description.
        let vol = self.volume_handle(
            listed.volume_type(),
            listed.content_type(),
            listed.name(),
            listed.config().clone(),
        );
        self.driver.mount_volume(&vol).await?;
        let parsed = read_backup_file(&vol.mount_path()).await;
        if let Err(e) = self.driver.unmount_volume(&vol).await {
            warn!(volume = %vol.name(), error = %e, "Failed unmounting volume after descriptor read");
        }
        let config = parsed?;

        self.validate_recovered_descriptor(&config, listed, &project, &name)
            .await?;
        Ok(Some(config))
    }

    /// Cross-check a recovered descriptor against the pool and the volume it
    /// was found on.
    async fn validate_recovered_descriptor(
        &self,
        config: &BackupConfig,
        listed: &Volume,
        project: &str,
        name: &str,
    ) -> Result<()> {
        let pool = self.pool_record().await;
        if let Some(descriptor_pool) = &config.pool {
            if descriptor_pool.name != pool.name {
                return Err(StorageError::Validation(format!(
                    "Descriptor of {name:?} names pool {:?} but the volume is on {:?}",
                    descriptor_pool.name, pool.name
                )));
            }
            if descriptor_pool.driver != pool.driver {
                return Err(StorageError::Validation(format!(
                    "Descriptor of {name:?} names driver {:?} but the pool runs {:?}",
                    descriptor_pool.driver, pool.driver
                )));
            }
        }

        let info = config.instance.as_ref().ok_or_else(|| {
            StorageError::Validation(format!("Descriptor of {name:?} has no instance section"))
        })?;
        if info.name != name {
            return Err(StorageError::Validation(format!(
                "Descriptor names instance {:?} but the volume belongs to {name:?}",
                info.name
            )));
        }
        if info.kind.volume_type() != listed.volume_type() {
            return Err(StorageError::Validation(format!(
                "Descriptor of {name:?} declares a {} but the volume type is {}",
                info.kind,
                listed.volume_type()
            )));
        }

        let volume = config.volume.as_ref().ok_or_else(|| {
            StorageError::Validation(format!("Descriptor of {name:?} has no volume section"))
        })?;
        if volume.name != name || volume.project != project {
            return Err(StorageError::Validation(format!(
                "Descriptor volume record names {:?} in project {:?}, expected {name:?} in {project:?}",
                volume.name, volume.project
            )));
        }
        if volume.vol_type != listed.volume_type()
            || volume.content_type != listed.content_type()
        {
            return Err(StorageError::Validation(format!(
                "Descriptor volume record of {name:?} declares {}/{}, found {}/{}",
                volume.vol_type,
                volume.content_type,
                listed.volume_type(),
                listed.content_type()
            )));
        }

        config.check_snapshot_consistency()?;
        self.check_instance_backup_file_snapshots(config, project, false)
            .await?;

        for leaf in config.snapshot_names() {
            let snap_name = format!("{name}/{leaf}");
            if self
                .state
                .store
                .volume_exists(project, &self.name, listed.volume_type(), &snap_name)
                .await?
            {
                return Err(StorageError::conflict(format!(
                    "Snapshot record {snap_name:?} already exists"
                )));
            }
        }

        Ok(())
    }

    /// Synthesize a descriptor for a record-less custom volume.
    ///
    /// Nothing on the volume says how it was configured; the pool's current
    /// defaults stand in. Snapshot entries assume the parent's config.
    async fn detect_unknown_custom_volume(&self, listed: &Volume) -> Result<Option<BackupConfig>> {
        let (project, name) = paths::volume_storage_name_parts(listed.name());
        if self
            .state
            .store
            .volume_exists(&project, &self.name, VolumeType::Custom, &name)
            .await?
        {
            return Ok(None);
        }

        let vol = self
            .prepare_volume(
                VolumeType::Custom,
                listed.content_type(),
                listed.name(),
                listed.config().clone(),
            )
            .await?;
        let record = VolumeRecord::new(
            &project,
            &self.name,
            &name,
            VolumeType::Custom,
            listed.content_type(),
            vol.config().clone(),
        );

        let mut volume_snapshots = Vec::new();
        for leaf in self.driver.volume_snapshots(&vol).await? {
            volume_snapshots.push(VolumeRecord::new(
                &project,
                &self.name,
                &leaf,
                VolumeType::Custom,
                listed.content_type(),
                record.config.clone(),
            ));
        }

        Ok(Some(BackupConfig {
            pool: Some(self.pool_record().await),
            volume: Some(record),
            volume_snapshots,
            ..Default::default()
        }))
    }

    async fn detect_unknown_bucket(&self, listed: &Volume) -> Result<Option<BackupConfig>> {
        let (project, name) = paths::volume_storage_name_parts(listed.name());
        match self.state.store.get_bucket(&project, &self.name, &name).await {
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => {
                let record = BucketRecord {
                    project,
                    pool: self.name.clone(),
                    name,
                    description: String::new(),
                    config: listed.config().clone(),
                    created_at: Utc::now(),
                };
                Ok(Some(BackupConfig {
                    bucket: Some(record),
                    ..Default::default()
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Recreate the records and daemon links for an instance volume found by
    /// the scan.
    ///
    /// The returned rollback undoes the import; the caller disarms it once
    /// its own follow-up steps are through. The local mount state is brought
    /// in line with the instance: mounted when running, unmounted otherwise.
    #[instrument(skip_all, fields(pool = %self.name, project = %inst.project(), instance = %inst.name()))]
    pub async fn import_instance(
        &self,
        inst: &dyn Instance,
        config: &BackupConfig,
        running: bool,
    ) -> Result<Rollback> {
        self.is_status_ready().await?;
        let vol_type = inst.kind().volume_type();
        let content_type = inst.kind().content_type();

        let volume = config.volume.as_ref().ok_or_else(|| {
            StorageError::Validation("Backup descriptor has no volume section".to_string())
        })?;

        // Descriptor snapshot rows are leaf-named. Older descriptors carry
        // no volume snapshot records at all; the instance snapshot list with
        // the parent's config stands in.
        let src_snapshots: Vec<VolumeRecord> = if config.volume_snapshots.is_empty() {
            config
                .snapshots
                .iter()
                .map(|s| {
                    let mut row = VolumeRecord::new(
                        inst.project(),
                        &self.name,
                        &format!("{}/{}", inst.name(), s.name),
                        vol_type,
                        content_type,
                        volume.config.clone(),
                    );
                    row.created_at = s.created_at;
                    row
                })
                .collect()
        } else {
            config
                .volume_snapshots
                .iter()
                .map(|s| {
                    let mut adapted = s.clone();
                    adapted.name = format!("{}/{}", inst.name(), s.name);
                    adapted
                })
                .collect()
        };
        let has_snapshots = !src_snapshots.is_empty();

        let (parent, snap_records) = self.adapt_records(
            inst.project(),
            inst.name(),
            vol_type,
            content_type,
            volume.config.clone(),
            &src_snapshots,
            false,
        );
        let vol = self.instance_handle(inst, parent.config.clone());

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.stage_volume_records(&mut rollback, Some(parent), snap_records)
                .await?;

            self.stage_instance_symlink(&mut rollback, inst, &vol).await?;
            if has_snapshots {
                self.stage_snapshots_symlink(&mut rollback, inst).await?;
            }

            if running {
                self.driver.mount_volume(&vol).await?;
            } else if let Err(e) = self.driver.unmount_volume(&vol).await {
                warn!(volume = %vol.name(), error = %e, "Failed unmounting imported volume");
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        Ok(rollback)
    }
}
