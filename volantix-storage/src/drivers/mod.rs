//! Storage driver abstraction.
//!
//! A [`Driver`] turns the engine's intent into operations on one concrete
//! storage backend. Drivers act on [`Volume`] handles and never touch
//! records, symlinks or locks; that sequencing belongs to the engine.
//!
//! ```text
//!                 +--------------------+
//!     Backend --> |    dyn Driver      | --> pool storage
//!                 |  dir / mock / ...  |
//!                 +--------------------+
//! ```
//!
//! Bucket hooks only apply to drivers whose storage is shared between
//! cluster members; member-local drivers keep the default unsupported
//! implementations and the engine drives the object gateway instead.

pub mod clones;
pub mod dir;
mod volume;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::backup::BackupInfo;
use crate::error::{Result, StorageError};
use crate::migration::{MigrationConn, MigrationType, VolumeSourceArgs, VolumeTargetArgs};
use crate::records::{BucketKeyRecord, BucketRecord, PoolRecord};
use crate::types::{ContentType, DriverInfo, MountInfo, PoolUsage, VolumeUsage};

pub use volume::Volume;

/// Populates a freshly created volume with initial content.
#[async_trait]
pub trait VolumeFiller: Send + Sync {
    /// Image fingerprint when the content comes from an image.
    fn fingerprint(&self) -> Option<&str> {
        None
    }

    /// Write the content into the volume, returning the number of bytes
    /// placed. `root` is the mounted directory for filesystem volumes and
    /// the backing disk file for block and ISO volumes.
    async fn fill(&self, vol: &Volume, root: &std::path::Path) -> Result<u64>;
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn info(&self) -> DriverInfo;

    /// Extra config keys this driver accepts on pools and volumes.
    fn config_keys(&self) -> Vec<String> {
        Vec::new()
    }

    // Pool lifecycle.

    async fn validate_pool(&self, config: &HashMap<String, String>) -> Result<()>;

    async fn create_pool(&self, pool: &PoolRecord) -> Result<()>;

    async fn delete_pool(&self, pool: &PoolRecord) -> Result<()>;

    async fn update_pool(
        &self,
        pool: &PoolRecord,
        changed: &HashMap<String, String>,
    ) -> Result<()> {
        let _ = (pool, changed);
        Ok(())
    }

    /// Returns true when the pool was newly mounted.
    async fn mount_pool(&self, pool: &PoolRecord) -> Result<bool>;

    /// Returns true when the pool was mounted and is now unmounted.
    async fn unmount_pool(&self, pool: &PoolRecord) -> Result<bool>;

    async fn pool_usage(&self, pool: &PoolRecord) -> Result<PoolUsage>;

    // Volume config hooks.

    async fn validate_volume(&self, vol: &Volume) -> Result<()>;

    /// Apply driver-specific defaults to a volume config.
    fn fill_volume_config(&self, vol: &mut Volume) -> Result<()> {
        let _ = vol;
        Ok(())
    }

    // Volume lifecycle.

    async fn create_volume(&self, vol: &Volume, filler: Option<&dyn VolumeFiller>)
        -> Result<()>;

    /// Copy `src` into a new volume, including the named snapshots
    /// (oldest first).
    async fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src: &Volume,
        snapshots: &[String],
    ) -> Result<()>;

    /// Bring an existing volume up to date with `src`, transferring the
    /// named snapshots (oldest first).
    async fn refresh_volume(
        &self,
        vol: &Volume,
        src: &Volume,
        snapshots: &[String],
    ) -> Result<()>;

    async fn delete_volume(&self, vol: &Volume) -> Result<()>;

    async fn has_volume(&self, vol: &Volume) -> Result<bool>;

    async fn rename_volume(&self, vol: &Volume, new_name: &str) -> Result<()>;

    /// Apply changed config keys to an existing volume.
    async fn update_volume(
        &self,
        vol: &Volume,
        changed: &HashMap<String, String>,
    ) -> Result<()>;

    /// Resize a volume. Shrinking a filesystem that cannot shrink must fail
    /// with [`StorageError::CannotBeShrunk`]. `allow_unsafe_resize` skips
    /// safety checks during image unpacking.
    async fn set_volume_quota(
        &self,
        vol: &Volume,
        size: u64,
        allow_unsafe_resize: bool,
    ) -> Result<()>;

    async fn volume_usage(&self, vol: &Volume) -> Result<VolumeUsage>;

    /// Path of the block device backing the volume, for block content.
    async fn volume_disk_path(&self, vol: &Volume) -> Result<PathBuf>;

    async fn mount_volume(&self, vol: &Volume) -> Result<MountInfo>;

    /// Returns true when the volume was mounted and is now unmounted.
    async fn unmount_volume(&self, vol: &Volume) -> Result<bool>;

    /// All volumes physically present on the pool, regardless of records.
    async fn list_volumes(&self, pool: &PoolRecord) -> Result<Vec<Volume>>;

    // Snapshots.

    async fn create_volume_snapshot(&self, snap: &Volume) -> Result<()>;

    async fn delete_volume_snapshot(&self, snap: &Volume) -> Result<()>;

    async fn rename_volume_snapshot(&self, snap: &Volume, new_leaf: &str) -> Result<()>;

    /// Reset a volume to the state captured by the named snapshot.
    ///
    /// Drivers that cannot restore across newer snapshots fail with
    /// [`StorageError::DeleteSnapshots`] listing the blockers.
    async fn restore_volume(&self, vol: &Volume, snapshot: &str) -> Result<()>;

    /// Leaf names of snapshots physically present, sorted by name.
    ///
    /// Age order lives in the volume records; drivers only see leaf
    /// names and cannot recover creation times from them.
    async fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>>;

    // Migration.

    /// Transfer types this driver offers, in preference order.
    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        copy_snapshots: bool,
        cluster_move: bool,
    ) -> Vec<MigrationType>;

    /// Send a volume through the connection (source side).
    async fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut MigrationConn,
        args: &VolumeSourceArgs,
    ) -> Result<()>;

    /// Receive a volume from the connection (target side).
    async fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut MigrationConn,
        args: &VolumeTargetArgs,
    ) -> Result<()>;

    // Backup.

    /// Export the volume (and the named snapshots, oldest first) into the
    /// sink.
    async fn backup_volume(
        &self,
        vol: &Volume,
        target: &mut (dyn AsyncWrite + Send + Unpin),
        snapshots: &[String],
    ) -> Result<()>;

    /// Recreate a volume from an exported archive. Returns true when the
    /// driver requires post-import processing of the restored volume.
    async fn create_volume_from_backup(
        &self,
        vol: &Volume,
        source: &mut (dyn AsyncRead + Send + Unpin),
        info: &BackupInfo,
    ) -> Result<bool>;

    // Buckets, for drivers with shared storage.

    async fn validate_bucket(&self, bucket: &BucketRecord) -> Result<()> {
        let _ = bucket;
        Ok(())
    }

    async fn validate_bucket_key(&self, key: &BucketKeyRecord) -> Result<()> {
        if !["admin", "read-only"].contains(&key.role.as_str()) {
            return Err(StorageError::Validation(format!(
                "Invalid bucket key role {:?}",
                key.role
            )));
        }
        Ok(())
    }

    async fn create_bucket(&self, bucket: &BucketRecord) -> Result<()> {
        let _ = bucket;
        Err(StorageError::NotSupported(format!(
            "Driver {:?} does not manage buckets directly",
            self.info().name
        )))
    }

    async fn delete_bucket(&self, bucket: &BucketRecord) -> Result<()> {
        let _ = bucket;
        Err(StorageError::NotSupported(format!(
            "Driver {:?} does not manage buckets directly",
            self.info().name
        )))
    }

    async fn create_bucket_key(&self, key: &BucketKeyRecord) -> Result<()> {
        let _ = key;
        Err(StorageError::NotSupported(format!(
            "Driver {:?} does not manage bucket keys directly",
            self.info().name
        )))
    }

    async fn update_bucket_key(&self, key: &BucketKeyRecord) -> Result<()> {
        let _ = key;
        Err(StorageError::NotSupported(format!(
            "Driver {:?} does not manage bucket keys directly",
            self.info().name
        )))
    }

    async fn delete_bucket_key(&self, key: &BucketKeyRecord) -> Result<()> {
        let _ = key;
        Err(StorageError::NotSupported(format!(
            "Driver {:?} does not manage bucket keys directly",
            self.info().name
        )))
    }
}
