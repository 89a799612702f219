//! Filesystem layout and symlink presentation.
//!
//! Volumes live under the pool's private tree:
//! `<var>/storage-pools/<pool>/<type-dir>/<storage-name>`. Instances are made
//! visible at stable daemon paths (`<var>/containers/<storage-name>`, ...)
//! through symlinks into the pool tree.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Result, StorageError};
use crate::types::{parent_and_snapshot, VolumeType};

/// Project whose entities carry no storage-name prefix.
pub const DEFAULT_PROJECT: &str = "default";

/// Name of the backup descriptor file inside an instance volume.
pub const BACKUP_FILE_NAME: &str = "backup.yaml";

/// Storage-level name of an instance volume.
///
/// Instances in the default project keep their bare name; other projects are
/// prefixed. Snapshot suffixes are preserved.
pub fn instance_storage_name(project: &str, name: &str) -> String {
    if project == DEFAULT_PROJECT {
        return name.to_string();
    }

    format!("{project}_{name}")
}

/// Storage-level name of a custom volume or bucket. Always project-prefixed.
pub fn volume_storage_name(project: &str, name: &str) -> String {
    format!("{project}_{name}")
}

/// Split a storage-level instance name back into (project, name).
pub fn instance_storage_name_parts(storage_name: &str) -> (String, String) {
    match storage_name.split_once('_') {
        Some((project, name)) => (project.to_string(), name.to_string()),
        None => (DEFAULT_PROJECT.to_string(), storage_name.to_string()),
    }
}

/// Split a storage-level custom volume or bucket name back into
/// (project, name).
pub fn volume_storage_name_parts(storage_name: &str) -> (String, String) {
    instance_storage_name_parts(storage_name)
}

/// Mount path of a whole pool.
pub fn pool_mount_path(var_dir: &Path, pool: &str) -> PathBuf {
    var_dir.join("storage-pools").join(pool)
}

fn snapshots_directory(vol_type: VolumeType) -> String {
    format!("{}-snapshots", vol_type.directory())
}

/// Mount path of a volume inside the pool tree.
///
/// Snapshot volumes land under the type's `-snapshots` directory, keyed by
/// the parent's storage name with the snapshot as a child directory.
pub fn volume_mount_path(
    var_dir: &Path,
    pool: &str,
    vol_type: VolumeType,
    storage_name: &str,
) -> PathBuf {
    let pool_path = pool_mount_path(var_dir, pool);
    match parent_and_snapshot(storage_name) {
        (parent, Some(snapshot)) => pool_path
            .join(snapshots_directory(vol_type))
            .join(parent)
            .join(snapshot),
        (parent, None) => pool_path.join(vol_type.directory()).join(parent),
    }
}

/// Storage-level name of any volume kind.
///
/// Instance names follow the default-project exemption, custom volumes and
/// buckets are always prefixed, image volumes are identified by fingerprint
/// alone.
pub fn storage_name(vol_type: VolumeType, project: &str, name: &str) -> String {
    match vol_type {
        VolumeType::Container | VolumeType::VirtualMachine => {
            instance_storage_name(project, name)
        }
        VolumeType::Custom | VolumeType::Bucket => volume_storage_name(project, name),
        VolumeType::Image => name.to_string(),
    }
}

/// Directory holding all snapshots of one parent volume inside the pool tree.
pub fn volume_snapshots_mount_path(
    var_dir: &Path,
    pool: &str,
    vol_type: VolumeType,
    storage_name: &str,
) -> PathBuf {
    pool_mount_path(var_dir, pool)
        .join(snapshots_directory(vol_type))
        .join(storage_name)
}

/// Daemon-visible symlink path for an instance.
pub fn instance_symlink_path(
    var_dir: &Path,
    vol_type: VolumeType,
    project: &str,
    name: &str,
) -> PathBuf {
    var_dir
        .join(vol_type.directory())
        .join(instance_storage_name(project, name))
}

/// Daemon-visible symlink path for an instance's snapshot directory.
pub fn instance_snapshots_symlink_path(
    var_dir: &Path,
    vol_type: VolumeType,
    project: &str,
    name: &str,
) -> PathBuf {
    var_dir
        .join(snapshots_directory(vol_type))
        .join(instance_storage_name(project, name))
}

/// Directory holding exported backups of a custom volume.
pub fn volume_backups_path(var_dir: &Path, pool: &str, project: &str, name: &str) -> PathBuf {
    var_dir
        .join("backups")
        .join("custom")
        .join(pool)
        .join(volume_storage_name(project, name))
}

/// Create or refresh a symlink so that `link` points at `target`.
pub async fn ensure_symlink(link: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            StorageError::Internal(format!(
                "Failed creating symlink directory {:?}: {e}",
                parent
            ))
        })?;
    }

    match fs::read_link(link).await {
        Ok(existing) if existing == target => return Ok(()),
        Ok(_) => {
            fs::remove_file(link).await.map_err(|e| {
                StorageError::Internal(format!("Failed replacing symlink {link:?}: {e}"))
            })?;
        }
        Err(_) => {}
    }

    fs::symlink(target, link)
        .await
        .map_err(|e| StorageError::Internal(format!("Failed creating symlink {link:?}: {e}")))
}

/// Remove a symlink, ignoring a missing one.
pub async fn remove_symlink(link: &Path) -> Result<()> {
    match fs::symlink_metadata(link).await {
        Ok(_) => fs::remove_file(link).await.map_err(|e| {
            StorageError::Internal(format!("Failed removing symlink {link:?}: {e}"))
        }),
        Err(_) => Ok(()),
    }
}

/// Remove an instance's snapshot symlink when its target directory no longer
/// holds any snapshots.
pub async fn remove_symlink_if_target_empty(link: &Path) -> Result<()> {
    let target = match fs::read_link(link).await {
        Ok(target) => target,
        Err(_) => return Ok(()),
    };

    let empty = match fs::read_dir(&target).await {
        Ok(mut entries) => entries
            .next_entry()
            .await
            .map_err(|e| {
                StorageError::Internal(format!("Failed reading {:?}: {e}", target))
            })?
            .is_none(),
        Err(_) => true,
    };

    if empty {
        remove_symlink(link).await?;
    }

    Ok(())
}
