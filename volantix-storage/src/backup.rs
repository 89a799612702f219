//! Backup descriptor stored inside instance and custom volumes.
//!
//! Every instance volume carries a `backup.yaml` at its root describing the
//! instance, its snapshots, the owning pool and the volume records. The
//! descriptor is what makes a volume self-describing: recovery rebuilds
//! records from it and import validates against it.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, StorageError};
use crate::instance::InstanceInfo;
use crate::records::{BucketKeyRecord, BucketRecord, PoolRecord, VolumeRecord};

/// Snapshot entry of the instance descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshotInfo {
    /// Leaf snapshot name, without the parent prefix.
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Contents of a volume's `backup.yaml`.
///
/// Volume snapshot records are stored under their leaf names; the parent
/// prefix is re-applied when records are recreated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<InstanceSnapshotInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshots: Vec<VolumeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<BucketRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bucket_keys: Vec<BucketKeyRecord>,
}

impl BackupConfig {
    /// Leaf names of the instance snapshots in the descriptor.
    pub fn snapshot_names(&self) -> Vec<String> {
        self.snapshots.iter().map(|s| s.name.clone()).collect()
    }

    /// Leaf names of the volume snapshot records in the descriptor.
    pub fn volume_snapshot_names(&self) -> Vec<String> {
        self.volume_snapshots
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Check that instance snapshot entries and volume snapshot records
    /// describe the same set of snapshots.
    pub fn check_snapshot_consistency(&self) -> Result<()> {
        let mut instance_names = self.snapshot_names();
        let mut volume_names = self.volume_snapshot_names();

        if instance_names.len() != volume_names.len() {
            return Err(StorageError::Validation(
                "Instance snapshot record count doesn't match instance snapshot volume record count"
                    .to_string(),
            ));
        }

        instance_names.sort();
        volume_names.sort();
        for (instance_name, volume_name) in instance_names.iter().zip(volume_names.iter()) {
            if instance_name != volume_name {
                return Err(StorageError::Validation(format!(
                    "Instance snapshot {instance_name:?} has no matching volume snapshot record"
                )));
            }
        }

        Ok(())
    }
}

/// Metadata describing an importable backup archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupInfo {
    pub project: String,
    pub name: String,
    pub pool: String,
    /// Leaf snapshot names contained in the archive.
    #[serde(default)]
    pub snapshots: Vec<String>,
    /// Whether the archive uses the driver's optimized format.
    #[serde(default)]
    pub optimized_storage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<BackupConfig>,
}

/// Serialize a descriptor to YAML.
pub fn render_backup_config(config: &BackupConfig) -> Result<String> {
    serde_yaml::to_string(config)
        .map_err(|e| StorageError::Internal(format!("Failed rendering backup file: {e}")))
}

/// Write `backup.yaml` into the given directory, readable by the daemon
/// only.
pub async fn write_backup_file(dir: &Path, config: &BackupConfig) -> Result<()> {
    let path = dir.join(crate::paths::BACKUP_FILE_NAME);
    let content = render_backup_config(config)?;

    fs::write(&path, content.as_bytes())
        .await
        .map_err(|e| StorageError::Internal(format!("Failed writing {path:?}: {e}")))?;

    let perms = std::fs::Permissions::from_mode(0o600);
    fs::set_permissions(&path, perms)
        .await
        .map_err(|e| StorageError::Internal(format!("Failed setting mode on {path:?}: {e}")))
}

/// Parse a `backup.yaml` found at the root of a mounted volume.
pub async fn read_backup_file(dir: &Path) -> Result<BackupConfig> {
    let path = dir.join(crate::paths::BACKUP_FILE_NAME);
    let content = fs::read_to_string(&path)
        .await
        .map_err(|e| StorageError::Internal(format!("Failed reading {path:?}: {e}")))?;
    parse_backup_config(&content)
}

pub fn parse_backup_config(content: &str) -> Result<BackupConfig> {
    serde_yaml::from_str(content)
        .map_err(|e| StorageError::Validation(format!("Failed parsing backup file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceKind;
    use crate::types::{ContentType, PoolStatus, VolumeType};
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample_config() -> BackupConfig {
        BackupConfig {
            instance: Some(InstanceInfo {
                name: "c1".to_string(),
                kind: InstanceKind::Container,
                created_at: Utc::now(),
                config: HashMap::new(),
            }),
            snapshots: vec![InstanceSnapshotInfo {
                name: "snap0".to_string(),
                created_at: Utc::now(),
            }],
            pool: Some(PoolRecord {
                name: "p1".to_string(),
                driver: "dir".to_string(),
                description: String::new(),
                config: HashMap::new(),
                status: PoolStatus::Created,
            }),
            volume: Some(VolumeRecord::new(
                "default",
                "p1",
                "c1",
                VolumeType::Container,
                ContentType::Filesystem,
                HashMap::new(),
            )),
            volume_snapshots: vec![VolumeRecord::new(
                "default",
                "p1",
                "snap0",
                VolumeType::Container,
                ContentType::Filesystem,
                HashMap::new(),
            )],
            bucket: None,
            bucket_keys: Vec::new(),
        }
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = sample_config();
        let rendered = render_backup_config(&config).unwrap();
        let parsed = parse_backup_config(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_snapshot_consistency() {
        let mut config = sample_config();
        config.check_snapshot_consistency().unwrap();

        config.volume_snapshots.clear();
        let err = config.check_snapshot_consistency().unwrap_err();
        assert!(err.to_string().contains("snapshot record count"));

        config.volume_snapshots = vec![VolumeRecord::new(
            "default",
            "p1",
            "other",
            VolumeType::Container,
            ContentType::Filesystem,
            HashMap::new(),
        )];
        assert!(config.check_snapshot_consistency().is_err());
    }

    #[tokio::test]
    async fn test_write_and_read_backup_file() {
        let dir = std::env::temp_dir().join(format!("volantix-backup-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).await.unwrap();

        let config = sample_config();
        write_backup_file(&dir, &config).await.unwrap();
        let parsed = read_backup_file(&dir).await.unwrap();
        assert_eq!(parsed, config);

        fs::remove_dir_all(&dir).await.unwrap();
    }
}
