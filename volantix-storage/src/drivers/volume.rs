//! Driver-facing volume handle.
//!
//! A [`Volume`] bundles everything a driver needs to act on one volume:
//! the owning pool, the storage-level name (already project-prefixed by the
//! engine), the type pair and the effective config map. Handles are plain
//! values; deriving a snapshot or renamed handle never touches storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::parse_size;
use crate::error::{Result, StorageError};
use crate::paths;
use crate::types::{
    parent_and_snapshot, snapshot_volume_name, ContentType, VolumeType,
};

#[derive(Debug, Clone)]
pub struct Volume {
    pool: String,
    vol_type: VolumeType,
    content_type: ContentType,
    name: String,
    config: HashMap<String, String>,
    var_dir: PathBuf,
}

impl Volume {
    pub fn new(
        var_dir: &Path,
        pool: &str,
        vol_type: VolumeType,
        content_type: ContentType,
        name: &str,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            pool: pool.to_string(),
            vol_type,
            content_type,
            name: name.to_string(),
            config,
            var_dir: var_dir.to_path_buf(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn volume_type(&self) -> VolumeType {
        self.vol_type
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn config(&self) -> &HashMap<String, String> {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.config
    }

    pub fn config_get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Configured size limit in bytes, when one is set.
    pub fn size(&self) -> Result<Option<u64>> {
        match self.config_get("size") {
            None | Some("") => Ok(None),
            Some(value) => parse_size(value)
                .map(Some)
                .map_err(|e| StorageError::InvalidConfig(format!("Invalid size: {e}"))),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        crate::types::is_snapshot_name(&self.name)
    }

    /// Parent part of the storage name. Equal to the full name for
    /// non-snapshots.
    pub fn parent_name(&self) -> &str {
        parent_and_snapshot(&self.name).0
    }

    /// Snapshot suffix, when this handle addresses a snapshot.
    pub fn snapshot_leaf(&self) -> Option<&str> {
        parent_and_snapshot(&self.name).1
    }

    /// Where the volume is (or would be) mounted.
    pub fn mount_path(&self) -> PathBuf {
        paths::volume_mount_path(&self.var_dir, &self.pool, self.vol_type, &self.name)
    }

    /// Handle for a snapshot of this volume.
    pub fn new_snapshot(&self, leaf: &str) -> Volume {
        let mut snap = self.clone();
        snap.name = snapshot_volume_name(self.parent_name(), leaf);
        snap
    }

    /// Handle with a different storage name, same pool and types.
    pub fn with_name(&self, name: &str) -> Volume {
        let mut vol = self.clone();
        vol.name = name.to_string();
        vol
    }

    /// Handle with a different config map.
    pub fn with_config(&self, config: HashMap<String, String>) -> Volume {
        let mut vol = self.clone();
        vol.config = config;
        vol
    }
}
