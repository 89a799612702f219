//! Instance abstraction consumed by the storage engine.
//!
//! The engine never talks to the instance runtime directly. Callers hand it
//! an [`Instance`] handle and the engine uses it for the few things storage
//! cares about: identity, the matching volume and content types, freeze
//! control around copies of running instances, and the descriptor written
//! into the volume's backup file.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::types::{ContentType, VolumeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    Container,
    VirtualMachine,
}

impl InstanceKind {
    /// Volume type backing this kind of instance.
    pub fn volume_type(self) -> VolumeType {
        match self {
            InstanceKind::Container => VolumeType::Container,
            InstanceKind::VirtualMachine => VolumeType::VirtualMachine,
        }
    }

    /// Content type of this kind's root volume.
    pub fn content_type(self) -> ContentType {
        match self {
            InstanceKind::Container => ContentType::Filesystem,
            InstanceKind::VirtualMachine => ContentType::Block,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "container" => Ok(InstanceKind::Container),
            "virtual-machine" => Ok(InstanceKind::VirtualMachine),
            other => Err(StorageError::Validation(format!(
                "Invalid instance kind {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKind::Container => write!(f, "container"),
            InstanceKind::VirtualMachine => write!(f, "virtual-machine"),
        }
    }
}

/// Serializable instance descriptor stored in a volume's backup file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub kind: InstanceKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, String>,
}

/// Runtime handle for the instance owning a volume.
#[async_trait]
pub trait Instance: Send + Sync {
    fn name(&self) -> &str;

    fn project(&self) -> &str;

    fn kind(&self) -> InstanceKind;

    /// True for snapshot instances, which have no backup file of their own.
    fn is_snapshot(&self) -> bool;

    async fn is_running(&self) -> bool;

    async fn is_frozen(&self) -> bool;

    /// Pause execution so the volume can be copied consistently.
    async fn freeze(&self) -> Result<()>;

    async fn unfreeze(&self) -> Result<()>;

    /// Flush guest filesystems before a snapshot of a running instance.
    async fn sync_filesystem(&self) -> Result<()> {
        Ok(())
    }

    /// Creation time recorded in the instance descriptor.
    fn created_at(&self) -> DateTime<Utc>;

    /// Descriptor recorded in the volume's backup file. Implementations
    /// with instance-level config to preserve override this.
    fn render_info(&self) -> InstanceInfo {
        InstanceInfo {
            name: self.name().to_string(),
            kind: self.kind(),
            created_at: self.created_at(),
            config: HashMap::new(),
        }
    }

    /// Snapshot entries recorded in the volume's backup file.
    fn snapshot_infos(&self) -> Vec<crate::backup::InstanceSnapshotInfo>;

    /// Effective root disk device config, used to size incoming volumes.
    fn root_disk_config(&self) -> std::collections::HashMap<String, String> {
        std::collections::HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_volume_mapping() {
        assert_eq!(
            InstanceKind::Container.volume_type(),
            VolumeType::Container
        );
        assert_eq!(
            InstanceKind::Container.content_type(),
            ContentType::Filesystem
        );
        assert_eq!(
            InstanceKind::VirtualMachine.volume_type(),
            VolumeType::VirtualMachine
        );
        assert_eq!(
            InstanceKind::VirtualMachine.content_type(),
            ContentType::Block
        );
    }

    #[test]
    fn test_kind_parse_round_trip() {
        for kind in [InstanceKind::Container, InstanceKind::VirtualMachine] {
            assert_eq!(InstanceKind::parse(&kind.to_string()).unwrap(), kind);
        }
        assert!(InstanceKind::parse("profile").is_err());
    }

    struct Bare {
        created: DateTime<Utc>,
    }

    #[async_trait]
    impl Instance for Bare {
        fn name(&self) -> &str {
            "c1"
        }

        fn project(&self) -> &str {
            "default"
        }

        fn kind(&self) -> InstanceKind {
            InstanceKind::Container
        }

        fn is_snapshot(&self) -> bool {
            false
        }

        async fn is_running(&self) -> bool {
            false
        }

        async fn is_frozen(&self) -> bool {
            false
        }

        async fn freeze(&self) -> Result<()> {
            Ok(())
        }

        async fn unfreeze(&self) -> Result<()> {
            Ok(())
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.created
        }

        fn snapshot_infos(&self) -> Vec<crate::backup::InstanceSnapshotInfo> {
            Vec::new()
        }
    }

    #[test]
    fn test_default_descriptor_carries_creation_time() {
        let created = Utc::now();
        let info = Bare { created }.render_info();
        assert_eq!(info.name, "c1");
        assert_eq!(info.kind, InstanceKind::Container);
        assert_eq!(info.created_at, created);
        assert!(info.config.is_empty());
    }
}
