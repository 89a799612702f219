//! Core storage type definitions.

use serde::{Deserialize, Serialize};

/// Category of a storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeType {
    /// Root filesystem volume for a container instance
    Container,
    /// Root disk volume for a virtual machine instance
    VirtualMachine,
    /// Content-addressed cached image volume
    Image,
    /// User-managed custom volume
    Custom,
    /// Object storage bucket volume
    Bucket,
}

impl VolumeType {
    /// All volume types, in record-listing order.
    pub const ALL: [VolumeType; 5] = [
        VolumeType::Container,
        VolumeType::VirtualMachine,
        VolumeType::Image,
        VolumeType::Custom,
        VolumeType::Bucket,
    ];

    /// True for volume types that back an instance.
    pub fn is_instance(&self) -> bool {
        matches!(self, VolumeType::Container | VolumeType::VirtualMachine)
    }

    /// Singular noun used for authorizer records and event payloads.
    pub fn singular(&self) -> &'static str {
        match self {
            VolumeType::Container => "container",
            VolumeType::VirtualMachine => "virtual-machine",
            VolumeType::Image => "image",
            VolumeType::Custom => "custom",
            VolumeType::Bucket => "bucket",
        }
    }

    /// Directory name under which volumes of this type are presented.
    pub fn directory(&self) -> &'static str {
        match self {
            VolumeType::Container => "containers",
            VolumeType::VirtualMachine => "virtual-machines",
            VolumeType::Image => "images",
            VolumeType::Custom => "custom",
            VolumeType::Bucket => "buckets",
        }
    }

    /// Parse from the record-store name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container" => Some(VolumeType::Container),
            "virtual-machine" => Some(VolumeType::VirtualMachine),
            "image" => Some(VolumeType::Image),
            "custom" => Some(VolumeType::Custom),
            "bucket" => Some(VolumeType::Bucket),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.singular())
    }
}

/// How a volume's bytes are consumed by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Mountable filesystem tree
    Filesystem,
    /// Raw block device payload
    Block,
    /// Read-only ISO image
    Iso,
}

impl ContentType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filesystem" | "fs" => Some(ContentType::Filesystem),
            "block" => Some(ContentType::Block),
            "iso" => Some(ContentType::Iso),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentType::Filesystem => "filesystem",
            ContentType::Block => "block",
            ContentType::Iso => "iso",
        };
        f.write_str(s)
    }
}

/// Global lifecycle status of a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    /// Created in the record store but not yet realized on every member
    Pending,
    /// Fully created and usable
    Created,
    /// Creation or update failed
    Errored,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolStatus::Pending => "pending",
            PoolStatus::Created => "created",
            PoolStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Capability description reported by a storage driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Driver name (e.g. "dir", "mock")
    pub name: String,
    /// Driver/tooling version string
    pub version: String,
    /// Storage is shared between cluster members rather than member-local
    pub remote: bool,
    /// Driver supports object storage buckets
    pub buckets: bool,
    /// Driver supports cached optimized image volumes
    pub optimized_images: bool,
    /// Copying a running instance requires freezing it first for a
    /// crash-consistent result
    pub running_copy_freeze: bool,
    /// The pool itself is a mounted filesystem root
    pub mounted_root: bool,
    /// Filesystem volumes are carved out of block devices
    pub block_backing: bool,
    /// Volume types this driver can host
    pub volume_types: Vec<VolumeType>,
}

impl DriverInfo {
    /// True when the driver can host the given volume type.
    pub fn supports_volume_type(&self, vol_type: VolumeType) -> bool {
        self.volume_types.contains(&vol_type)
    }
}

/// Result of mounting a volume.
#[derive(Debug, Clone, Default)]
pub struct MountInfo {
    /// Path of the block device when the volume is block-backed
    pub disk_path: Option<std::path::PathBuf>,
}

/// Space accounting for a single volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VolumeUsage {
    /// Bytes currently used
    pub used: u64,
    /// Configured size limit, when one is set
    pub total: Option<u64>,
}

/// Space accounting for a whole pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Total capacity in bytes
    pub total_bytes: u64,
    /// Bytes currently used
    pub used_bytes: u64,
    /// Bytes still available
    pub available_bytes: u64,
}

/// Separator between a parent volume name and its snapshot suffix.
pub const SNAPSHOT_SEPARATOR: char = '/';

/// Split a volume name into its parent and optional snapshot part.
///
/// Snapshot volumes are always named `<parent>/<snapshot>`.
pub fn parent_and_snapshot(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_SEPARATOR) {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

/// True when the name refers to a snapshot volume.
pub fn is_snapshot_name(name: &str) -> bool {
    name.contains(SNAPSHOT_SEPARATOR)
}

/// Join a parent volume name and a snapshot-only name into the full
/// snapshot volume name.
pub fn snapshot_volume_name(parent: &str, snapshot: &str) -> String {
    format!("{parent}{SNAPSHOT_SEPARATOR}{snapshot}")
}
