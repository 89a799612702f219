//! Directory-backed storage driver.
//!
//! Volumes are plain directory trees under the pool's mount path, block
//! and ISO content lives in a sparse `root.img` file inside the volume
//! directory. Copies and refreshes are whole-file transfers; migration and
//! backup share a simple length-prefixed tree stream
//! (`header frame | payload`, terminated by an `end` entry).
//!
//! The driver cannot enforce quotas on filesystem volumes and treats them
//! as best-effort accounting only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backup::BackupInfo;
use crate::error::{Result, StorageError};
use crate::migration::{
    MigrationConn, MigrationType, TransferProtocol, VolumeSourceArgs, VolumeTargetArgs,
};
use crate::paths;
use crate::records::PoolRecord;
use crate::types::{ContentType, DriverInfo, MountInfo, PoolUsage, VolumeType, VolumeUsage};

use super::{Driver, Volume, VolumeFiller};

/// Backing file for block and ISO content inside the volume directory.
const BLOCK_FILE_NAME: &str = "root.img";

/// Size of a block volume when the config does not set one.
const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024 * 1024 * 1024;

const TRANSFER_CHUNK: usize = 64 * 1024;

pub struct DirDriver {
    var_dir: PathBuf,
    mounted: RwLock<HashSet<String>>,
}

impl DirDriver {
    pub fn new(var_dir: &Path) -> Self {
        Self {
            var_dir: var_dir.to_path_buf(),
            mounted: RwLock::new(HashSet::new()),
        }
    }

    fn pool_path(&self, pool: &PoolRecord) -> PathBuf {
        paths::pool_mount_path(&self.var_dir, &pool.name)
    }

    fn block_path(vol: &Volume) -> PathBuf {
        vol.mount_path().join(BLOCK_FILE_NAME)
    }

    fn uses_block_file(vol: &Volume) -> bool {
        matches!(vol.content_type(), ContentType::Block | ContentType::Iso)
    }

    async fn create_block_file(&self, vol: &Volume) -> Result<()> {
        let size = vol.size()?.unwrap_or(DEFAULT_BLOCK_SIZE);
        let path = Self::block_path(vol);
        let file = fs::File::create(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed creating {path:?}: {e}")))?;
        file.set_len(size)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed sizing {path:?}: {e}")))
    }
}

/// Copy a directory tree. Regular files, directories and symlinks are
/// carried over; ownership and modes follow the process defaults.
async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed creating {to:?}: {e}")))?;

        let mut entries = fs::read_dir(&from)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed reading {from:?}: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Driver(format!("Failed reading {from:?}: {e}")))?
        {
            let source = entry.path();
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await.map_err(|e| {
                StorageError::Driver(format!("Failed inspecting {source:?}: {e}"))
            })?;

            if file_type.is_dir() {
                stack.push((source, target));
            } else if file_type.is_symlink() {
                let link_target = fs::read_link(&source).await.map_err(|e| {
                    StorageError::Driver(format!("Failed reading link {source:?}: {e}"))
                })?;
                fs::symlink(&link_target, &target).await.map_err(|e| {
                    StorageError::Driver(format!("Failed creating link {target:?}: {e}"))
                })?;
            } else {
                fs::copy(&source, &target).await.map_err(|e| {
                    StorageError::Driver(format!("Failed copying {source:?}: {e}"))
                })?;
            }
        }
    }

    Ok(())
}

/// Remove a directory's contents, keeping the directory itself.
async fn wipe_dir(path: &Path) -> Result<()> {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::Driver(format!("Failed reading {path:?}: {e}")))?
    {
        let target = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| StorageError::Driver(format!("Failed inspecting {target:?}: {e}")))?;
        let removed = if file_type.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        removed.map_err(|e| StorageError::Driver(format!("Failed removing {target:?}: {e}")))?;
    }

    Ok(())
}

/// Total bytes of regular files under a directory.
async fn tree_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Driver(format!("Failed reading {dir:?}: {e}")))?
        {
            let file_type = entry.file_type().await.map_err(|e| {
                StorageError::Driver(format!("Failed inspecting {:?}: {e}", entry.path()))
            })?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                let meta = entry.metadata().await.map_err(|e| {
                    StorageError::Driver(format!("Failed inspecting {:?}: {e}", entry.path()))
                })?;
                total += meta.len();
            }
        }
    }

    Ok(total)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TreeEntryKind {
    Dir,
    File,
    Symlink,
    End,
}

/// Header of one entry in the tree stream.
#[derive(Debug, Serialize, Deserialize)]
struct TreeEntry {
    path: String,
    kind: TreeEntryKind,
    #[serde(default)]
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

async fn write_entry<W>(writer: &mut W, entry: &TreeEntry) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = serde_json::to_vec(entry)
        .map_err(|e| StorageError::Driver(format!("Failed encoding transfer entry: {e}")))?;
    let mut frame = BytesMut::with_capacity(4 + header.len());
    frame.put_u32(header.len() as u32);
    frame.extend_from_slice(&header);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| StorageError::Driver(format!("Failed sending transfer entry: {e}")))
}

async fn read_entry<R>(reader: &mut R) -> Result<TreeEntry>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader
        .read_u32()
        .await
        .map_err(|e| StorageError::Driver(format!("Failed reading transfer entry: {e}")))?;
    let mut header = vec![0u8; len as usize];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| StorageError::Driver(format!("Failed reading transfer entry: {e}")))?;
    serde_json::from_slice(&header)
        .map_err(|e| StorageError::Driver(format!("Failed decoding transfer entry: {e}")))
}

/// Stream a directory tree, prefixing every entry path with `prefix`.
async fn send_tree<W>(writer: &mut W, root: &Path, prefix: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // Root entry first, so empty trees still materialize on the far side.
    write_entry(
        writer,
        &TreeEntry {
            path: prefix.to_string(),
            kind: TreeEntryKind::Dir,
            size: 0,
            target: None,
        },
    )
    .await?;

    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed reading {dir:?}: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Driver(format!("Failed reading {dir:?}: {e}")))?
        {
            let path = entry.path();
            let rel = path.strip_prefix(root).map_err(|e| {
                StorageError::Driver(format!("Entry {path:?} escapes {root:?}: {e}"))
            })?;
            let wire_path = format!("{prefix}/{}", rel.to_string_lossy());
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::Driver(format!("Failed inspecting {path:?}: {e}")))?;

            if file_type.is_dir() {
                write_entry(
                    writer,
                    &TreeEntry {
                        path: wire_path,
                        kind: TreeEntryKind::Dir,
                        size: 0,
                        target: None,
                    },
                )
                .await?;
                stack.push(path);
            } else if file_type.is_symlink() {
                let link_target = fs::read_link(&path).await.map_err(|e| {
                    StorageError::Driver(format!("Failed reading link {path:?}: {e}"))
                })?;
                write_entry(
                    writer,
                    &TreeEntry {
                        path: wire_path,
                        kind: TreeEntryKind::Symlink,
                        size: 0,
                        target: Some(link_target.to_string_lossy().into_owned()),
                    },
                )
                .await?;
            } else {
                let meta = entry.metadata().await.map_err(|e| {
                    StorageError::Driver(format!("Failed inspecting {path:?}: {e}"))
                })?;
                write_entry(
                    writer,
                    &TreeEntry {
                        path: wire_path,
                        kind: TreeEntryKind::File,
                        size: meta.len(),
                        target: None,
                    },
                )
                .await?;

                let mut file = fs::File::open(&path)
                    .await
                    .map_err(|e| StorageError::Driver(format!("Failed opening {path:?}: {e}")))?;
                let mut remaining = meta.len();
                let mut chunk = vec![0u8; TRANSFER_CHUNK];
                while remaining > 0 {
                    let want = remaining.min(TRANSFER_CHUNK as u64) as usize;
                    file.read_exact(&mut chunk[..want]).await.map_err(|e| {
                        StorageError::Driver(format!("Failed reading {path:?}: {e}"))
                    })?;
                    writer.write_all(&chunk[..want]).await.map_err(|e| {
                        StorageError::Driver(format!("Failed sending {path:?}: {e}"))
                    })?;
                    remaining -= want as u64;
                }
            }
        }
    }

    Ok(())
}

async fn send_end<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_entry(
        writer,
        &TreeEntry {
            path: String::new(),
            kind: TreeEntryKind::End,
            size: 0,
            target: None,
        },
    )
    .await?;
    writer
        .flush()
        .await
        .map_err(|e| StorageError::Driver(format!("Failed flushing transfer: {e}")))
}

/// Resolve a wire path against the receiving volume.
///
/// `volume/<rel>` lands in the volume directory, `snapshots/<leaf>/<rel>` in
/// the matching snapshot directory. Entries that escape their root are
/// rejected.
fn resolve_wire_path(vol: &Volume, wire_path: &str) -> Result<PathBuf> {
    let mut parts = wire_path.split('/');
    let root = match parts.next() {
        Some("volume") => vol.mount_path(),
        Some("snapshots") => {
            let leaf = parts.next().ok_or_else(|| {
                StorageError::Driver(format!("Malformed transfer path {wire_path:?}"))
            })?;
            vol.new_snapshot(leaf).mount_path()
        }
        _ => {
            return Err(StorageError::Driver(format!(
                "Malformed transfer path {wire_path:?}"
            )))
        }
    };

    let mut resolved = root;
    for part in parts {
        if part.is_empty() || part == "." || part == ".." {
            return Err(StorageError::Driver(format!(
                "Transfer path {wire_path:?} escapes the volume"
            )));
        }
        resolved.push(part);
    }
    Ok(resolved)
}

/// Receive a tree stream into the volume (and its snapshots).
async fn recv_tree<R>(reader: &mut R, vol: &Volume) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let entry = read_entry(reader).await?;
        let path = match entry.kind {
            TreeEntryKind::End => return Ok(()),
            _ => resolve_wire_path(vol, &entry.path)?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Driver(format!("Failed creating {parent:?}: {e}")))?;
        }

        match entry.kind {
            TreeEntryKind::Dir => {
                fs::create_dir_all(&path)
                    .await
                    .map_err(|e| StorageError::Driver(format!("Failed creating {path:?}: {e}")))?;
            }
            TreeEntryKind::Symlink => {
                let target = entry.target.ok_or_else(|| {
                    StorageError::Driver(format!("Symlink entry {:?} without target", entry.path))
                })?;
                let _ = fs::remove_file(&path).await;
                fs::symlink(&target, &path).await.map_err(|e| {
                    StorageError::Driver(format!("Failed creating link {path:?}: {e}"))
                })?;
            }
            TreeEntryKind::File => {
                let mut file = fs::File::create(&path)
                    .await
                    .map_err(|e| StorageError::Driver(format!("Failed creating {path:?}: {e}")))?;
                let mut remaining = entry.size;
                let mut chunk = vec![0u8; TRANSFER_CHUNK];
                while remaining > 0 {
                    let want = remaining.min(TRANSFER_CHUNK as u64) as usize;
                    reader.read_exact(&mut chunk[..want]).await.map_err(|e| {
                        StorageError::Driver(format!("Failed receiving {path:?}: {e}"))
                    })?;
                    file.write_all(&chunk[..want]).await.map_err(|e| {
                        StorageError::Driver(format!("Failed writing {path:?}: {e}"))
                    })?;
                    remaining -= want as u64;
                }
                file.flush().await.map_err(|e| {
                    StorageError::Driver(format!("Failed writing {path:?}: {e}"))
                })?;
            }
            TreeEntryKind::End => unreachable!(),
        }
    }
}

#[async_trait]
impl Driver for DirDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: "dir".to_string(),
            version: "1".to_string(),
            remote: false,
            buckets: true,
            optimized_images: false,
            running_copy_freeze: true,
            mounted_root: true,
            block_backing: false,
            volume_types: VolumeType::ALL.to_vec(),
        }
    }

    async fn validate_pool(&self, config: &std::collections::HashMap<String, String>) -> Result<()> {
        crate::config::validate_pool_config(config, &self.config_keys())?;

        if let Some(source) = config.get("source") {
            if !source.is_empty() && !source.starts_with('/') {
                return Err(StorageError::InvalidConfig(format!(
                    "Pool source {source:?} must be an absolute path"
                )));
            }
        }
        Ok(())
    }

    async fn create_pool(&self, pool: &PoolRecord) -> Result<()> {
        let path = self.pool_path(pool);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed creating pool {path:?}: {e}")))
    }

    async fn delete_pool(&self, pool: &PoolRecord) -> Result<()> {
        let path = self.pool_path(pool);
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Driver(format!(
                "Failed removing pool {path:?}: {e}"
            ))),
        }
    }

    async fn mount_pool(&self, pool: &PoolRecord) -> Result<bool> {
        let path = self.pool_path(pool);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed mounting pool {path:?}: {e}")))?;
        Ok(self.mounted.write().await.insert(pool.name.clone()))
    }

    async fn unmount_pool(&self, pool: &PoolRecord) -> Result<bool> {
        Ok(self.mounted.write().await.remove(&pool.name))
    }

    async fn pool_usage(&self, pool: &PoolRecord) -> Result<PoolUsage> {
        let path = self.pool_path(pool);
        let disks = Disks::new_with_refreshed_list();

        // Best match is the mounted filesystem with the longest path prefix.
        let mut best: Option<(usize, u64, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let depth = mount.components().count();
                if best.map_or(true, |(d, _, _)| depth > d) {
                    best = Some((depth, disk.total_space(), disk.available_space()));
                }
            }
        }

        let (_, total, available) = best.ok_or_else(|| {
            StorageError::Driver(format!("No filesystem found for pool path {path:?}"))
        })?;
        Ok(PoolUsage {
            total_bytes: total,
            used_bytes: total.saturating_sub(available),
            available_bytes: available,
        })
    }

    async fn validate_volume(&self, vol: &Volume) -> Result<()> {
        crate::config::validate_volume_config(
            vol.volume_type(),
            vol.content_type(),
            vol.config(),
            &self.config_keys(),
        )
    }

    async fn create_volume(&self, vol: &Volume, filler: Option<&dyn VolumeFiller>) -> Result<()> {
        let path = vol.mount_path();
        fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed creating volume {path:?}: {e}")))?;

        if Self::uses_block_file(vol) {
            self.create_block_file(vol).await?;
        }

        if let Some(filler) = filler {
            let root = if Self::uses_block_file(vol) {
                Self::block_path(vol)
            } else {
                path.clone()
            };
            let filled = filler.fill(vol, &root).await?;
            debug!(volume = %vol.name(), bytes = filled, "Volume filled");
        }

        Ok(())
    }

    async fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src: &Volume,
        snapshots: &[String],
    ) -> Result<()> {
        copy_tree(&src.mount_path(), &vol.mount_path()).await?;
        for leaf in snapshots {
            copy_tree(
                &src.new_snapshot(leaf).mount_path(),
                &vol.new_snapshot(leaf).mount_path(),
            )
            .await?;
        }
        Ok(())
    }

    async fn refresh_volume(
        &self,
        vol: &Volume,
        src: &Volume,
        snapshots: &[String],
    ) -> Result<()> {
        wipe_dir(&vol.mount_path()).await?;
        copy_tree(&src.mount_path(), &vol.mount_path()).await?;
        for leaf in snapshots {
            let target = vol.new_snapshot(leaf).mount_path();
            wipe_dir(&target).await?;
            copy_tree(&src.new_snapshot(leaf).mount_path(), &target).await?;
        }
        Ok(())
    }

    async fn delete_volume(&self, vol: &Volume) -> Result<()> {
        let path = vol.mount_path();
        match fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::Driver(format!(
                    "Failed removing volume {path:?}: {e}"
                )))
            }
        }

        // The snapshot parent directory goes with the volume.
        if !vol.is_snapshot() {
            let snapshots_path = vol.new_snapshot("x").mount_path();
            if let Some(parent) = snapshots_path.parent() {
                let _ = fs::remove_dir_all(parent).await;
            }
        }

        Ok(())
    }

    async fn has_volume(&self, vol: &Volume) -> Result<bool> {
        Ok(fs::metadata(vol.mount_path()).await.is_ok())
    }

    async fn rename_volume(&self, vol: &Volume, new_name: &str) -> Result<()> {
        let renamed = vol.with_name(new_name);
        fs::rename(vol.mount_path(), renamed.mount_path())
            .await
            .map_err(|e| {
                StorageError::Driver(format!(
                    "Failed renaming volume {:?} to {new_name:?}: {e}",
                    vol.name()
                ))
            })?;

        // Move the snapshot parent directory along when present.
        let old_snaps = vol.new_snapshot("x").mount_path();
        let new_snaps = renamed.new_snapshot("x").mount_path();
        if let (Some(old_parent), Some(new_parent)) = (old_snaps.parent(), new_snaps.parent()) {
            if fs::metadata(old_parent).await.is_ok() {
                fs::rename(old_parent, new_parent).await.map_err(|e| {
                    StorageError::Driver(format!(
                        "Failed renaming snapshots of {:?}: {e}",
                        vol.name()
                    ))
                })?;
            }
        }

        Ok(())
    }

    async fn update_volume(
        &self,
        vol: &Volume,
        changed: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        if let Some(size) = changed.get("size") {
            if !size.is_empty() {
                let bytes = crate::config::parse_size(size)?;
                self.set_volume_quota(vol, bytes, false).await?;
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
        if !Self::uses_block_file(vol) {
            // Plain directories cannot enforce a quota.
            return Ok(());
        }

        let path = Self::block_path(vol);
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed inspecting {path:?}: {e}")))?;
        if size < meta.len() && !allow_unsafe_resize {
            return Err(StorageError::CannotBeShrunk(format!(
                "Block volume {:?} cannot be shrunk",
                vol.name()
            )));
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed opening {path:?}: {e}")))?;
        file.set_len(size)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed resizing {path:?}: {e}")))
    }

    async fn volume_usage(&self, vol: &Volume) -> Result<VolumeUsage> {
        let used = if Self::uses_block_file(vol) {
            fs::metadata(Self::block_path(vol))
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            tree_size(&vol.mount_path()).await?
        };
        Ok(VolumeUsage {
            used,
            total: vol.size()?,
        })
    }

    async fn volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        if !Self::uses_block_file(vol) {
            return Err(StorageError::NotSupported(format!(
                "Volume {:?} has no backing disk",
                vol.name()
            )));
        }
        Ok(Self::block_path(vol))
    }

    async fn mount_volume(&self, vol: &Volume) -> Result<MountInfo> {
        let path = vol.mount_path();
        fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed mounting volume {path:?}: {e}")))?;

        let disk_path = Self::uses_block_file(vol).then(|| Self::block_path(vol));
        Ok(MountInfo { disk_path })
    }

    async fn unmount_volume(&self, _vol: &Volume) -> Result<bool> {
        // Directory volumes are always reachable, nothing is ever mounted.
        Ok(false)
    }

    async fn list_volumes(&self, pool: &PoolRecord) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        let pool_path = self.pool_path(pool);

        for vol_type in VolumeType::ALL {
            let type_dir = pool_path.join(vol_type.directory());
            let mut entries = match fs::read_dir(&type_dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::Driver(format!("Failed reading {type_dir:?}: {e}")))?
            {
                let file_type = entry.file_type().await.map_err(|e| {
                    StorageError::Driver(format!("Failed inspecting {:?}: {e}", entry.path()))
                })?;
                if !file_type.is_dir() {
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                let has_block = fs::metadata(entry.path().join(BLOCK_FILE_NAME))
                    .await
                    .is_ok();
                let content_type = if has_block {
                    ContentType::Block
                } else {
                    ContentType::Filesystem
                };

                volumes.push(Volume::new(
                    &self.var_dir,
                    &pool.name,
                    vol_type,
                    content_type,
                    &name,
                    std::collections::HashMap::new(),
                ));
            }
        }

        Ok(volumes)
    }

    async fn create_volume_snapshot(&self, snap: &Volume) -> Result<()> {
        let parent = snap.with_name(snap.parent_name());
        copy_tree(&parent.mount_path(), &snap.mount_path()).await
    }

    async fn delete_volume_snapshot(&self, snap: &Volume) -> Result<()> {
        let path = snap.mount_path();
        match fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::Driver(format!(
                    "Failed removing snapshot {path:?}: {e}"
                )))
            }
        }

        // Drop the parent's snapshot directory once the last snapshot is
        // gone.
        if let Some(parent) = path.parent() {
            if let Ok(mut entries) = fs::read_dir(parent).await {
                if entries.next_entry().await.ok().flatten().is_none() {
                    let _ = fs::remove_dir(parent).await;
                }
            }
        }

        Ok(())
    }

    async fn rename_volume_snapshot(&self, snap: &Volume, new_leaf: &str) -> Result<()> {
        let renamed = snap.with_name(snap.parent_name()).new_snapshot(new_leaf);
        fs::rename(snap.mount_path(), renamed.mount_path())
            .await
            .map_err(|e| {
                StorageError::Driver(format!(
                    "Failed renaming snapshot {:?} to {new_leaf:?}: {e}",
                    snap.name()
                ))
            })
    }

    async fn restore_volume(&self, vol: &Volume, snapshot: &str) -> Result<()> {
        let snap = vol.new_snapshot(snapshot);
        if fs::metadata(snap.mount_path()).await.is_err() {
            return Err(StorageError::not_found(format!(
                "Snapshot {snapshot:?} of volume {:?} not found",
                vol.parent_name()
            )));
        }

        wipe_dir(&vol.mount_path()).await?;
        copy_tree(&snap.mount_path(), &vol.mount_path()).await
    }

    async fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>> {
        let snapshots_path = vol.new_snapshot("x").mount_path();
        let parent = match snapshots_path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Ok(Vec::new()),
        };

        let mut entries = match fs::read_dir(&parent).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut leaves = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Driver(format!("Failed reading {parent:?}: {e}")))?
        {
            leaves.push(entry.file_name().to_string_lossy().into_owned());
        }
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
        for leaf in &args.snapshots {
            send_tree(
                conn,
                &vol.new_snapshot(leaf).mount_path(),
                &format!("snapshots/{leaf}"),
            )
            .await?;
        }
        send_tree(conn, &vol.mount_path(), "volume").await?;
        send_end(conn).await?;
        conn.shutdown()
            .await
            .map_err(|e| StorageError::Driver(format!("Failed closing transfer: {e}")))
    }

    async fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut MigrationConn,
        args: &VolumeTargetArgs,
    ) -> Result<()> {
        let path = vol.mount_path();
        if args.refresh {
            wipe_dir(&path).await?;
        } else {
            fs::create_dir_all(&path).await.map_err(|e| {
                StorageError::Driver(format!("Failed creating volume {path:?}: {e}"))
            })?;
        }

        recv_tree(conn, vol).await
    }

    async fn backup_volume(
        &self,
        vol: &Volume,
        target: &mut (dyn AsyncWrite + Send + Unpin),
        snapshots: &[String],
    ) -> Result<()> {
        for leaf in snapshots {
            send_tree(
                target,
                &vol.new_snapshot(leaf).mount_path(),
                &format!("snapshots/{leaf}"),
            )
            .await?;
        }
        send_tree(target, &vol.mount_path(), "volume").await?;
        send_end(target).await
    }

    async fn create_volume_from_backup(
        &self,
        vol: &Volume,
        source: &mut (dyn AsyncRead + Send + Unpin),
        info: &BackupInfo,
    ) -> Result<bool> {
        let path = vol.mount_path();
        fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::Driver(format!("Failed creating volume {path:?}: {e}")))?;

        if info.optimized_storage {
            warn!(volume = %vol.name(), "Optimized archive restored as plain tree");
        }

        recv_tree(source, vol).await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::pipe_pair;
    use std::collections::HashMap;

    struct Harness {
        driver: DirDriver,
        pool: PoolRecord,
        var_dir: PathBuf,
    }

    impl Harness {
        async fn new() -> Self {
            let var_dir =
                std::env::temp_dir().join(format!("volantix-dir-{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(&var_dir).await.unwrap();

            let driver = DirDriver::new(&var_dir);
            let pool = PoolRecord {
                name: "p1".to_string(),
                driver: "dir".to_string(),
                description: String::new(),
                config: HashMap::new(),
                status: crate::types::PoolStatus::Created,
            };
            driver.create_pool(&pool).await.unwrap();
            Self {
                driver,
                pool,
                var_dir,
            }
        }

        fn volume(&self, name: &str, content_type: ContentType) -> Volume {
            Volume::new(
                &self.var_dir,
                &self.pool.name,
                VolumeType::Custom,
                content_type,
                name,
                HashMap::new(),
            )
        }

        async fn cleanup(self) {
            let _ = fs::remove_dir_all(&self.var_dir).await;
        }
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let h = Harness::new().await;
        let vol = h.volume("default_vol1", ContentType::Filesystem);

        h.driver.create_volume(&vol, None).await.unwrap();
        assert!(h.driver.has_volume(&vol).await.unwrap());

        fs::write(vol.mount_path().join("data"), b"payload")
            .await
            .unwrap();

        h.driver.create_volume_snapshot(&vol.new_snapshot("snap0")).await.unwrap();
        assert_eq!(
            h.driver.volume_snapshots(&vol).await.unwrap(),
            vec!["snap0".to_string()]
        );

        // Mutate, then restore from the snapshot.
        fs::write(vol.mount_path().join("data"), b"changed")
            .await
            .unwrap();
        h.driver.restore_volume(&vol, "snap0").await.unwrap();
        assert_eq!(
            fs::read(vol.mount_path().join("data")).await.unwrap(),
            b"payload"
        );

        h.driver
            .delete_volume_snapshot(&vol.new_snapshot("snap0"))
            .await
            .unwrap();
        h.driver.delete_volume(&vol).await.unwrap();
        assert!(!h.driver.has_volume(&vol).await.unwrap());

        h.cleanup().await;
    }

    #[tokio::test]
    async fn test_block_volume_quota() {
        let h = Harness::new().await;
        let mut vol = h.volume("default_blk", ContentType::Block);
        vol.config_mut()
            .insert("size".to_string(), "1MiB".to_string());

        h.driver.create_volume(&vol, None).await.unwrap();
        let disk = h.driver.volume_disk_path(&vol).await.unwrap();
        assert_eq!(fs::metadata(&disk).await.unwrap().len(), 1024 * 1024);

        // Growing is fine, shrinking is refused.
        h.driver
            .set_volume_quota(&vol, 2 * 1024 * 1024, false)
            .await
            .unwrap();
        let err = h
            .driver
            .set_volume_quota(&vol, 1024, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CannotBeShrunk(_)));

        h.driver.set_volume_quota(&vol, 1024, true).await.unwrap();
        h.cleanup().await;
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let h = Harness::new().await;
        let src = h.volume("default_src", ContentType::Filesystem);
        h.driver.create_volume(&src, None).await.unwrap();
        fs::write(src.mount_path().join("data"), b"payload")
            .await
            .unwrap();
        h.driver
            .create_volume_snapshot(&src.new_snapshot("snap0"))
            .await
            .unwrap();

        let dst = h.volume("default_dst", ContentType::Filesystem);
        h.driver
            .create_volume_from_copy(&dst, &src, &["snap0".to_string()])
            .await
            .unwrap();
        assert_eq!(
            fs::read(dst.mount_path().join("data")).await.unwrap(),
            b"payload"
        );
        assert_eq!(
            h.driver.volume_snapshots(&dst).await.unwrap(),
            vec!["snap0".to_string()]
        );

        h.driver.rename_volume(&dst, "default_dst2").await.unwrap();
        let renamed = h.volume("default_dst2", ContentType::Filesystem);
        assert!(h.driver.has_volume(&renamed).await.unwrap());
        assert_eq!(
            h.driver.volume_snapshots(&renamed).await.unwrap(),
            vec!["snap0".to_string()]
        );

        h.cleanup().await;
    }

    #[tokio::test]
    async fn test_migration_transfer() {
        let h = Harness::new().await;
        let src = h.volume("default_mig", ContentType::Filesystem);
        h.driver.create_volume(&src, None).await.unwrap();
        fs::write(src.mount_path().join("data"), b"migrate me")
            .await
            .unwrap();
        fs::create_dir_all(src.mount_path().join("nested"))
            .await
            .unwrap();
        fs::write(src.mount_path().join("nested/file"), b"deep")
            .await
            .unwrap();
        h.driver
            .create_volume_snapshot(&src.new_snapshot("snap0"))
            .await
            .unwrap();

        let dst = h.volume("default_mig2", ContentType::Filesystem);
        let (mut source_conn, mut target_conn) = pipe_pair(1024);

        let migration_type = MigrationType::new(TransferProtocol::Filesync, Vec::new());
        let source_args = VolumeSourceArgs {
            index_header_version: crate::migration::INDEX_HEADER_VERSION,
            name: src.name().to_string(),
            snapshots: vec!["snap0".to_string()],
            migration_type: migration_type.clone(),
            volume_only: false,
            refresh: false,
            allow_inconsistent: false,
            cluster_move: false,
        };
        let target_args = VolumeTargetArgs {
            index_header_version: crate::migration::INDEX_HEADER_VERSION,
            name: dst.name().to_string(),
            description: String::new(),
            config: HashMap::new(),
            snapshots: vec!["snap0".to_string()],
            migration_type,
            refresh: false,
            volume_size: None,
            volume_only: false,
            cluster_move: false,
        };

        let send_driver = DirDriver::new(&h.var_dir);
        let send_vol = src.clone();
        let sender = tokio::spawn(async move {
            send_driver
                .migrate_volume(&send_vol, &mut source_conn, &source_args)
                .await
        });

        h.driver
            .create_volume_from_migration(&dst, &mut target_conn, &target_args)
            .await
            .unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(
            fs::read(dst.mount_path().join("data")).await.unwrap(),
            b"migrate me"
        );
        assert_eq!(
            fs::read(dst.mount_path().join("nested/file")).await.unwrap(),
            b"deep"
        );
        assert_eq!(
            h.driver.volume_snapshots(&dst).await.unwrap(),
            vec!["snap0".to_string()]
        );

        h.cleanup().await;
    }

    #[tokio::test]
    async fn test_backup_round_trip() {
        let h = Harness::new().await;
        let src = h.volume("default_bak", ContentType::Filesystem);
        h.driver.create_volume(&src, None).await.unwrap();
        fs::write(src.mount_path().join("data"), b"export me")
            .await
            .unwrap();

        let mut archive = Vec::new();
        h.driver
            .backup_volume(&src, &mut archive, &[])
            .await
            .unwrap();

        let restored = h.volume("default_bak2", ContentType::Filesystem);
        let info = BackupInfo {
            project: "default".to_string(),
            name: "bak2".to_string(),
            pool: h.pool.name.clone(),
            snapshots: Vec::new(),
            optimized_storage: false,
            config: None,
        };
        let mut reader = std::io::Cursor::new(archive);
        let needs_post = h
            .driver
            .create_volume_from_backup(&restored, &mut reader, &info)
            .await
            .unwrap();
        assert!(!needs_post);
        assert_eq!(
            fs::read(restored.mount_path().join("data")).await.unwrap(),
            b"export me"
        );

        h.cleanup().await;
    }

    #[tokio::test]
    async fn test_list_volumes_reports_content_types() {
        let h = Harness::new().await;
        let fs_vol = h.volume("default_fsv", ContentType::Filesystem);
        let block_vol = h.volume("default_bv", ContentType::Block);
        h.driver.create_volume(&fs_vol, None).await.unwrap();
        h.driver.create_volume(&block_vol, None).await.unwrap();

        let listed = h.driver.list_volumes(&h.pool).await.unwrap();
        let fs_listed = listed.iter().find(|v| v.name() == "default_fsv").unwrap();
        let block_listed = listed.iter().find(|v| v.name() == "default_bv").unwrap();
        assert_eq!(fs_listed.content_type(), ContentType::Filesystem);
        assert_eq!(block_listed.content_type(), ContentType::Block);

        h.cleanup().await;
    }
}
