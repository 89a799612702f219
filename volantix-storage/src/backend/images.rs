//! Image cache volumes.
//!
//! Drivers with optimized image support keep one unpacked copy of each
//! image per pool, stored as an image volume named by the raw fingerprint
//! under the "default" project. Instance creation clones from that copy
//! instead of unpacking the image again. The cache is disposable: whenever
//! the cached copy no longer matches the pool's current volume settings it
//! is deleted and rebuilt.

use std::collections::HashMap;

use tracing::{debug, instrument, warn};

use crate::config;
use crate::drivers::{Volume, VolumeFiller};
use crate::error::{Result, StorageError};
use crate::events::EventKind;
use crate::locking::{delete_image_lock_name, ensure_image_lock_name};
use crate::paths::DEFAULT_PROJECT;
use crate::records::VolumeRecord;
use crate::rollback::{Rollback, UndoAction};
use crate::types::{ContentType, VolumeType};

use super::Backend;

/// Settings that shape how an image is unpacked. A cached copy created
/// under different values cannot be reused.
const IMAGE_SHAPE_KEYS: &[&str] = &["block.filesystem", "block.mount_options"];

fn image_configs_match(
    cached: &HashMap<String, String>,
    fresh: &HashMap<String, String>,
) -> bool {
    IMAGE_SHAPE_KEYS
        .iter()
        .all(|key| cached.get(*key) == fresh.get(*key))
}

impl Backend {
    /// Make sure the pool holds a usable cached copy of an image.
    ///
    /// Concurrent callers for one fingerprint are serialized through an
    /// advisory lock so the image is unpacked at most once. A cached copy
    /// with incompatible settings, or one that cannot be resized down to
    /// the pool's current default size, is deleted and rebuilt. On drivers
    /// without optimized image support this is a no-op.
    #[instrument(skip_all, fields(pool = %self.name, fingerprint = %fingerprint))]
    pub async fn ensure_image(
        &self,
        fingerprint: &str,
        filler: &dyn VolumeFiller,
        content_type: ContentType,
    ) -> Result<()> {
        self.is_status_ready().await?;
        if !self.driver.info().optimized_images {
            return Ok(());
        }

        let _guard = self
            .state
            .locks
            .lock(&ensure_image_lock_name(fingerprint))
            .await;

        let fresh = self
            .prepare_volume(VolumeType::Image, content_type, fingerprint, HashMap::new())
            .await?;

        let existing = match self
            .state
            .store
            .get_volume(DEFAULT_PROJECT, &self.name, VolumeType::Image, fingerprint)
            .await
        {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match existing {
            Some(record) => {
                let cached = self.volume_for_record(&record);
                if !self.driver.has_volume(&cached).await? {
                    // The unpack never finished or the storage lost the
                    // volume. Drop the record and rebuild from scratch.
                    warn!("Image record has no backing volume, rebuilding");
                    self.state
                        .store
                        .delete_volume(
                            DEFAULT_PROJECT,
                            &self.name,
                            VolumeType::Image,
                            fingerprint,
                        )
                        .await?;
                } else if record.content_type != content_type
                    || !image_configs_match(&record.config, fresh.config())
                {
                    debug!("Cached image no longer matches pool settings, rebuilding");
                    self.driver.delete_volume(&cached).await?;
                    self.state
                        .store
                        .delete_volume(
                            DEFAULT_PROJECT,
                            &self.name,
                            VolumeType::Image,
                            fingerprint,
                        )
                        .await?;
                } else if self.resize_cached_image(&record, &cached, &fresh).await? {
                    return Ok(());
                } else {
                    // Shrinking in place is not possible on this driver.
                    // Rebuild at the new size instead.
                    debug!("Cached image cannot shrink to the pool default, rebuilding");
                    self.driver.delete_volume(&cached).await?;
                    self.state
                        .store
                        .delete_volume(
                            DEFAULT_PROJECT,
                            &self.name,
                            VolumeType::Image,
                            fingerprint,
                        )
                        .await?;
                }
            }
            None => {
                if self.driver.has_volume(&fresh).await? {
                    // Volume without a record: a previous unpack was
                    // interrupted after the physical create.
                    warn!("Deleting leftover image volume without a record");
                    self.driver.delete_volume(&fresh).await?;
                }
            }
        }

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            let record = VolumeRecord::new(
                DEFAULT_PROJECT,
                &self.name,
                fingerprint,
                VolumeType::Image,
                content_type,
                fresh.config().clone(),
            );
            self.stage_volume_records(&mut rollback, Some(record), Vec::new())
                .await?;

            self.driver.create_volume(&fresh, Some(filler)).await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type: VolumeType::Image,
                content_type,
                storage_name: fresh.name().to_string(),
                config: fresh.config().clone(),
            });

            // Record the unpacked size so instance clones can be sized at
            // least as large.
            let usage = self.driver.volume_usage(&fresh).await?;
            let mut record = self
                .state
                .store
                .get_volume(DEFAULT_PROJECT, &self.name, VolumeType::Image, fingerprint)
                .await?;
            record
                .config
                .insert("volatile.image.size".to_string(), usage.used.to_string());
            self.state.store.update_volume(record).await
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::ImageCached, DEFAULT_PROJECT, fingerprint)
            .await;
        Ok(())
    }

    /// Bring a compatible cached image to the pool's current default size.
    ///
    /// Returns `Ok(true)` when the cache is usable as-is or was resized,
    /// `Ok(false)` when the copy must be rebuilt because it cannot shrink.
    async fn resize_cached_image(
        &self,
        record: &VolumeRecord,
        cached: &Volume,
        fresh: &Volume,
    ) -> Result<bool> {
        let Some(wanted) = fresh.size()? else {
            return Ok(true);
        };
        let current = match record.config.get("size") {
            Some(v) if !v.is_empty() => Some(config::parse_size(v)?),
            _ => None,
        };
        if current == Some(wanted) {
            return Ok(true);
        }

        match self.driver.set_volume_quota(cached, wanted, false).await {
            Ok(()) => {
                let mut updated = record.clone();
                updated
                    .config
                    .insert("size".to_string(), wanted.to_string());
                self.state.store.update_volume(updated).await?;
                Ok(true)
            }
            Err(StorageError::CannotBeShrunk(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a pool's cached copy of an image.
    #[instrument(skip_all, fields(pool = %self.name, fingerprint = %fingerprint))]
    pub async fn delete_image(&self, fingerprint: &str, content_type: ContentType) -> Result<()> {
        self.is_status_ready().await?;
        let _guard = self
            .state
            .locks
            .lock(&delete_image_lock_name(fingerprint))
            .await;

        let record = match self
            .state
            .store
            .get_volume(DEFAULT_PROJECT, &self.name, VolumeType::Image, fingerprint)
            .await
        {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let vol = match &record {
            Some(record) => self.volume_for_record(record),
            None => self.volume_handle(VolumeType::Image, content_type, fingerprint, HashMap::new()),
        };

        let present = self.driver.has_volume(&vol).await?;
        if record.is_none() && !present {
            return Err(StorageError::not_found(format!(
                "Image {fingerprint:?} has no cached copy on pool {:?}",
                self.name
            )));
        }
        if present {
            self.driver.delete_volume(&vol).await?;
        }
        if record.is_some() {
            self.state
                .store
                .delete_volume(DEFAULT_PROJECT, &self.name, VolumeType::Image, fingerprint)
                .await?;
        }

        self.emit(EventKind::ImageDeleted, DEFAULT_PROJECT, fingerprint)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EngineState;
    use crate::drivers::Driver;
    use crate::mock::MockDriver;
    use crate::records::PoolRecord;
    use crate::types::PoolStatus;
    use std::sync::Arc;
    use std::time::Duration;

    struct NullFiller;

    #[async_trait::async_trait]
    impl VolumeFiller for NullFiller {
        fn fingerprint(&self) -> Option<&str> {
            Some("abcdef123456")
        }

        async fn fill(&self, _vol: &Volume, _root: &std::path::Path) -> Result<u64> {
            Ok(0)
        }
    }

    async fn backend_with_config(
        config: &[(&str, &str)],
    ) -> (Arc<EngineState>, MockDriver, Arc<Backend>) {
        let state = EngineState::builder()
            .var_dir(std::env::temp_dir().join(format!("volantix-{}", uuid::Uuid::new_v4())))
            .build();
        let driver = MockDriver::new();
        let pool = PoolRecord {
            name: "p1".to_string(),
            driver: "mock".to_string(),
            description: String::new(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            status: PoolStatus::Pending,
        };
        let backend = Arc::new(Backend::new(pool, driver.clone(), state.clone()));
        backend.create().await.unwrap();
        (state, driver, backend)
    }

    const FP: &str = "abcdef123456";

    #[tokio::test]
    async fn test_ensure_image_unpacks_once() {
        let (state, driver, backend) = backend_with_config(&[]).await;

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();
        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();

        assert_eq!(driver.call_count("create_volume").await, 1);
        let record = state
            .store
            .get_volume(DEFAULT_PROJECT, "p1", VolumeType::Image, FP)
            .await
            .unwrap();
        assert!(record.config.contains_key("volatile.image.size"));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_serializes_on_lock() {
        let (_state, driver, backend) = backend_with_config(&[]).await;
        driver.set_op_delay(Duration::from_millis(25)).await;

        let b1 = backend.clone();
        let b2 = backend.clone();
        let (r1, r2) = tokio::join!(
            async move { b1.ensure_image(FP, &NullFiller, ContentType::Filesystem).await },
            async move { b2.ensure_image(FP, &NullFiller, ContentType::Filesystem).await },
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(driver.call_count("create_volume").await, 1);
        assert_eq!(driver.max_in_flight().await, 1);
    }

    #[tokio::test]
    async fn test_leftover_volume_is_replaced() {
        let (state, driver, backend) = backend_with_config(&[]).await;

        // Physical volume with no record, as left by an interrupted unpack.
        driver
            .seed_volume(VolumeType::Image, ContentType::Filesystem, FP, &[])
            .await;

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();

        assert_eq!(driver.call_count("delete_volume").await, 1);
        assert_eq!(driver.call_count("create_volume").await, 1);
        assert!(state
            .store
            .get_volume(DEFAULT_PROJECT, "p1", VolumeType::Image, FP)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_stale_record_is_rebuilt() {
        let (_state, driver, backend) = backend_with_config(&[]).await;

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();

        // Lose the physical volume behind the engine's back.
        let vol = Volume::new(
            &backend.state.var_dir,
            "p1",
            VolumeType::Image,
            ContentType::Filesystem,
            FP,
            HashMap::new(),
        );
        driver.delete_volume(&vol).await.unwrap();

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();
        assert_eq!(driver.call_count("create_volume").await, 2);
        assert!(driver.volume_names().await.contains(&FP.to_string()));
    }

    #[tokio::test]
    async fn test_shrinking_pool_default_rebuilds_cache() {
        let (state, driver, backend) =
            backend_with_config(&[("volume.size", "2GiB")]).await;

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();

        // Growing the default resizes the cached copy in place.
        let mut config = HashMap::new();
        config.insert("volume.size".to_string(), "4GiB".to_string());
        backend.update("", config).await.unwrap();
        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();
        assert_eq!(driver.call_count("create_volume").await, 1);

        // Shrinking cannot be done in place, so the cache is rebuilt.
        let mut config = HashMap::new();
        config.insert("volume.size".to_string(), "1GiB".to_string());
        backend.update("", config).await.unwrap();
        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();
        assert_eq!(driver.call_count("create_volume").await, 2);

        let record = state
            .store
            .get_volume(DEFAULT_PROJECT, "p1", VolumeType::Image, FP)
            .await
            .unwrap();
        assert_eq!(record.config.get("size").map(String::as_str), Some("1GiB"));
    }

    #[tokio::test]
    async fn test_changed_filesystem_rebuilds_cache() {
        let (_state, driver, backend) =
            backend_with_config(&[("volume.block.filesystem", "ext4")]).await;

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();

        let mut config = HashMap::new();
        config.insert("volume.block.filesystem".to_string(), "xfs".to_string());
        backend.update("", config).await.unwrap();

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();
        assert_eq!(driver.call_count("create_volume").await, 2);
        assert_eq!(driver.call_count("delete_volume").await, 1);
    }

    #[tokio::test]
    async fn test_delete_image_removes_record_and_volume() {
        let (state, driver, backend) = backend_with_config(&[]).await;

        backend
            .ensure_image(FP, &NullFiller, ContentType::Filesystem)
            .await
            .unwrap();
        backend
            .delete_image(FP, ContentType::Filesystem)
            .await
            .unwrap();

        assert!(driver.volume_names().await.is_empty());
        assert!(state
            .store
            .get_volume(DEFAULT_PROJECT, "p1", VolumeType::Image, FP)
            .await
            .unwrap_err()
            .is_not_found());

        let err = backend
            .delete_image(FP, ContentType::Filesystem)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
