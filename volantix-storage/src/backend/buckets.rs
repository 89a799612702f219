//! Object storage buckets.
//!
//! A bucket on a local pool is a filesystem volume handed to an object
//! gateway process (one S3-compatible listener per member). Remote object
//! pools skip the volume and drive the bucket through the pool driver
//! itself. Key management maps one bucket key record to one gateway
//! service account.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::config;
use crate::error::{Result, StorageError};
use crate::events::EventKind;
use crate::paths;
use crate::records::{BucketKeyRecord, BucketRecord};
use crate::rollback::{Rollback, UndoAction};
use crate::types::{ContentType, VolumeType};

use super::Backend;

const ACCESS_KEY_LEN: usize = 20;
const SECRET_KEY_LEN: usize = 40;

/// S3-compatible object service running next to the pool.
///
/// `storage_name` is the project-prefixed bucket volume name; for local
/// pools it doubles as the gateway's bucket identifier.
#[async_trait]
pub trait BucketGateway: Send + Sync {
    /// Start (or confirm) the service for a bucket volume mounted at `path`.
    async fn ensure_running(&self, storage_name: &str, path: &Path) -> Result<()>;

    /// Stop the service for a bucket volume if it is running.
    async fn stop(&self, storage_name: &str) -> Result<()>;

    async fn make_bucket(&self, storage_name: &str) -> Result<()>;

    async fn remove_bucket(&self, storage_name: &str) -> Result<()>;

    async fn bucket_exists(&self, storage_name: &str) -> Result<bool>;

    /// Create or replace a service account scoped to one bucket.
    async fn put_service_account(
        &self,
        storage_name: &str,
        access_key: &str,
        secret_key: &str,
        role: &str,
    ) -> Result<()>;

    async fn delete_service_account(&self, access_key: &str) -> Result<()>;

    async fn list_service_accounts(&self, storage_name: &str) -> Result<Vec<String>>;

    /// Base URL clients reach the service on. Empty when unreachable.
    fn service_url(&self) -> String;
}

fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StorageError::Validation(
            "Bucket names cannot be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains(char::is_whitespace) {
        return Err(StorageError::Validation(format!(
            "Invalid bucket name {name:?}"
        )));
    }
    if name.starts_with('.') {
        return Err(StorageError::Validation(format!(
            "Bucket name {name:?} cannot start with a dot"
        )));
    }
    Ok(())
}

fn random_key(len: usize) -> String {
    let mut key = String::with_capacity(len + 32);
    while key.len() < len {
        key.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    key.truncate(len);
    key
}

impl Backend {
    fn bucket_storage_name(&self, project: &str, name: &str) -> String {
        paths::storage_name(VolumeType::Bucket, project, name)
    }

    /// Create a bucket and its backing volume.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %name))]
    pub async fn create_bucket(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: HashMap<String, String>,
    ) -> Result<()> {
        self.is_status_ready().await?;

        let info = self.driver.info();
        if !info.buckets {
            return Err(StorageError::NotSupported(format!(
                "Storage pool driver {:?} does not support buckets",
                info.name
            )));
        }
        validate_bucket_name(name)?;

        if self.state.store.get_bucket(project, &self.name, name).await.is_ok() {
            return Err(StorageError::conflict(format!(
                "A bucket named {name:?} already exists"
            )));
        }

        let storage = self.bucket_storage_name(project, name);
        let record = BucketRecord {
            project: project.to_string(),
            pool: self.name.clone(),
            name: name.to_string(),
            description: description.to_string(),
            config: config.clone(),
            created_at: Utc::now(),
        };
        self.driver.validate_bucket(&record).await?;

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.state.store.create_bucket(record.clone()).await?;
            rollback.push(UndoAction::DeleteBucketRecord {
                project: project.to_string(),
                name: name.to_string(),
            });

            if info.remote {
                self.driver.create_bucket(&record).await?;
                return Ok(());
            }

            let vol = self
                .prepare_volume(VolumeType::Bucket, ContentType::Filesystem, &storage, config)
                .await?;
            self.driver.create_volume(&vol, None).await?;
            rollback.push(UndoAction::DeletePhysicalVolume {
                vol_type: VolumeType::Bucket,
                content_type: ContentType::Filesystem,
                storage_name: storage.clone(),
                config: vol.config().clone(),
            });

            self.driver.mount_volume(&vol).await?;
            self.state
                .gateway
                .ensure_running(&storage, &vol.mount_path())
                .await?;
            self.state.gateway.make_bucket(&storage).await?;
            rollback.push(UndoAction::DeleteGatewayBucket {
                storage_name: storage.clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::BucketCreated, project, name).await;
        Ok(())
    }

    /// Apply description and config changes to a bucket.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %name))]
    pub async fn update_bucket(
        &self,
        project: &str,
        name: &str,
        new_description: &str,
        new_config: HashMap<String, String>,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let record = self.state.store.get_bucket(project, &self.name, name).await?;

        let (changed, user_only) = config::detect_changed_config(&record.config, &new_config);
        if changed.is_empty() && record.description == new_description {
            return Ok(());
        }

        if !user_only && !self.driver.info().remote {
            let storage = self.bucket_storage_name(project, name);
            // The gateway holds the volume open; it restarts on the next
            // activation.
            if let Err(e) = self.state.gateway.stop(&storage).await {
                warn!(bucket = %name, error = %e, "Failed stopping bucket service before update");
            }

            if changed.contains_key("size") {
                let vol = self.volume_handle(
                    VolumeType::Bucket,
                    ContentType::Filesystem,
                    &storage,
                    new_config.clone(),
                );
                let size = match new_config.get("size") {
                    Some(v) if !v.is_empty() => config::parse_size(v)?,
                    _ => 0,
                };
                self.driver.set_volume_quota(&vol, size, false).await?;
            }
        }

        let mut updated = record;
        updated.description = new_description.to_string();
        updated.config = new_config;
        self.state.store.update_bucket(updated).await?;

        self.emit(EventKind::BucketUpdated, project, name).await;
        Ok(())
    }

    /// Delete a bucket, its keys, its gateway state, and its volume.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %name))]
    pub async fn delete_bucket(&self, project: &str, name: &str) -> Result<()> {
        self.is_status_ready().await?;
        let record = self.state.store.get_bucket(project, &self.name, name).await?;
        let storage = self.bucket_storage_name(project, name);

        if self.driver.info().remote {
            self.driver.delete_bucket(&record).await?;
        } else {
            if let Err(e) = self.state.gateway.stop(&storage).await {
                warn!(bucket = %name, error = %e, "Failed stopping bucket service");
            }

            let vol = self.volume_handle(
                VolumeType::Bucket,
                ContentType::Filesystem,
                &storage,
                record.config.clone(),
            );
            if self.driver.has_volume(&vol).await? {
                if let Err(e) = self.driver.unmount_volume(&vol).await {
                    warn!(bucket = %name, error = %e, "Failed unmounting bucket volume");
                }
                self.driver.delete_volume(&vol).await?;
            }
        }

        for key in self
            .state
            .store
            .list_bucket_keys(project, &self.name, name)
            .await?
        {
            if let Err(e) = self
                .state
                .gateway
                .delete_service_account(&key.access_key)
                .await
            {
                warn!(bucket = %name, key = %key.name, error = %e, "Failed removing service account");
            }
            self.state
                .store
                .delete_bucket_key(project, &self.name, name, &key.name)
                .await?;
        }
        self.state.store.delete_bucket(project, &self.name, name).await?;

        self.emit(EventKind::BucketDeleted, project, name).await;
        Ok(())
    }

    /// Ensure the object service for a bucket is running on this member.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %name))]
    pub async fn activate_bucket(&self, project: &str, name: &str) -> Result<()> {
        self.is_status_ready().await?;
        let record = self.state.store.get_bucket(project, &self.name, name).await?;

        if self.driver.info().remote {
            return Ok(());
        }

        let storage = self.bucket_storage_name(project, name);
        let vol = self.volume_handle(
            VolumeType::Bucket,
            ContentType::Filesystem,
            &storage,
            record.config,
        );
        self.driver.mount_volume(&vol).await?;
        self.state
            .gateway
            .ensure_running(&storage, &vol.mount_path())
            .await
    }

    /// Client-facing URL of a bucket.
    pub async fn bucket_url(&self, project: &str, name: &str) -> Result<String> {
        self.state.store.get_bucket(project, &self.name, name).await?;

        let base = self.state.gateway.service_url();
        if base.is_empty() {
            return Err(StorageError::NotSupported(
                "No object storage endpoint available".to_string(),
            ));
        }
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            self.bucket_storage_name(project, name)
        ))
    }

    /// Adopt an existing bucket volume discovered on disk.
    ///
    /// Gateway service accounts scoped to the bucket come back as key
    /// records named after their access key. The gateway never hands out
    /// secrets, so recovered records carry an empty secret and the
    /// lowest role until an operator updates them.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %name))]
    pub async fn import_bucket(
        &self,
        project: &str,
        name: &str,
        config: HashMap<String, String>,
    ) -> Result<()> {
        self.is_status_ready().await?;
        validate_bucket_name(name)?;

        if self.state.store.get_bucket(project, &self.name, name).await.is_ok() {
            return Err(StorageError::conflict(format!(
                "A bucket named {name:?} already exists"
            )));
        }

        let storage = self.bucket_storage_name(project, name);
        let vol = self.volume_handle(
            VolumeType::Bucket,
            ContentType::Filesystem,
            &storage,
            config.clone(),
        );
        if !self.driver.has_volume(&vol).await? {
            return Err(StorageError::not_found(format!(
                "No bucket volume found on pool for {name:?}"
            )));
        }

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.state
                .store
                .create_bucket(BucketRecord {
                    project: project.to_string(),
                    pool: self.name.clone(),
                    name: name.to_string(),
                    description: String::new(),
                    config,
                    created_at: Utc::now(),
                })
                .await?;
            rollback.push(UndoAction::DeleteBucketRecord {
                project: project.to_string(),
                name: name.to_string(),
            });

            for access_key in self.state.gateway.list_service_accounts(&storage).await? {
                self.state
                    .store
                    .create_bucket_key(BucketKeyRecord {
                        project: project.to_string(),
                        pool: self.name.clone(),
                        bucket: name.to_string(),
                        name: access_key.clone(),
                        description: "Recovered from the object storage gateway".to_string(),
                        role: "read-only".to_string(),
                        access_key: access_key.clone(),
                        secret_key: String::new(),
                    })
                    .await?;
                rollback.push(UndoAction::DeleteBucketKeyRecord {
                    project: project.to_string(),
                    bucket: name.to_string(),
                    key: access_key,
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

        self.emit(EventKind::BucketCreated, project, name).await;
        Ok(())
    }

    /// Create a bucket key and its gateway service account.
    ///
    /// Empty `access_key`/`secret_key` are filled with generated values;
    /// the stored record carries whatever ends up active.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %bucket, key = %name))]
    pub async fn create_bucket_key(
        &self,
        project: &str,
        bucket: &str,
        name: &str,
        description: &str,
        role: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<BucketKeyRecord> {
        self.is_status_ready().await?;
        self.state.store.get_bucket(project, &self.name, bucket).await?;

        if self
            .state
            .store
            .get_bucket_key(project, &self.name, bucket, name)
            .await
            .is_ok()
        {
            return Err(StorageError::conflict(format!(
                "A key named {name:?} already exists on bucket {bucket:?}"
            )));
        }

        let record = BucketKeyRecord {
            project: project.to_string(),
            pool: self.name.clone(),
            bucket: bucket.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            role: if role.is_empty() {
                "read-only".to_string()
            } else {
                role.to_string()
            },
            access_key: if access_key.is_empty() {
                random_key(ACCESS_KEY_LEN)
            } else {
                access_key.to_string()
            },
            secret_key: if secret_key.is_empty() {
                random_key(SECRET_KEY_LEN)
            } else {
                secret_key.to_string()
            },
        };
        self.driver.validate_bucket_key(&record).await?;

        if self.driver.info().remote {
            self.driver.create_bucket_key(&record).await?;
            self.state.store.create_bucket_key(record.clone()).await?;
            self.emit(EventKind::BucketKeyCreated, project, name).await;
            return Ok(record);
        }

        self.activate_bucket(project, bucket).await?;
        let storage = self.bucket_storage_name(project, bucket);

        let mut rollback = Rollback::new();
        let staged: Result<()> = async {
            self.state.store.create_bucket_key(record.clone()).await?;
            rollback.push(UndoAction::DeleteBucketKeyRecord {
                project: project.to_string(),
                bucket: bucket.to_string(),
                key: name.to_string(),
            });

            self.state
                .gateway
                .put_service_account(
                    &storage,
                    &record.access_key,
                    &record.secret_key,
                    &record.role,
                )
                .await?;
            rollback.push(UndoAction::DeleteGatewayServiceAccount {
                access_key: record.access_key.clone(),
            });
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.run_undo(rollback).await;
            return Err(e);
        }
        rollback.disarm();

        self.emit(EventKind::BucketKeyCreated, project, name).await;
        Ok(record)
    }

    /// Update a bucket key's description or role.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %bucket, key = %name))]
    pub async fn update_bucket_key(
        &self,
        project: &str,
        bucket: &str,
        name: &str,
        new_description: &str,
        new_role: &str,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let mut record = self
            .state
            .store
            .get_bucket_key(project, &self.name, bucket, name)
            .await?;

        record.description = new_description.to_string();
        if !new_role.is_empty() {
            record.role = new_role.to_string();
        }
        self.driver.validate_bucket_key(&record).await?;

        if self.driver.info().remote {
            self.driver.update_bucket_key(&record).await?;
        } else {
            self.activate_bucket(project, bucket).await?;
            let storage = self.bucket_storage_name(project, bucket);
            self.state
                .gateway
                .put_service_account(
                    &storage,
                    &record.access_key,
                    &record.secret_key,
                    &record.role,
                )
                .await?;
        }

        self.state.store.update_bucket_key(record).await?;
        self.emit(EventKind::BucketKeyUpdated, project, name).await;
        Ok(())
    }

    /// Delete a bucket key and its gateway service account.
    #[instrument(skip_all, fields(pool = %self.name, project = %project, bucket = %bucket, key = %name))]
    pub async fn delete_bucket_key(
        &self,
        project: &str,
        bucket: &str,
        name: &str,
    ) -> Result<()> {
        self.is_status_ready().await?;
        let record = self
            .state
            .store
            .get_bucket_key(project, &self.name, bucket, name)
            .await?;

        if self.driver.info().remote {
            self.driver.delete_bucket_key(&record).await?;
        } else {
            self.state
                .gateway
                .delete_service_account(&record.access_key)
                .await?;
        }

        self.state
            .store
            .delete_bucket_key(project, &self.name, bucket, name)
            .await?;
        self.emit(EventKind::BucketKeyDeleted, project, name).await;
        Ok(())
    }
}
