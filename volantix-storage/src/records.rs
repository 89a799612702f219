//! Record store for pools, volumes, buckets and bucket keys.
//!
//! The engine treats the store as the source of truth for what exists:
//! creations insert the record before touching storage and deletions remove
//! it last. [`VolumeStore`] abstracts the persistence layer; the in-memory
//! implementation backs tests and single-node deployments.
//!
//! Snapshot volumes are plain rows whose name carries the
//! `parent/snapshot` form, mirroring how they are addressed on disk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, StorageError};
use crate::types::{ContentType, PoolStatus, VolumeType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    pub status: PoolStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub project: String,
    pub pool: String,
    /// Full volume name. Snapshots use the `parent/snapshot` form.
    pub name: String,
    pub vol_type: VolumeType,
    pub content_type: ContentType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Expiry for snapshot volumes with a retention policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl VolumeRecord {
    pub fn new(
        project: &str,
        pool: &str,
        name: &str,
        vol_type: VolumeType,
        content_type: ContentType,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            project: project.to_string(),
            pool: pool.to_string(),
            name: name.to_string(),
            vol_type,
            content_type,
            description: String::new(),
            config,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        crate::types::is_snapshot_name(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub project: String,
    pub pool: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketKeyRecord {
    pub project: String,
    pub pool: String,
    pub bucket: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Either `admin` or `read-only`.
    pub role: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Persistence interface for storage records.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn create_pool(&self, record: PoolRecord) -> Result<()>;
    async fn get_pool(&self, name: &str) -> Result<PoolRecord>;
    async fn update_pool(&self, record: PoolRecord) -> Result<()>;
    async fn delete_pool(&self, name: &str) -> Result<()>;
    async fn list_pools(&self) -> Result<Vec<PoolRecord>>;

    async fn create_volume(&self, record: VolumeRecord) -> Result<()>;
    async fn get_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<VolumeRecord>;
    async fn volume_exists(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<bool>;
    async fn update_volume(&self, record: VolumeRecord) -> Result<()>;
    async fn rename_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        from: &str,
        to: &str,
    ) -> Result<()>;
    async fn delete_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<()>;
    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeRecord>>;
    async fn list_volumes_by_type(
        &self,
        pool: &str,
        vol_type: VolumeType,
    ) -> Result<Vec<VolumeRecord>>;
    /// Snapshot rows of one parent volume, oldest first.
    async fn list_snapshots(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        parent: &str,
    ) -> Result<Vec<VolumeRecord>>;

    async fn create_bucket(&self, record: BucketRecord) -> Result<()>;
    async fn get_bucket(&self, project: &str, pool: &str, name: &str) -> Result<BucketRecord>;
    async fn update_bucket(&self, record: BucketRecord) -> Result<()>;
    async fn delete_bucket(&self, project: &str, pool: &str, name: &str) -> Result<()>;
    async fn list_buckets(&self, pool: &str) -> Result<Vec<BucketRecord>>;

    async fn create_bucket_key(&self, record: BucketKeyRecord) -> Result<()>;
    async fn get_bucket_key(
        &self,
        project: &str,
        pool: &str,
        bucket: &str,
        name: &str,
    ) -> Result<BucketKeyRecord>;
    async fn update_bucket_key(&self, record: BucketKeyRecord) -> Result<()>;
    async fn delete_bucket_key(
        &self,
        project: &str,
        pool: &str,
        bucket: &str,
        name: &str,
    ) -> Result<()>;
    async fn list_bucket_keys(
        &self,
        project: &str,
        pool: &str,
        bucket: &str,
    ) -> Result<Vec<BucketKeyRecord>>;
}

type VolumeKey = (String, String, VolumeType, String);
type BucketKey = (String, String, String);
type AccessKeyKey = (String, String, String, String);

#[derive(Debug, Default)]
struct StoreInner {
    pools: HashMap<String, PoolRecord>,
    volumes: HashMap<VolumeKey, VolumeRecord>,
    buckets: HashMap<BucketKey, BucketRecord>,
    bucket_keys: HashMap<AccessKeyKey, BucketKeyRecord>,
}

/// In-memory [`VolumeStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryVolumeStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn volume_key(project: &str, pool: &str, vol_type: VolumeType, name: &str) -> VolumeKey {
    (
        project.to_string(),
        pool.to_string(),
        vol_type,
        name.to_string(),
    )
}

#[async_trait]
impl VolumeStore for MemoryVolumeStore {
    async fn create_pool(&self, record: PoolRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.pools.contains_key(&record.name) {
            return Err(StorageError::conflict(format!(
                "Storage pool {:?} already exists",
                record.name
            )));
        }
        inner.pools.insert(record.name.clone(), record);
        Ok(())
    }

    async fn get_pool(&self, name: &str) -> Result<PoolRecord> {
        self.inner
            .read()
            .await
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("Storage pool {name:?} not found")))
    }

    async fn update_pool(&self, record: PoolRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.pools.contains_key(&record.name) {
            return Err(StorageError::not_found(format!(
                "Storage pool {:?} not found",
                record.name
            )));
        }
        inner.pools.insert(record.name.clone(), record);
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(format!("Storage pool {name:?} not found")))
    }

    async fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        let inner = self.inner.read().await;
        let mut pools: Vec<PoolRecord> = inner.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }

    async fn create_volume(&self, record: VolumeRecord) -> Result<()> {
        let key = volume_key(&record.project, &record.pool, record.vol_type, &record.name);
        let mut inner = self.inner.write().await;
        if inner.volumes.contains_key(&key) {
            return Err(StorageError::conflict(format!(
                "Storage volume {:?} already exists",
                record.name
            )));
        }
        inner.volumes.insert(key, record);
        Ok(())
    }

    async fn get_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<VolumeRecord> {
        self.inner
            .read()
            .await
            .volumes
            .get(&volume_key(project, pool, vol_type, name))
            .cloned()
            .ok_or_else(|| {
                StorageError::not_found(format!("Storage volume {name:?} not found"))
            })
    }

    async fn volume_exists(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .volumes
            .contains_key(&volume_key(project, pool, vol_type, name)))
    }

    async fn update_volume(&self, record: VolumeRecord) -> Result<()> {
        let key = volume_key(&record.project, &record.pool, record.vol_type, &record.name);
        let mut inner = self.inner.write().await;
        if !inner.volumes.contains_key(&key) {
            return Err(StorageError::not_found(format!(
                "Storage volume {:?} not found",
                record.name
            )));
        }
        inner.volumes.insert(key, record);
        Ok(())
    }

    async fn rename_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let to_key = volume_key(project, pool, vol_type, to);
        if inner.volumes.contains_key(&to_key) {
            return Err(StorageError::conflict(format!(
                "Storage volume {to:?} already exists"
            )));
        }

        let mut record = inner
            .volumes
            .remove(&volume_key(project, pool, vol_type, from))
            .ok_or_else(|| {
                StorageError::not_found(format!("Storage volume {from:?} not found"))
            })?;
        record.name = to.to_string();
        inner.volumes.insert(to_key, record);
        Ok(())
    }

    async fn delete_volume(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        name: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .volumes
            .remove(&volume_key(project, pool, vol_type, name))
            .map(|_| ())
            .ok_or_else(|| {
                StorageError::not_found(format!("Storage volume {name:?} not found"))
            })
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeRecord>> {
        let inner = self.inner.read().await;
        let mut volumes: Vec<VolumeRecord> = inner
            .volumes
            .values()
            .filter(|v| v.pool == pool)
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn list_volumes_by_type(
        &self,
        pool: &str,
        vol_type: VolumeType,
    ) -> Result<Vec<VolumeRecord>> {
        let inner = self.inner.read().await;
        let mut volumes: Vec<VolumeRecord> = inner
            .volumes
            .values()
            .filter(|v| v.pool == pool && v.vol_type == vol_type)
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn list_snapshots(
        &self,
        project: &str,
        pool: &str,
        vol_type: VolumeType,
        parent: &str,
    ) -> Result<Vec<VolumeRecord>> {
        let prefix = format!("{parent}{}", crate::types::SNAPSHOT_SEPARATOR);
        let inner = self.inner.read().await;
        let mut snapshots: Vec<VolumeRecord> = inner
            .volumes
            .values()
            .filter(|v| {
                v.project == project
                    && v.pool == pool
                    && v.vol_type == vol_type
                    && v.name.starts_with(&prefix)
            })
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(snapshots)
    }

    async fn create_bucket(&self, record: BucketRecord) -> Result<()> {
        let key = (
            record.project.clone(),
            record.pool.clone(),
            record.name.clone(),
        );
        let mut inner = self.inner.write().await;
        if inner.buckets.contains_key(&key) {
            return Err(StorageError::conflict(format!(
                "Storage bucket {:?} already exists",
                record.name
            )));
        }
        inner.buckets.insert(key, record);
        Ok(())
    }

    async fn get_bucket(&self, project: &str, pool: &str, name: &str) -> Result<BucketRecord> {
        self.inner
            .read()
            .await
            .buckets
            .get(&(project.to_string(), pool.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                StorageError::not_found(format!("Storage bucket {name:?} not found"))
            })
    }

    async fn update_bucket(&self, record: BucketRecord) -> Result<()> {
        let key = (
            record.project.clone(),
            record.pool.clone(),
            record.name.clone(),
        );
        let mut inner = self.inner.write().await;
        if !inner.buckets.contains_key(&key) {
            return Err(StorageError::not_found(format!(
                "Storage bucket {:?} not found",
                record.name
            )));
        }
        inner.buckets.insert(key, record);
        Ok(())
    }

    async fn delete_bucket(&self, project: &str, pool: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .buckets
            .remove(&(project.to_string(), pool.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| {
                StorageError::not_found(format!("Storage bucket {name:?} not found"))
            })?;
        inner
            .bucket_keys
            .retain(|(p, pl, b, _), _| !(p == project && pl == pool && b == name));
        Ok(())
    }

    async fn list_buckets(&self, pool: &str) -> Result<Vec<BucketRecord>> {
        let inner = self.inner.read().await;
        let mut buckets: Vec<BucketRecord> = inner
            .buckets
            .values()
            .filter(|b| b.pool == pool)
            .cloned()
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn create_bucket_key(&self, record: BucketKeyRecord) -> Result<()> {
        let key = (
            record.project.clone(),
            record.pool.clone(),
            record.bucket.clone(),
            record.name.clone(),
        );
        let mut inner = self.inner.write().await;
        if inner.bucket_keys.contains_key(&key) {
            return Err(StorageError::conflict(format!(
                "Bucket key {:?} already exists",
                record.name
            )));
        }
        inner.bucket_keys.insert(key, record);
        Ok(())
    }

    async fn get_bucket_key(
        &self,
        project: &str,
        pool: &str,
        bucket: &str,
        name: &str,
    ) -> Result<BucketKeyRecord> {
        self.inner
            .read()
            .await
            .bucket_keys
            .get(&(
                project.to_string(),
                pool.to_string(),
                bucket.to_string(),
                name.to_string(),
            ))
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("Bucket key {name:?} not found")))
    }

    async fn update_bucket_key(&self, record: BucketKeyRecord) -> Result<()> {
        let key = (
            record.project.clone(),
            record.pool.clone(),
            record.bucket.clone(),
            record.name.clone(),
        );
        let mut inner = self.inner.write().await;
        if !inner.bucket_keys.contains_key(&key) {
            return Err(StorageError::not_found(format!(
                "Bucket key {:?} not found",
                record.name
            )));
        }
        inner.bucket_keys.insert(key, record);
        Ok(())
    }

    async fn delete_bucket_key(
        &self,
        project: &str,
        pool: &str,
        bucket: &str,
        name: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .bucket_keys
            .remove(&(
                project.to_string(),
                pool.to_string(),
                bucket.to_string(),
                name.to_string(),
            ))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(format!("Bucket key {name:?} not found")))
    }

    async fn list_bucket_keys(
        &self,
        project: &str,
        pool: &str,
        bucket: &str,
    ) -> Result<Vec<BucketKeyRecord>> {
        let inner = self.inner.read().await;
        let mut keys: Vec<BucketKeyRecord> = inner
            .bucket_keys
            .values()
            .filter(|k| k.project == project && k.pool == pool && k.bucket == bucket)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn volume(name: &str) -> VolumeRecord {
        VolumeRecord::new(
            "default",
            "p1",
            name,
            VolumeType::Custom,
            ContentType::Filesystem,
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_volume_crud() {
        let store = MemoryVolumeStore::new();
        store.create_volume(volume("vol1")).await.unwrap();

        let err = store.create_volume(volume("vol1")).await.unwrap_err();
        assert!(err.is_conflict());

        let fetched = store
            .get_volume("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap();
        assert_eq!(fetched.name, "vol1");

        store
            .rename_volume("default", "p1", VolumeType::Custom, "vol1", "vol2")
            .await
            .unwrap();
        assert!(!store
            .volume_exists("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap());

        store
            .delete_volume("default", "p1", VolumeType::Custom, "vol2")
            .await
            .unwrap();
        let err = store
            .get_volume("default", "p1", VolumeType::Custom, "vol2")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_snapshots_listed_oldest_first() {
        let store = MemoryVolumeStore::new();
        store.create_volume(volume("vol1")).await.unwrap();

        let mut newer = volume("vol1/snap1");
        newer.created_at = Utc::now();
        let mut older = volume("vol1/snap0");
        older.created_at = Utc::now() - Duration::hours(2);
        store.create_volume(newer).await.unwrap();
        store.create_volume(older).await.unwrap();

        let snapshots = store
            .list_snapshots("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "vol1/snap0");
        assert_eq!(snapshots[1].name, "vol1/snap1");
    }

    #[tokio::test]
    async fn test_snapshot_listing_ignores_other_parents() {
        let store = MemoryVolumeStore::new();
        store.create_volume(volume("vol1")).await.unwrap();
        store.create_volume(volume("vol10")).await.unwrap();
        store.create_volume(volume("vol1/snap0")).await.unwrap();
        store.create_volume(volume("vol10/snap0")).await.unwrap();

        let snapshots = store
            .list_snapshots("default", "p1", VolumeType::Custom, "vol1")
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "vol1/snap0");
    }

    #[tokio::test]
    async fn test_bucket_delete_drops_keys() {
        let store = MemoryVolumeStore::new();
        store
            .create_bucket(BucketRecord {
                project: "default".to_string(),
                pool: "p1".to_string(),
                name: "b1".to_string(),
                description: String::new(),
                config: HashMap::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .create_bucket_key(BucketKeyRecord {
                project: "default".to_string(),
                pool: "p1".to_string(),
                bucket: "b1".to_string(),
                name: "admin".to_string(),
                description: String::new(),
                role: "admin".to_string(),
                access_key: "AK".to_string(),
                secret_key: "SK".to_string(),
            })
            .await
            .unwrap();

        store.delete_bucket("default", "p1", "b1").await.unwrap();
        let keys = store.list_bucket_keys("default", "p1", "b1").await.unwrap();
        assert!(keys.is_empty());
    }
}
