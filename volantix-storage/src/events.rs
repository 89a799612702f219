//! In-memory log of storage lifecycle events.
//!
//! Every mutating operation records one event after its commit point. The
//! log is a bounded ring so a long-lived daemon cannot grow it without
//! limit; consumers poll recent entries for status surfaces and audit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PoolCreated,
    PoolUpdated,
    PoolDeleted,
    PoolMounted,
    PoolUnmounted,
    VolumeCreated,
    VolumeUpdated,
    VolumeRenamed,
    VolumeDeleted,
    VolumeRestored,
    VolumeMigrated,
    SnapshotCreated,
    SnapshotUpdated,
    SnapshotRenamed,
    SnapshotDeleted,
    ImageCached,
    ImageDeleted,
    BucketCreated,
    BucketUpdated,
    BucketDeleted,
    BucketKeyCreated,
    BucketKeyUpdated,
    BucketKeyDeleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::PoolCreated => "pool-created",
            EventKind::PoolUpdated => "pool-updated",
            EventKind::PoolDeleted => "pool-deleted",
            EventKind::PoolMounted => "pool-mounted",
            EventKind::PoolUnmounted => "pool-unmounted",
            EventKind::VolumeCreated => "volume-created",
            EventKind::VolumeUpdated => "volume-updated",
            EventKind::VolumeRenamed => "volume-renamed",
            EventKind::VolumeDeleted => "volume-deleted",
            EventKind::VolumeRestored => "volume-restored",
            EventKind::VolumeMigrated => "volume-migrated",
            EventKind::SnapshotCreated => "snapshot-created",
            EventKind::SnapshotUpdated => "snapshot-updated",
            EventKind::SnapshotRenamed => "snapshot-renamed",
            EventKind::SnapshotDeleted => "snapshot-deleted",
            EventKind::ImageCached => "image-cached",
            EventKind::ImageDeleted => "image-deleted",
            EventKind::BucketCreated => "bucket-created",
            EventKind::BucketUpdated => "bucket-updated",
            EventKind::BucketDeleted => "bucket-deleted",
            EventKind::BucketKeyCreated => "bucket-key-created",
            EventKind::BucketKeyUpdated => "bucket-key-updated",
            EventKind::BucketKeyDeleted => "bucket-key-deleted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub project: String,
    pub pool: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

/// Bounded ring of lifecycle events, newest at the back.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<RwLock<VecDeque<LifecycleEvent>>>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(256)))),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, evicting the oldest entry once full.
    pub async fn record(
        &self,
        kind: EventKind,
        project: &str,
        pool: &str,
        name: &str,
        details: HashMap<String, String>,
    ) -> LifecycleEvent {
        let event = LifecycleEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            project: project.to_string(),
            pool: pool.to_string(),
            name: name.to_string(),
            details,
        };

        debug!(kind = %kind, project = %project, pool = %pool, name = %name, "Lifecycle event");

        let mut log = self.inner.write().await;
        if log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(event.clone());
        event
    }

    /// Up to `limit` most recent events, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<LifecycleEvent> {
        let log = self.inner.read().await;
        log.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_recent() {
        let log = EventLog::new(8);
        log.record(EventKind::PoolCreated, "", "p1", "p1", HashMap::new())
            .await;
        log.record(
            EventKind::VolumeCreated,
            "default",
            "p1",
            "vol1",
            HashMap::new(),
        )
        .await;

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, EventKind::VolumeCreated);
        assert_eq!(recent[1].kind, EventKind::PoolCreated);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let log = EventLog::new(2);
        for name in ["a", "b", "c"] {
            log.record(EventKind::VolumeCreated, "default", "p1", name, HashMap::new())
                .await;
        }

        assert_eq!(log.len().await, 2);
        let recent = log.recent(10).await;
        assert_eq!(recent[0].name, "c");
        assert_eq!(recent[1].name, "b");
    }
}
