//! Named advisory locks for cross-task serialization.
//!
//! Some operations must not overlap even when they enter through different
//! API paths, such as two callers racing to unpack the same image onto a
//! pool. Those paths take an advisory lock keyed by a well-known name and
//! hold it for the duration of the critical section. The guard releases the
//! lock on drop and the name is forgotten once nobody else is waiting on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::{ContentType, VolumeType};

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Registry of named asynchronous locks.
#[derive(Debug, Default, Clone)]
pub struct AdvisoryLocks {
    inner: LockMap,
}

/// Holds a named lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        forget_if_unused(&self.locks, &self.name);
    }
}

/// Drops the entry for `name` once nothing holds or waits on it.
fn forget_if_unused(locks: &LockMap, name: &str) {
    let mut map = locks.lock().unwrap_or_else(PoisonError::into_inner);
    let release = map
        .get(name)
        .map(|entry| Arc::strong_count(entry) == 1)
        .unwrap_or(false);
    if release {
        map.remove(name);
    }
}

/// Release check for a wait dropped before acquiring, as on timeout or
/// task abort. The abandoned future releases its entry reference without
/// a guard drop, so the map sweep runs from here.
struct WaitCleanup<'a> {
    name: &'a str,
    locks: &'a LockMap,
    armed: bool,
}

impl Drop for WaitCleanup<'_> {
    fn drop(&mut self) {
        if self.armed {
            forget_if_unused(self.locks, self.name);
        }
    }
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock with the given name, waiting for any current holder.
    pub async fn lock(&self, name: &str) -> LockGuard {
        // A wait dropped at the await point releases its entry reference
        // without a guard drop; the cleanup runs the release check instead.
        let mut cleanup = WaitCleanup {
            name,
            locks: &self.inner,
            armed: true,
        };

        let entry = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = entry.lock_owned().await;
        cleanup.armed = false;

        LockGuard {
            name: name.to_string(),
            locks: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Acquire the lock, giving up after `timeout`.
    pub async fn try_lock_timeout(
        &self,
        name: &str,
        timeout: std::time::Duration,
    ) -> crate::error::Result<LockGuard> {
        tokio::time::timeout(timeout, self.lock(name))
            .await
            .map_err(|_| {
                crate::error::StorageError::unavailable(format!(
                    "Timed out waiting for lock {name:?}"
                ))
            })
    }

    #[cfg(test)]
    fn active_names(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Lock name covering one operation on one volume of one pool.
pub fn operation_lock_name(
    operation: &str,
    pool: &str,
    vol_type: VolumeType,
    content_type: ContentType,
    volume: &str,
) -> String {
    format!("{operation}/{pool}/{vol_type}/{content_type}/{volume}")
}

/// Lock serializing image cache population for one image.
pub fn ensure_image_lock_name(fingerprint: &str) -> String {
    format!("EnsureImage/{fingerprint}")
}

/// Lock serializing image cache removal for one image.
pub fn delete_image_lock_name(fingerprint: &str) -> String {
    format!("DeleteImage/{fingerprint}")
}

/// Lock serializing snapshot operations on one volume.
pub fn snapshot_lock_name(
    operation: &str,
    pool: &str,
    vol_type: VolumeType,
    content_type: ContentType,
    volume: &str,
) -> String {
    operation_lock_name(operation, pool, vol_type, content_type, volume)
}
