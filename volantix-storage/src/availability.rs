//! Tracks which pools are currently unusable.
//!
//! A pool whose backing storage fails to mount is marked unavailable so
//! that volume operations can refuse early instead of timing out against
//! dead storage. A successful mount clears the mark. The tracker is shared
//! by every engine instance that manages pools on this host.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Default, Clone)]
pub struct PoolAvailabilityTracker {
    unavailable: Arc<RwLock<HashSet<String>>>,
}

impl PoolAvailabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a pool's backing storage is unusable. Returns true when
    /// the pool was not already marked.
    pub async fn mark_unavailable(&self, pool: &str) -> bool {
        let newly_marked = self.unavailable.write().await.insert(pool.to_string());
        if newly_marked {
            warn!(pool = %pool, "Storage pool marked unavailable");
        }
        newly_marked
    }

    /// Clear the unavailable mark after a successful mount.
    pub async fn mark_available(&self, pool: &str) {
        let was_marked = self.unavailable.write().await.remove(pool);
        if was_marked {
            info!(pool = %pool, "Storage pool available again");
        }
    }

    pub async fn is_unavailable(&self, pool: &str) -> bool {
        self.unavailable.read().await.contains(pool)
    }

    /// Sorted names of every pool currently marked unavailable.
    pub async fn snapshot(&self) -> Vec<String> {
        let mut pools: Vec<String> = self.unavailable.read().await.iter().cloned().collect();
        pools.sort();
        pools
    }
}
