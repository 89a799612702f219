//! Reversal records for multi-step operations.
//!
//! Operations that touch both records and physical storage push one
//! [`UndoAction`] per completed step. On failure the engine replays the
//! pending actions newest-first; on success the list is disarmed and
//! dropped. Failures during replay are logged and skipped so that every
//! remaining action still gets its chance to run.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::records::{PoolRecord, VolumeRecord};
use crate::types::{ContentType, VolumeType};

/// A single reversible step of an operation.
///
/// Each variant carries everything the engine needs to reverse the step
/// without consulting the state that the failed operation may have left
/// behind.
#[derive(Debug, Clone)]
pub enum UndoAction {
    /// Remove a volume record created by the operation.
    DeleteVolumeRecord {
        project: String,
        vol_type: VolumeType,
        name: String,
    },
    /// Restore a volume record to its pre-operation contents.
    RestoreVolumeRecord { record: VolumeRecord },
    /// Rename a volume record back to its previous name.
    RenameVolumeRecord {
        project: String,
        vol_type: VolumeType,
        from: String,
        to: String,
    },
    /// Delete a physical volume created by the operation.
    DeletePhysicalVolume {
        vol_type: VolumeType,
        content_type: ContentType,
        storage_name: String,
        config: HashMap<String, String>,
    },
    /// Rename a physical volume back to its previous name.
    RenamePhysicalVolume {
        vol_type: VolumeType,
        content_type: ContentType,
        from: String,
        to: String,
        config: HashMap<String, String>,
    },
    /// Remove a pool record created by the operation.
    DeletePoolRecord { name: String },
    /// Remove pool storage created by the operation.
    DeletePhysicalPool { name: String },
    /// Restore a pool record to its pre-operation contents.
    RestorePoolRecord { record: PoolRecord },
    /// Remove a bucket record created by the operation.
    DeleteBucketRecord { project: String, name: String },
    /// Remove a bucket access-key record created by the operation.
    DeleteBucketKeyRecord {
        project: String,
        bucket: String,
        key: String,
    },
    /// Remove a bucket created on the local object gateway.
    DeleteGatewayBucket { storage_name: String },
    /// Remove a service account created on the local object gateway.
    DeleteGatewayServiceAccount { access_key: String },
    /// Remove a symlink created by the operation.
    RemoveSymlink { link: PathBuf },
    /// Recreate a symlink removed by the operation.
    EnsureSymlink { link: PathBuf, target: PathBuf },
    /// Retract an access record registered with the authorizer.
    RevokeAuthorizer {
        project: String,
        vol_type: VolumeType,
        name: String,
    },
}

/// Ordered list of reversal records for one operation.
#[derive(Debug, Default)]
pub struct Rollback {
    actions: Vec<UndoAction>,
    armed: bool,
}

impl Rollback {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            armed: true,
        }
    }

    /// Record a completed step.
    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// Mark the operation as successful. Pending actions are discarded.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Consume the list, yielding pending actions newest-first. Returns
    /// nothing once disarmed.
    pub fn take_pending(self) -> Vec<UndoAction> {
        if !self.armed {
            return Vec::new();
        }

        let mut actions = self.actions;
        actions.reverse();
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_actions_are_newest_first() {
        let mut undo = Rollback::new();
        undo.push(UndoAction::DeleteVolumeRecord {
            project: "default".to_string(),
            vol_type: VolumeType::Custom,
            name: "vol1".to_string(),
        });
        undo.push(UndoAction::RemoveSymlink {
            link: PathBuf::from("/var/lib/volantix/containers/c1"),
        });

        let pending = undo.take_pending();
        assert_eq!(pending.len(), 2);
        assert!(matches!(pending[0], UndoAction::RemoveSymlink { .. }));
        assert!(matches!(
            pending[1],
            UndoAction::DeleteVolumeRecord { .. }
        ));
    }

    #[test]
    fn test_disarm_discards_actions() {
        let mut undo = Rollback::new();
        undo.push(UndoAction::DeletePoolRecord {
            name: "p1".to_string(),
        });
        undo.disarm();
        assert!(undo.take_pending().is_empty());
    }
}
