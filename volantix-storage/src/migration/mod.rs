//! Volume migration protocol.
//!
//! A migration pairs a source driver with a target driver over in-memory
//! byte transports:
//!
//! ```text
//!   source backend                     target backend
//!   --------------                     --------------
//!   offer types     -- match_types --> chosen type
//!   index header    ---- conn #1 ----> validate, maybe override refresh
//!   ack response    <--- conn #1 -----
//!   volume data     ---- conn #2 ----> driver receive
//! ```
//!
//! The index header is one JSON frame ended by shutting down the write
//! side; the acknowledgement flows back the same way. Volume data then
//! moves over its own connection. [`run_paired`] supervises both sides and
//! tears the peer down on the first failure.

pub mod pipe;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::{self, Either};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::backup::BackupConfig;
use crate::error::{Result, StorageError};
use crate::types::ContentType;

pub use pipe::{pipe_pair, MigrationConn, DEFAULT_PIPE_CAPACITY};

/// Current index header version. Version 0 peers skip the exchange.
pub const INDEX_HEADER_VERSION: u32 = 1;

/// How volume payload bytes are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferProtocol {
    /// Driver-native stream, only meaningful between equal drivers.
    Native,
    /// Generic file-level sync, any driver can produce and consume it.
    Filesync,
    /// Generic block-level diff stream.
    Blockdiff,
}

impl std::fmt::Display for TransferProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferProtocol::Native => write!(f, "native"),
            TransferProtocol::Filesync => write!(f, "filesync"),
            TransferProtocol::Blockdiff => write!(f, "blockdiff"),
        }
    }
}

/// One transfer offer: a protocol plus the feature flags usable with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationType {
    pub protocol: TransferProtocol,
    #[serde(default)]
    pub features: Vec<String>,
}

impl MigrationType {
    pub fn new(protocol: TransferProtocol, features: Vec<String>) -> Self {
        Self { protocol, features }
    }
}

/// Protocol used when the peer offered nothing usable for negotiation.
pub fn fallback_migration_type(content_type: ContentType) -> MigrationType {
    match content_type {
        ContentType::Filesystem => MigrationType::new(TransferProtocol::Filesync, Vec::new()),
        ContentType::Block | ContentType::Iso => {
            MigrationType::new(TransferProtocol::Blockdiff, Vec::new())
        }
    }
}

/// Pick the transfer type both sides support.
///
/// The source's preference order is authoritative; the feature set is the
/// intersection for the chosen protocol. An empty `offer` means a legacy
/// peer and falls back to `fallback` when we support it.
pub fn match_types(
    offer: &[MigrationType],
    fallback: TransferProtocol,
    ours: &[MigrationType],
) -> Result<MigrationType> {
    if offer.is_empty() {
        return ours
            .iter()
            .find(|m| m.protocol == fallback)
            .cloned()
            .ok_or_else(|| {
                StorageError::Migration(format!(
                    "Fallback migration type {fallback} not supported"
                ))
            });
    }

    for offered in offer {
        let Some(supported) = ours.iter().find(|m| m.protocol == offered.protocol) else {
            continue;
        };

        let features = offered
            .features
            .iter()
            .filter(|f| supported.features.contains(f))
            .cloned()
            .collect();
        return Ok(MigrationType {
            protocol: offered.protocol,
            features,
        });
    }

    Err(StorageError::Migration(format!(
        "No matching migration types between source ({:?}) and target ({:?})",
        offer.iter().map(|m| m.protocol).collect::<Vec<_>>(),
        ours.iter().map(|m| m.protocol).collect::<Vec<_>>(),
    )))
}

/// Index header sent by the source before volume data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationInfo {
    /// Source-side descriptor of the volume being sent, including its
    /// snapshot records.
    pub config: BackupConfig,
}

/// Acknowledgement returned by the target for an index header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Target's override of the refresh mode, set when the source asked for
    /// a refresh but the target volume is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<bool>,
}

impl InfoResponse {
    pub fn ok(refresh: Option<bool>) -> Self {
        Self {
            status_code: 200,
            error: None,
            refresh,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Source side of the index header exchange: send the header, wait for the
/// acknowledgement.
pub async fn send_index_header(
    conn: &mut MigrationConn,
    version: u32,
    info: &MigrationInfo,
) -> Result<InfoResponse> {
    if version == 0 {
        return Ok(InfoResponse::ok(None));
    }

    let frame = serde_json::to_vec(info)
        .map_err(|e| StorageError::Migration(format!("Failed encoding index header: {e}")))?;
    conn.write_all(&frame)
        .await
        .map_err(|e| StorageError::Migration(format!("Failed sending index header: {e}")))?;
    conn.shutdown()
        .await
        .map_err(|e| StorageError::Migration(format!("Failed ending index header: {e}")))?;

    let mut raw = Vec::new();
    conn.read_to_end(&mut raw)
        .await
        .map_err(|e| StorageError::Migration(format!("Failed reading header response: {e}")))?;
    let response: InfoResponse = serde_json::from_slice(&raw)
        .map_err(|e| StorageError::Migration(format!("Failed decoding header response: {e}")))?;

    if !response.is_success() {
        return Err(StorageError::Migration(format!(
            "Migration target rejected the index header: {}",
            response.error.as_deref().unwrap_or("unknown error")
        )));
    }

    debug!(refresh = ?response.refresh, "Index header acknowledged");
    Ok(response)
}

/// Target side, first half: read the source's index header.
pub async fn receive_index_header(
    conn: &mut MigrationConn,
    version: u32,
) -> Result<Option<MigrationInfo>> {
    if version == 0 {
        return Ok(None);
    }

    let mut raw = Vec::new();
    conn.read_to_end(&mut raw)
        .await
        .map_err(|e| StorageError::Migration(format!("Failed reading index header: {e}")))?;
    let info: MigrationInfo = serde_json::from_slice(&raw)
        .map_err(|e| StorageError::Migration(format!("Failed decoding index header: {e}")))?;
    Ok(Some(info))
}

/// Target side, second half: acknowledge the index header.
pub async fn respond_index_header(
    conn: &mut MigrationConn,
    response: &InfoResponse,
) -> Result<()> {
    let frame = serde_json::to_vec(response)
        .map_err(|e| StorageError::Migration(format!("Failed encoding header response: {e}")))?;
    conn.write_all(&frame)
        .await
        .map_err(|e| StorageError::Migration(format!("Failed sending header response: {e}")))?;
    conn.shutdown()
        .await
        .map_err(|e| StorageError::Migration(format!("Failed ending header response: {e}")))
}

/// Arguments for the sending driver.
#[derive(Debug, Clone)]
pub struct VolumeSourceArgs {
    pub index_header_version: u32,
    /// Storage-level volume name.
    pub name: String,
    /// Leaf snapshot names to send, oldest first.
    pub snapshots: Vec<String>,
    pub migration_type: MigrationType,
    /// Send only the parent volume, no snapshots.
    pub volume_only: bool,
    /// Incremental sync into an existing target volume.
    pub refresh: bool,
    /// Allow copying from a running instance without freezing it.
    pub allow_inconsistent: bool,
    /// The volume is moving between members of one cluster.
    pub cluster_move: bool,
}

/// Arguments for the receiving driver.
#[derive(Debug, Clone)]
pub struct VolumeTargetArgs {
    pub index_header_version: u32,
    /// Storage-level volume name.
    pub name: String,
    pub description: String,
    pub config: HashMap<String, String>,
    /// Leaf snapshot names expected, oldest first.
    pub snapshots: Vec<String>,
    pub migration_type: MigrationType,
    /// Incremental sync into an existing volume.
    pub refresh: bool,
    /// Size hint taken from the source volume.
    pub volume_size: Option<u64>,
    pub volume_only: bool,
    pub cluster_move: bool,
}

/// Snapshot identity used for refresh reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSnapshot {
    /// Leaf snapshot name.
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Work out which snapshots a refresh must transfer and which the target
/// must drop first.
///
/// A target snapshot survives only when the source has one with the same
/// name and creation time; all others are returned as delete indexes. Source
/// snapshots without a surviving counterpart are returned as sync indexes.
/// With `exclude_older` set, source snapshots strictly older than the newest
/// surviving common snapshot are skipped.
pub fn compare_snapshots(
    source: &[ComparableSnapshot],
    target: &[ComparableSnapshot],
    exclude_older: bool,
) -> (Vec<usize>, Vec<usize>) {
    let mut delete_indexes = Vec::new();
    let mut surviving_newest: Option<DateTime<Utc>> = None;

    for (i, target_snap) in target.iter().enumerate() {
        let survives = source
            .iter()
            .any(|s| s.name == target_snap.name && s.created_at == target_snap.created_at);
        if survives {
            if surviving_newest.map_or(true, |newest| target_snap.created_at > newest) {
                surviving_newest = Some(target_snap.created_at);
            }
        } else {
            delete_indexes.push(i);
        }
    }

    let mut sync_indexes = Vec::new();
    for (i, source_snap) in source.iter().enumerate() {
        let survives = target
            .iter()
            .any(|t| t.name == source_snap.name && t.created_at == source_snap.created_at);
        if survives {
            continue;
        }

        if exclude_older {
            if let Some(newest) = surviving_newest {
                if source_snap.created_at < newest {
                    continue;
                }
            }
        }

        sync_indexes.push(i);
    }

    (sync_indexes, delete_indexes)
}

/// Run the two sides of a migration, tearing the peer down on the first
/// failure.
///
/// Both futures are spawned as tasks. If one finishes with an error the
/// other is aborted, which drops its transport endpoint and unblocks any
/// pending I/O. Success requires both sides to finish cleanly.
pub async fn run_paired<S, T>(source: S, target: T) -> Result<()>
where
    S: std::future::Future<Output = Result<()>> + Send + 'static,
    T: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let source_task = tokio::spawn(source);
    let target_task = tokio::spawn(target);

    let (first, first_side, other_task, other_side) =
        match future::select(source_task, target_task).await {
            Either::Left((res, target_task)) => (res, "source", target_task, "target"),
            Either::Right((res, source_task)) => (res, "target", source_task, "source"),
        };

    match flatten(first, first_side) {
        Ok(()) => flatten(other_task.await, other_side),
        Err(e) => {
            other_task.abort();
            let _ = other_task.await;
            Err(e)
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>, side: &str) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StorageError::Migration(format!("Migration {side} failed: {e}"))),
        Err(e) if e.is_cancelled() => Err(StorageError::Migration(format!(
            "Migration {side} was cancelled"
        ))),
        Err(e) => Err(StorageError::Migration(format!(
            "Migration {side} panicked: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snap(name: &str, age_hours: i64) -> ComparableSnapshot {
        ComparableSnapshot {
            name: name.to_string(),
            created_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[test]
    fn test_match_types_prefers_source_order() {
        let offer = vec![
            MigrationType::new(TransferProtocol::Native, vec!["a".to_string()]),
            MigrationType::new(TransferProtocol::Filesync, vec!["x".to_string()]),
        ];
        let ours = vec![
            MigrationType::new(TransferProtocol::Filesync, vec!["x".to_string()]),
            MigrationType::new(
                TransferProtocol::Native,
                vec!["a".to_string(), "b".to_string()],
            ),
        ];

        let chosen = match_types(&offer, TransferProtocol::Filesync, &ours).unwrap();
        assert_eq!(chosen.protocol, TransferProtocol::Native);
        assert_eq!(chosen.features, vec!["a".to_string()]);
    }

    #[test]
    fn test_match_types_empty_offer_uses_fallback() {
        let ours = vec![MigrationType::new(TransferProtocol::Filesync, Vec::new())];
        let chosen = match_types(&[], TransferProtocol::Filesync, &ours).unwrap();
        assert_eq!(chosen.protocol, TransferProtocol::Filesync);
    }

    #[test]
    fn test_match_types_disjoint_fails() {
        let offer = vec![MigrationType::new(TransferProtocol::Native, Vec::new())];
        let ours = vec![MigrationType::new(TransferProtocol::Filesync, Vec::new())];
        let err = match_types(&offer, TransferProtocol::Filesync, &ours).unwrap_err();
        assert!(matches!(err, StorageError::Migration(_)));
    }

    #[test]
    fn test_compare_snapshots_divergent_target() {
        let source = vec![snap("snap0", 10), snap("snap1", 5)];
        // Same name as source snap1 but different creation time, plus one
        // snapshot the source never had.
        let target = vec![snap("snap1", 4), snap("snap2", 2)];

        let (sync, delete) = compare_snapshots(&source, &target, false);
        assert_eq!(sync, vec![0, 1]);
        assert_eq!(delete, vec![0, 1]);
    }

    #[test]
    fn test_compare_snapshots_idempotent_when_in_sync() {
        let common = vec![snap("snap0", 10), snap("snap1", 5)];
        let (sync, delete) = compare_snapshots(&common, &common, true);
        assert!(sync.is_empty());
        assert!(delete.is_empty());
    }

    #[test]
    fn test_compare_snapshots_exclude_older() {
        let shared = snap("snap1", 5);
        let source = vec![snap("snap0", 10), shared.clone(), snap("snap2", 1)];
        let target = vec![shared];

        let (sync, delete) = compare_snapshots(&source, &target, true);
        // snap0 predates the newest common snapshot and is skipped.
        assert_eq!(sync, vec![2]);
        assert!(delete.is_empty());

        let (sync_all, _) = compare_snapshots(&source, &target, false);
        assert_eq!(sync_all, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_index_header_exchange() {
        let (mut source_conn, mut target_conn) = pipe_pair(1024);

        let source = tokio::spawn(async move {
            let info = MigrationInfo::default();
            send_index_header(&mut source_conn, INDEX_HEADER_VERSION, &info).await
        });

        let received = receive_index_header(&mut target_conn, INDEX_HEADER_VERSION)
            .await
            .unwrap();
        assert!(received.is_some());
        respond_index_header(&mut target_conn, &InfoResponse::ok(Some(false)))
            .await
            .unwrap();

        let response = source.await.unwrap().unwrap();
        assert_eq!(response.refresh, Some(false));
    }

    #[tokio::test]
    async fn test_index_header_version_zero_skips() {
        let (mut source_conn, mut target_conn) = pipe_pair(16);

        let response = send_index_header(&mut source_conn, 0, &MigrationInfo::default())
            .await
            .unwrap();
        assert!(response.is_success());
        assert!(receive_index_header(&mut target_conn, 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_run_paired_success() {
        run_paired(async { Ok(()) }, async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_paired_aborts_blocked_peer() {
        let (_source_conn, mut target_conn) = pipe_pair(16);

        let source = async { Err(StorageError::Migration("send failed".to_string())) };
        let target = async move {
            // Blocks forever: the peer endpoint is never written to or
            // dropped until the supervisor aborts this task.
            let mut sink = Vec::new();
            target_conn.read_to_end(&mut sink).await.map_err(|e| {
                StorageError::Migration(format!("read failed: {e}"))
            })?;
            std::future::pending::<()>().await;
            Ok(())
        };

        let started = std::time::Instant::now();
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_paired(source, target),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(err.to_string().contains("send failed"));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
