//! # volantix Storage
//!
//! Storage volume lifecycle and migration engine for container/VM hosts.
//!
//! This crate orchestrates the full lifecycle of storage volumes backing
//! instances, images, custom volumes, and object buckets across pluggable
//! storage backends:
//! - **Two-phase commit**: metadata records and physical storage operations
//!   are coordinated with compensating rollback on any failure.
//! - **Pool-aware migration**: transfer methods are negotiated between
//!   heterogeneous drivers and data flows through an in-memory duplex
//!   transport between concurrently running sender/receiver tasks.
//! - **Disaster recovery**: on-disk backup descriptors are reconciled against
//!   the record store to rebuild lost metadata.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Backend (per pool)             │
//! │  instances / images / custom vols / buckets │
//! └───────┬──────────────┬──────────────┬───────┘
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌──────────────┐ ┌───────────┐ ┌─────────────┐
//! │ VolumeStore  │ │  Driver   │ │  Migration  │
//! │  (records)   │ │ (dir/...) │ │  transport  │
//! └──────────────┘ └───────────┘ └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::path::Path;
//!
//! use volantix_storage::drivers::dir::DirDriver;
//! use volantix_storage::{Backend, EngineState, PoolRecord, PoolStatus};
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = EngineState::builder().build();
//!     let pool = PoolRecord {
//!         name: "local".to_string(),
//!         driver: "dir".to_string(),
//!         description: String::new(),
//!         config: Default::default(),
//!         status: PoolStatus::Pending,
//!     };
//!     let backend = Backend::new(pool, DirDriver::new(Path::new("/var/lib/volantix")), state);
//!     backend.create().await.unwrap();
//!     backend.mount().await.unwrap();
//! }
//! ```

pub mod availability;
pub mod backend;
pub mod backup;
pub mod config;
pub mod drivers;
pub mod error;
pub mod events;
pub mod instance;
pub mod locking;
pub mod migration;
pub mod mock;
pub mod paths;
pub mod records;
pub mod rollback;
pub mod types;

pub use availability::PoolAvailabilityTracker;
pub use backend::{Backend, EngineState, EngineStateBuilder};
pub use backup::{BackupConfig, BackupInfo};
pub use error::{Result, StorageError};
pub use events::{EventKind, EventLog, LifecycleEvent};
pub use instance::{Instance, InstanceKind};
pub use locking::AdvisoryLocks;
pub use records::{
    BucketKeyRecord, BucketRecord, MemoryVolumeStore, PoolRecord, VolumeRecord, VolumeStore,
};
pub use types::{ContentType, DriverInfo, PoolStatus, VolumeType};
