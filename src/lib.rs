//! # Workshop Sync
//!
//! Keeps a long-running, multi-step workshop session consistent across three
//! tiers: in-process reactive state, a durable local cache and a remote store
//! behind an unreliable network.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: the whole session state, opaque apart from a few
//!   bookkeeping fields
//! - **Tiers**: reactive, local cache and remote, each behind [`SnapshotTier`]
//! - **Debounced fan-out**: edits hit the reactive tier at once and the outer
//!   tiers after a quiet period, always with the latest state
//! - **Offline queue**: remote writes that failed or happened offline, retried
//!   with linear backoff and a bounded budget
//! - **Conflict resolution**: picks between divergent local and remote copies
//!
//! ## Example
//!
//! ```ignore
//! use workshop_sync::{
//!     Connectivity, MemoryKv, MemoryReactiveStore, MemoryRemote, SessionSnapshot,
//!     SyncConfig, SyncCoordinator, Tiers,
//! };
//! use std::sync::Arc;
//!
//! let config = SyncConfig::default();
//! let tiers = Tiers::standard(
//!     &config,
//!     Arc::new(MemoryReactiveStore::new()),
//!     Arc::new(MemoryKv::new()),
//!     Arc::new(MemoryRemote::new()),
//!     Arc::new(Connectivity::new(true)),
//! );
//! let sync = SyncCoordinator::new(config, tiers)?;
//!
//! // Every edit
//! sync.save(SessionSnapshot::new("s1").with_step(2).with_completed(vec![1]));
//!
//! // Before the process goes away
//! sync.save_immediately();
//!
//! // Next start
//! let session = sync.load().into_snapshot();
//! ```

pub mod adapters;
pub mod conflict;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod kv;
pub mod queue;
pub mod types;

// Re-exports
pub use adapters::{
    LocalCacheAdapter, MemoryReactiveStore, MemoryRemote, ReactiveStore, ReactiveStoreAdapter,
    RemoteApi, RemoteStoreAdapter, SessionAction, SnapshotEnvelope, SnapshotTier,
};
pub use conflict::{progress_then_recency, ConflictPolicy, MergeFn};
pub use connectivity::{Connectivity, ConnectivityEvent};
pub use coordinator::{LoadOutcome, LoadSource, SyncConfig, SyncCoordinator, Tiers};
pub use error::{Result, SyncError};
pub use history::{RecordMetadata, SessionHistory, SessionRecord};
pub use kv::{FileKv, FileKvConfig, KeyValueStore, MemoryKv};
pub use queue::{DrainReport, OfflineQueue};
pub use types::*;
