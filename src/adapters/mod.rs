//! Storage tiers.
//!
//! Every tier is reached through [`SnapshotTier`], so the coordinator never
//! learns which storage technology sits behind it and any tier can be
//! swapped for a test double.
//!
//! - [`ReactiveStoreAdapter`]: in-process application state
//! - [`LocalCacheAdapter`]: expiring envelope in a [`KeyValueStore`](crate::kv::KeyValueStore)
//! - [`RemoteStoreAdapter`]: a [`RemoteApi`] behind a call timeout

mod local;
mod reactive;
mod remote;

pub use local::{
    LocalCacheAdapter, SnapshotEnvelope, DEFAULT_LOCAL_EXPIRY, ENVELOPE_VERSION, LOCAL_SNAPSHOT_KEY,
};
pub use reactive::{MemoryReactiveStore, ReactiveStore, ReactiveStoreAdapter, SessionAction};
pub use remote::{MemoryRemote, RemoteApi, RemoteStoreAdapter, DEFAULT_REMOTE_TIMEOUT};

use crate::error::Result;
use crate::types::SessionSnapshot;

/// One storage tier holding at most one live snapshot.
pub trait SnapshotTier: Send + Sync {
    /// Persist `snapshot`, replacing what the tier held.
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// The snapshot this tier holds, `None` if empty or unusable.
    fn load(&self) -> Result<Option<SessionSnapshot>>;

    /// Forget the held snapshot.
    fn clear(&self) -> Result<()>;
}
