//! Local cache tier.
//!
//! The snapshot is stored as an envelope `{data, timestamp, version}` under a
//! single key. The key-value backend has no expiry of its own; the envelope
//! timestamp is checked on every load.

use crate::adapters::SnapshotTier;
use crate::error::{Result, SyncError};
use crate::kv::KeyValueStore;
use crate::types::{SessionSnapshot, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Key holding the latest snapshot envelope.
pub const LOCAL_SNAPSHOT_KEY: &str = "workshop_state";

/// Envelope format version written by this crate.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Default retention window.
pub const DEFAULT_LOCAL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Persisted form of the cached snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub data: SessionSnapshot,
    /// When the envelope was written.
    pub timestamp: Timestamp,
    pub version: String,
}

/// [`SnapshotTier`] over a durable key-value cache, with expiry.
pub struct LocalCacheAdapter {
    kv: Arc<dyn KeyValueStore>,
    expiry: Duration,
}

impl LocalCacheAdapter {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_expiry(kv, DEFAULT_LOCAL_EXPIRY)
    }

    pub fn with_expiry(kv: Arc<dyn KeyValueStore>, expiry: Duration) -> Self {
        Self { kv, expiry }
    }

    /// Write `snapshot` stamped with an explicit envelope time.
    pub fn save_at(&self, snapshot: &SessionSnapshot, now: Timestamp) -> Result<()> {
        let envelope = SnapshotEnvelope {
            data: snapshot.clone(),
            timestamp: now,
            version: ENVELOPE_VERSION.to_string(),
        };
        let encoded = serde_json::to_string(&envelope)?;
        self.kv.set(LOCAL_SNAPSHOT_KEY, &encoded)
    }

    /// Load as if the current time were `now`.
    ///
    /// Unparsable, foreign-version and expired envelopes are removed and
    /// reported as absent.
    pub fn load_at(&self, now: Timestamp) -> Result<Option<SessionSnapshot>> {
        let raw = match self.kv.get(LOCAL_SNAPSHOT_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(
                e @ (SyncError::Corruption(_)
                | SyncError::ChecksumMismatch { .. }
                | SyncError::InvalidFormat(_)),
            ) => {
                tracing::warn!(error = %e, "unreadable cached snapshot, discarding");
                self.discard();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let envelope: SnapshotEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "corrupt cached snapshot, discarding");
                self.discard();
                return Ok(None);
            }
        };

        if envelope.version != ENVELOPE_VERSION {
            tracing::warn!(version = %envelope.version, "cached snapshot has foreign version, discarding");
            self.discard();
            return Ok(None);
        }

        let age = envelope.timestamp.age_at(now);
        if age > self.expiry {
            tracing::debug!(age_ms = age.as_millis() as u64, "cached snapshot expired");
            self.discard();
            return Ok(None);
        }

        Ok(Some(envelope.data))
    }

    fn discard(&self) {
        if let Err(e) = self.kv.remove(LOCAL_SNAPSHOT_KEY) {
            tracing::warn!(error = %e, "failed to remove cached snapshot");
        }
    }
}

impl SnapshotTier for LocalCacheAdapter {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.save_at(snapshot, Timestamp::now())
    }

    fn load(&self) -> Result<Option<SessionSnapshot>> {
        self.load_at(Timestamp::now())
    }

    fn clear(&self) -> Result<()> {
        self.kv.remove(LOCAL_SNAPSHOT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    fn adapter() -> (Arc<MemoryKv>, LocalCacheAdapter) {
        let kv = Arc::new(MemoryKv::new());
        (kv.clone(), LocalCacheAdapter::new(kv))
    }

    #[test]
    fn test_fresh_snapshot_is_returned() {
        let (_, local) = adapter();
        let snapshot = SessionSnapshot::new("s1").with_step(4).with_completed(vec![1, 2, 3]);

        local.save(&snapshot).unwrap();
        assert_eq!(local.load().unwrap(), Some(snapshot));
    }

    #[test]
    fn test_expired_snapshot_is_absent_and_removed() {
        let (kv, local) = adapter();
        let now = Timestamp::now();
        let written = now.minus(DEFAULT_LOCAL_EXPIRY + Duration::from_secs(1));

        local.save_at(&SessionSnapshot::new("s1"), written).unwrap();
        assert!(local.load_at(now).unwrap().is_none());
        assert!(kv.get(LOCAL_SNAPSHOT_KEY).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_at_exact_expiry_is_kept() {
        let (_, local) = adapter();
        let now = Timestamp::now();

        local.save_at(&SessionSnapshot::new("s1"), now.minus(DEFAULT_LOCAL_EXPIRY)).unwrap();
        assert!(local.load_at(now).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_envelope_is_absent() {
        let (kv, local) = adapter();
        kv.set(LOCAL_SNAPSHOT_KEY, "{not json").unwrap();

        assert!(local.load().unwrap().is_none());
        assert!(kv.get(LOCAL_SNAPSHOT_KEY).unwrap().is_none());
    }

    #[test]
    fn test_foreign_version_is_absent() {
        let (kv, local) = adapter();
        let raw = json!({
            "data": {"sessionId": "s1"},
            "timestamp": Timestamp::now(),
            "version": "0.9"
        });
        kv.set(LOCAL_SNAPSHOT_KEY, &raw.to_string()).unwrap();

        assert!(local.load().unwrap().is_none());
    }

    #[test]
    fn test_envelope_layout() {
        let (kv, local) = adapter();
        local
            .save_at(&SessionSnapshot::new("s1").with_step(2), Timestamp(1_700_000_000_000))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&kv.get(LOCAL_SNAPSHOT_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(raw["timestamp"], 1_700_000_000_000i64);
        assert_eq!(raw["version"], ENVELOPE_VERSION);
        assert_eq!(raw["data"]["sessionId"], "s1");
        assert_eq!(raw["data"]["currentStep"], 2);
    }

    #[test]
    fn test_clear_removes_entry() {
        let (_, local) = adapter();
        local.save(&SessionSnapshot::new("s1")).unwrap();
        local.clear().unwrap();
        assert!(local.load().unwrap().is_none());
    }
}
