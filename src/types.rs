//! Core types for the synchronization engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// Time elapsed between `self` and `later`, zero if `later` is earlier.
    pub fn age_at(self, later: Timestamp) -> Duration {
        Duration::from_millis(later.0.saturating_sub(self.0).max(0) as u64)
    }

    /// This timestamp shifted back by `duration`.
    pub fn minus(self, duration: Duration) -> Self {
        Timestamp(self.0 - duration.as_millis() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 digest, used to derive stable file names from cache keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

/// The complete state of one workshop session at a point in time.
///
/// Only the bookkeeping fields are typed. Everything the workshop steps
/// record lives in `data` and is flattened into the top-level JSON object,
/// so the engine never needs to understand it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Assigned at first save; `None` until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Stamped by the coordinator on every save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved: Option<Timestamp>,

    #[serde(default)]
    pub current_step: u32,

    #[serde(default)]
    pub completed_steps: Vec<u32>,

    #[serde(default)]
    pub is_complete: bool,

    /// Opaque step data.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl SessionSnapshot {
    /// Create an empty snapshot for the given session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, current_step: u32) -> Self {
        self.current_step = current_step;
        self
    }

    pub fn with_completed(mut self, completed_steps: Vec<u32>) -> Self {
        self.completed_steps = completed_steps;
        self
    }

    pub fn with_last_saved(mut self, last_saved: Timestamp) -> Self {
        self.last_saved = Some(last_saved);
        self
    }

    /// Set one opaque field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Number of steps the caller marked complete.
    pub fn completion_count(&self) -> usize {
        self.completed_steps.len()
    }

    /// The session id, if one has been assigned and is non-empty.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn has_session_id(&self) -> bool {
        self.session_id().is_some()
    }
}

/// A deferred remote write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    /// Enqueue time.
    pub timestamp: Timestamp,
    /// Snapshot as it was at enqueue time.
    pub data: SessionSnapshot,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Read-only view of the offline queue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueStatus {
    pub count: usize,
    pub items: Vec<QueueItem>,
}

/// Payload for a remote progress write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub session_id: String,
    pub step: u32,
    /// The whole snapshot, serialized.
    pub step_data: Value,
}

/// One entry of the remote session listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub completed: bool,
    pub step: u32,
    pub created_at: Timestamp,
}

/// A full session as returned by the remote store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    pub id: String,
    pub step: u32,
    pub completed: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Last `step_data` written for this session.
    #[serde(default)]
    pub data: Value,
}
