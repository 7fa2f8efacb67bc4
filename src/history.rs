//! Session history for recovery and diagnostics.
//!
//! Keeps the most recent session records, one per session id, newest first.
//! Records are separate from the live snapshot: clearing the live session
//! does not touch them.

use crate::kv::KeyValueStore;
use crate::types::{SessionSnapshot, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Key holding the persisted history.
pub const HISTORY_KEY: &str = "workshop_session_history";

/// Default number of records kept.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Default number of steps in a workshop.
pub const DEFAULT_TOTAL_STEPS: u32 = 10;

/// Fields derived from a snapshot when it is archived.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub step: u32,
    /// 0 to 100.
    pub completion_percent: u8,
    pub is_complete: bool,
    /// Archetype label, when the session has been classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
}

/// Archived copy of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub snapshot: SessionSnapshot,
    pub saved_at: Timestamp,
    pub is_valid: bool,
    pub metadata: RecordMetadata,
}

/// Capped, persisted list of [`SessionRecord`]s.
pub struct SessionHistory {
    kv: Arc<dyn KeyValueStore>,
    capacity: usize,
    total_steps: u32,
    /// Newest first.
    records: Mutex<Vec<SessionRecord>>,
}

impl SessionHistory {
    /// Open the history, restoring persisted records. Unreadable history
    /// starts empty.
    pub fn open(kv: Arc<dyn KeyValueStore>, capacity: usize, total_steps: u32) -> Self {
        let mut records: Vec<SessionRecord> = match kv.get(HISTORY_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "corrupt session history, starting empty");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable session history, starting empty");
                Vec::new()
            }
        };
        records.truncate(capacity);

        Self {
            kv,
            capacity,
            total_steps: total_steps.max(1),
            records: Mutex::new(records),
        }
    }

    /// Archive `snapshot`, replacing any older record of the same session.
    ///
    /// Snapshots without a session id are not archived.
    pub fn record(&self, snapshot: &SessionSnapshot) -> Option<SessionRecord> {
        let session_id = snapshot.session_id()?.to_string();
        let record = SessionRecord {
            session_id: session_id.clone(),
            snapshot: snapshot.clone(),
            saved_at: Timestamp::now(),
            is_valid: self.is_valid(snapshot),
            metadata: self.metadata(snapshot),
        };

        let mut records = self.records.lock();
        records.retain(|r| r.session_id != session_id);
        records.insert(0, record.clone());
        if records.len() > self.capacity {
            let evicted = records.split_off(self.capacity);
            tracing::debug!(evicted = evicted.len(), "evicted oldest session records");
        }
        self.persist(&records);

        Some(record)
    }

    /// All records, newest first.
    pub fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().clone()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
        if let Err(e) = self.kv.remove(HISTORY_KEY) {
            tracing::warn!(error = %e, "failed to remove session history");
        }
    }

    /// Structural sanity: steps within range, no duplicate completions.
    fn is_valid(&self, snapshot: &SessionSnapshot) -> bool {
        let mut seen = HashSet::new();
        snapshot.current_step <= self.total_steps
            && snapshot
                .completed_steps
                .iter()
                .all(|step| *step <= self.total_steps && seen.insert(*step))
    }

    fn metadata(&self, snapshot: &SessionSnapshot) -> RecordMetadata {
        let completed: HashSet<u32> = snapshot.completed_steps.iter().copied().collect();
        let percent = (completed.len() as u64 * 100 / self.total_steps as u64).min(100) as u8;

        RecordMetadata {
            step: snapshot.current_step,
            completion_percent: percent,
            is_complete: snapshot.is_complete,
            classification: classification(snapshot),
        }
    }

    fn persist(&self, records: &[SessionRecord]) {
        let result = serde_json::to_string(records)
            .map_err(Into::into)
            .and_then(|encoded| self.kv.set(HISTORY_KEY, &encoded));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist session history");
        }
    }
}

/// Archetype label carried in the step data, either as a plain string or
/// as an object with a `name` or `primary` field.
fn classification(snapshot: &SessionSnapshot) -> Option<String> {
    match snapshot.data.get("archetype")? {
        Value::String(label) => Some(label.clone()),
        Value::Object(fields) => ["name", "primary"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}
