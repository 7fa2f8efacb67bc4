//! Remote tier.
//!
//! [`RemoteApi`] is the narrow surface of the network service. The adapter
//! adds the session-id invariant, session selection and a call timeout; the
//! API implementation owns transport, auth and wire format.

use crate::adapters::SnapshotTier;
use crate::error::{Result, SyncError};
use crate::types::{RemoteSession, SessionProgress, SessionSnapshot, SessionSummary, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default bound on a single remote call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote session persistence service.
pub trait RemoteApi: Send + Sync {
    fn save_session_progress(&self, progress: &SessionProgress) -> Result<()>;

    /// Summaries of every session the caller owns.
    fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    fn get_session(&self, id: &str) -> Result<Option<RemoteSession>>;
}

/// [`SnapshotTier`] over a [`RemoteApi`].
pub struct RemoteStoreAdapter {
    api: Arc<dyn RemoteApi>,
    timeout: Duration,
    /// Session of the last successful save or load.
    known_session: RwLock<Option<String>>,
}

impl RemoteStoreAdapter {
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self::with_timeout(api, DEFAULT_REMOTE_TIMEOUT)
    }

    pub fn with_timeout(api: Arc<dyn RemoteApi>, timeout: Duration) -> Self {
        Self {
            api,
            timeout,
            known_session: RwLock::new(None),
        }
    }

    /// Session id loads will target, if one is known.
    pub fn known_session(&self) -> Option<String> {
        self.known_session.read().clone()
    }

    /// Point future loads at `session_id`.
    pub fn set_known_session(&self, session_id: Option<String>) {
        *self.known_session.write() = session_id;
    }

    /// Choose which remote session to resume when none is known.
    ///
    /// Unfinished work wins over finished work; within each group the most
    /// recently created session wins.
    pub fn select_session(sessions: &[SessionSummary]) -> Option<&SessionSummary> {
        let newest = |a: &&SessionSummary, b: &&SessionSummary| a.created_at.cmp(&b.created_at);
        sessions
            .iter()
            .filter(|s| !s.completed)
            .max_by(newest)
            .or_else(|| sessions.iter().max_by(newest))
    }

    /// Run `f` against the API on a helper thread, giving up after the
    /// configured timeout. A call that times out keeps running detached;
    /// its result is discarded.
    fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RemoteApi) -> Result<T> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name(format!("remote-{}", op))
            .spawn(move || {
                let _ = tx.send(f(api.as_ref()));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(op, timeout_ms = self.timeout.as_millis() as u64, "remote call timed out");
                Err(SyncError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(SyncError::Remote(format!("{} call aborted", op)))
            }
        }
    }

    fn snapshot_from_remote(session: RemoteSession) -> Result<SessionSnapshot> {
        let mut snapshot = if session.data.is_null() {
            SessionSnapshot {
                current_step: session.step,
                ..Default::default()
            }
        } else {
            serde_json::from_value::<SessionSnapshot>(session.data)
                .map_err(|e| SyncError::Deserialization(e.to_string()))?
        };

        if !snapshot.has_session_id() {
            snapshot.session_id = Some(session.id);
        }
        if snapshot.last_saved.is_none() {
            snapshot.last_saved = Some(session.updated_at);
        }
        snapshot.is_complete |= session.completed;
        Ok(snapshot)
    }
}

impl SnapshotTier for RemoteStoreAdapter {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let session_id = snapshot
            .session_id()
            .ok_or(SyncError::MissingSessionId)?
            .to_string();

        let progress = SessionProgress {
            session_id: session_id.clone(),
            step: snapshot.current_step,
            step_data: serde_json::to_value(snapshot)?,
        };
        self.call("save", move |api| api.save_session_progress(&progress))?;

        self.set_known_session(Some(session_id));
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionSnapshot>> {
        let session_id = match self.known_session() {
            Some(id) => id,
            None => {
                let sessions = self.call("list", |api| api.list_sessions())?;
                match Self::select_session(&sessions) {
                    Some(summary) => summary.id.clone(),
                    None => return Ok(None),
                }
            }
        };

        let lookup = session_id.clone();
        let session = match self.call("get", move |api| api.get_session(&lookup))? {
            Some(session) => session,
            None => {
                tracing::debug!(session_id = %session_id, "remote session not found");
                return Ok(None);
            }
        };

        let snapshot = Self::snapshot_from_remote(session)?;
        self.set_known_session(snapshot.session_id.clone());
        Ok(Some(snapshot))
    }

    /// Forgets the known session. Remote data is never deleted here.
    fn clear(&self) -> Result<()> {
        self.set_known_session(None);
        Ok(())
    }
}

/// In-process [`RemoteApi`] with switchable failure and latency.
///
/// Stands in for the network service in tests, demos and offline-only
/// deployments.
#[derive(Default)]
pub struct MemoryRemote {
    sessions: RwLock<HashMap<String, RemoteSession>>,
    writes: Mutex<Vec<SessionProgress>>,
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Seed a session as if written earlier.
    pub fn insert_session(&self, session: RemoteSession) {
        self.sessions.write().insert(session.id.clone(), session);
    }

    /// Every accepted write, oldest first.
    pub fn writes(&self) -> Vec<SessionProgress> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Accepted writes for one session.
    pub fn writes_for(&self, session_id: &str) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.session_id == session_id)
            .count()
    }

    fn begin_call(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Remote("service unavailable".into()));
        }
        Ok(())
    }
}

impl RemoteApi for MemoryRemote {
    fn save_session_progress(&self, progress: &SessionProgress) -> Result<()> {
        self.begin_call()?;

        let now = Timestamp::now();
        let completed = progress
            .step_data
            .get("isComplete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(progress.session_id.clone())
            .or_insert_with(|| RemoteSession {
                id: progress.session_id.clone(),
                step: 0,
                completed: false,
                created_at: now,
                updated_at: now,
                data: serde_json::Value::Null,
            });
        session.step = progress.step;
        session.completed = completed;
        session.updated_at = now;
        session.data = progress.step_data.clone();
        drop(sessions);

        self.writes.lock().push(progress.clone());
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.begin_call()?;
        Ok(self
            .sessions
            .read()
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                completed: s.completed,
                step: s.step,
                created_at: s.created_at,
            })
            .collect())
    }

    fn get_session(&self, id: &str) -> Result<Option<RemoteSession>> {
        self.begin_call()?;
        Ok(self.sessions.read().get(id).cloned())
    }
}
