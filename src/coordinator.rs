//! Synchronization coordinator tying all tiers together.
//!
//! Every edit goes to the reactive tier synchronously. Writes to the local
//! cache and the remote store are debounced: each `save` pushes the flush
//! deadline back, and when it finally fires the flush re-reads the reactive
//! tier, so only the latest state is written out. Remote writes that cannot
//! happen (offline, failure, timeout, no session id) go to the offline queue.
//!
//! A single scheduler thread owns the debounce deadline, the queue retry
//! deadline and the connectivity subscription, so timer-driven work never
//! runs concurrently with itself.

use crate::adapters::{
    LocalCacheAdapter, ReactiveStore, ReactiveStoreAdapter, RemoteApi, RemoteStoreAdapter,
    SnapshotTier, DEFAULT_LOCAL_EXPIRY, DEFAULT_REMOTE_TIMEOUT,
};
use crate::conflict::ConflictPolicy;
use crate::connectivity::{Connectivity, ConnectivityEvent};
use crate::error::{Result, SyncError};
use crate::history::{SessionHistory, SessionRecord, DEFAULT_HISTORY_CAPACITY, DEFAULT_TOTAL_STEPS};
use crate::kv::KeyValueStore;
use crate::queue::{DrainReport, OfflineQueue, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY};
use crate::types::{QueueStatus, SessionSnapshot, Timestamp};
use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Coordinator configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Quiet period before a flush to the outer tiers.
    pub debounce: Duration,

    /// Unit of the linear queue retry backoff.
    pub retry_base_delay: Duration,

    /// Attempts per queued write before it is dropped.
    pub max_retries: u32,

    /// Local cache retention window.
    pub local_expiry: Duration,

    /// Bound on a single remote call.
    pub remote_timeout: Duration,

    /// Session records kept in history.
    pub history_capacity: usize,

    /// Steps in a workshop, for completion percentages.
    pub total_steps: u32,

    /// Initial conflict resolution strategy.
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            local_expiry: DEFAULT_LOCAL_EXPIRY,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            total_steps: DEFAULT_TOTAL_STEPS,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// The collaborators a coordinator drives.
pub struct Tiers {
    pub reactive: Arc<dyn SnapshotTier>,
    pub local: Arc<dyn SnapshotTier>,
    pub remote: Arc<dyn SnapshotTier>,
    /// Backing store for the offline queue and session history.
    pub storage: Arc<dyn KeyValueStore>,
    pub connectivity: Arc<Connectivity>,
}

impl Tiers {
    /// Standard wiring: reactive store, key-value local cache and remote API
    /// wrapped in their adapters, with the queue and history sharing `kv`.
    pub fn standard(
        config: &SyncConfig,
        reactive: Arc<dyn ReactiveStore>,
        kv: Arc<dyn KeyValueStore>,
        api: Arc<dyn RemoteApi>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        Self {
            reactive: Arc::new(ReactiveStoreAdapter::new(reactive)),
            local: Arc::new(LocalCacheAdapter::with_expiry(kv.clone(), config.local_expiry)),
            remote: Arc::new(RemoteStoreAdapter::with_timeout(api, config.remote_timeout)),
            storage: kv,
            connectivity,
        }
    }
}

/// Which tier a loaded snapshot came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadSource {
    Reactive,
    Remote,
    LocalCache,
    /// Both remote and local had a copy; the conflict policy chose.
    Resolved,
}

/// Result of [`SyncCoordinator::load`].
#[derive(Clone, Debug, PartialEq)]
pub enum LoadOutcome {
    Loaded {
        snapshot: SessionSnapshot,
        source: LoadSource,
    },
    /// No tier had usable data.
    NotFound,
}

impl LoadOutcome {
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        match self {
            LoadOutcome::Loaded { snapshot, .. } => Some(snapshot),
            LoadOutcome::NotFound => None,
        }
    }

    pub fn into_snapshot(self) -> Option<SessionSnapshot> {
        match self {
            LoadOutcome::Loaded { snapshot, .. } => Some(snapshot),
            LoadOutcome::NotFound => None,
        }
    }

    pub fn source(&self) -> Option<LoadSource> {
        match self {
            LoadOutcome::Loaded { source, .. } => Some(*source),
            LoadOutcome::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, LoadOutcome::Loaded { .. })
    }
}

/// Scheduler thread commands.
#[derive(Debug)]
enum Command {
    /// (Re)start the debounce timer.
    Touch,
    /// Cancel the debounce timer.
    Cancel,
    /// Drain the offline queue after the delay (earliest request wins).
    RetryIn(Duration),
    Shutdown,
}

/// State shared between the handle and the scheduler thread.
struct Inner {
    reactive: Arc<dyn SnapshotTier>,
    local: Arc<dyn SnapshotTier>,
    remote: Arc<dyn SnapshotTier>,
    connectivity: Arc<Connectivity>,
    queue: OfflineQueue,
    history: SessionHistory,
    policy: RwLock<ConflictPolicy>,
    /// A debounced flush is pending.
    dirty: AtomicBool,
    /// Serializes fan-outs.
    flush_lock: Mutex<()>,
    commands: Sender<Command>,
}

impl Inner {
    fn schedule(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("sync scheduler is stopped; outer tiers will not be updated");
        }
    }

    fn flush_pending(&self) {
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.fan_out();
        }
    }

    /// Write the current reactive snapshot to the local and remote tiers.
    fn fan_out(&self) {
        let _flush = self.flush_lock.lock();

        let snapshot = match self.reactive.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::debug!("nothing to flush");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read reactive state for flush");
                return;
            }
        };
        let session_id = snapshot.session_id().unwrap_or("-").to_string();

        if let Err(e) = self.local.save(&snapshot) {
            tracing::warn!(session_id = %session_id, error = %e, "local cache write failed");
        }
        self.history.record(&snapshot);

        if !self.connectivity.is_online() {
            tracing::debug!(session_id = %session_id, "offline, deferring remote write");
            self.queue.enqueue(snapshot);
            return;
        }

        match self.remote.save(&snapshot) {
            Ok(()) => tracing::debug!(session_id = %session_id, "flushed to remote"),
            Err(SyncError::MissingSessionId) => {
                tracing::debug!("snapshot has no session id, deferring remote write");
                self.queue.enqueue(snapshot);
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "remote write failed, queueing");
                self.queue.enqueue(snapshot);
            }
        }
    }

    fn process_offline_queue(&self) -> DrainReport {
        if !self.connectivity.is_online() {
            tracing::debug!(queued = self.queue.len(), "offline, not draining queue");
            return DrainReport::default();
        }

        let report = self.queue.drain(self.remote.as_ref());
        if let Some(delay) = report.retry_after {
            self.schedule(Command::RetryIn(delay));
        }
        report
    }
}

/// Handle to the synchronization engine.
///
/// Construct one at startup and pass it by reference. Dropping it (or
/// calling [`shutdown`](Self::shutdown)) flushes a pending save and stops the
/// scheduler thread.
pub struct SyncCoordinator {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Create a coordinator and start its scheduler thread.
    ///
    /// A queue restored from storage is drained right away when online.
    pub fn new(config: SyncConfig, tiers: Tiers) -> Result<Self> {
        let queue = OfflineQueue::open(tiers.storage.clone(), config.max_retries, config.retry_base_delay);
        let history = SessionHistory::open(tiers.storage.clone(), config.history_capacity, config.total_steps);

        let (commands, command_rx) = unbounded();
        let connectivity_rx = tiers.connectivity.subscribe();

        let inner = Arc::new(Inner {
            reactive: tiers.reactive,
            local: tiers.local,
            remote: tiers.remote,
            connectivity: tiers.connectivity,
            queue,
            history,
            policy: RwLock::new(config.conflict_policy),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            commands,
        });

        let worker = {
            let inner = Arc::clone(&inner);
            let debounce = config.debounce;
            thread::Builder::new()
                .name("workshop-sync".into())
                .spawn(move || run_scheduler(inner, command_rx, connectivity_rx, debounce))?
        };

        if !inner.queue.is_empty() && inner.connectivity.is_online() {
            inner.schedule(Command::RetryIn(Duration::ZERO));
        }

        tracing::info!(
            debounce_ms = config.debounce.as_millis() as u64,
            online = inner.connectivity.is_online(),
            queued = inner.queue.len(),
            "sync coordinator started"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Record an edit.
    ///
    /// The reactive tier is updated before this returns; the outer tiers are
    /// written once no further `save` arrives for the debounce period.
    pub fn save(&self, mut snapshot: SessionSnapshot) {
        snapshot.last_saved = Some(Timestamp::now());
        if let Err(e) = self.inner.reactive.save(&snapshot) {
            tracing::warn!(error = %e, "reactive store write failed");
        }
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.inner.schedule(Command::Touch);
    }

    /// Cancel the debounce timer and write the outer tiers now.
    pub fn save_immediately(&self) {
        self.inner.dirty.store(false, Ordering::SeqCst);
        self.inner.schedule(Command::Cancel);
        self.inner.fan_out();
    }

    /// Whether a debounced flush is waiting.
    pub fn has_pending_flush(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Find the current session: reactive, then remote (online only), then
    /// local cache, resolving remote/local conflicts. The result is written
    /// back into the reactive tier.
    pub fn load(&self) -> LoadOutcome {
        let reactive = match self.inner.reactive.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "reactive store read failed");
                None
            }
        };
        if let Some(snapshot) = reactive.as_ref().filter(|s| s.has_session_id()) {
            return LoadOutcome::Loaded {
                snapshot: snapshot.clone(),
                source: LoadSource::Reactive,
            };
        }

        let remote = if self.inner.connectivity.is_online() {
            self.inner.remote.load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "remote load failed, falling back to local cache");
                None
            })
        } else {
            None
        };

        let local = self.inner.local.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "local cache load failed");
            None
        });

        let (snapshot, source) = match (local, remote) {
            (Some(local), Some(remote)) => {
                let policy = self.inner.policy.read().clone();
                tracing::debug!(?policy, "resolving local/remote conflict");
                (policy.resolve(&local, &remote), LoadSource::Resolved)
            }
            (None, Some(remote)) => (remote, LoadSource::Remote),
            (Some(local), None) => (local, LoadSource::LocalCache),
            (None, None) => {
                // Unsaved edits made before a session id was assigned.
                return match reactive {
                    Some(snapshot) => LoadOutcome::Loaded {
                        snapshot,
                        source: LoadSource::Reactive,
                    },
                    None => LoadOutcome::NotFound,
                };
            }
        };

        if let Err(e) = self.inner.reactive.save(&snapshot) {
            tracing::warn!(error = %e, "failed to back-fill reactive store");
        }
        tracing::debug!(?source, session_id = snapshot.session_id().unwrap_or("-"), "session loaded");

        LoadOutcome::Loaded { snapshot, source }
    }

    /// Forget the live session locally: reactive tier, local cache and
    /// offline queue. Remote data and session history are kept.
    pub fn clear(&self) {
        self.inner.dirty.store(false, Ordering::SeqCst);
        self.inner.schedule(Command::Cancel);

        let _flush = self.inner.flush_lock.lock();
        for (tier, result) in [
            ("reactive", self.inner.reactive.clear()),
            ("local", self.inner.local.clear()),
            ("remote", self.inner.remote.clear()),
        ] {
            if let Err(e) = result {
                tracing::warn!(tier, error = %e, "failed to clear tier");
            }
        }
        self.inner.queue.clear();
        tracing::info!("session state cleared");
    }

    /// Replace the conflict resolution strategy.
    pub fn set_conflict_resolution(&self, policy: ConflictPolicy) {
        tracing::debug!(?policy, "conflict policy changed");
        *self.inner.policy.write() = policy;
    }

    pub fn offline_queue_status(&self) -> QueueStatus {
        self.inner.queue.status()
    }

    /// Drain the offline queue now, if online.
    pub fn force_process_offline_queue(&self) -> DrainReport {
        self.inner.process_offline_queue()
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Mark the current session finished, write it out and archive it.
    ///
    /// Returns `false` if there is no current session.
    pub fn mark_complete(&self) -> bool {
        let mut snapshot = match self.inner.reactive.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(error = %e, "reactive store read failed");
                return false;
            }
        };

        snapshot.is_complete = true;
        snapshot.last_saved = Some(Timestamp::now());
        if let Err(e) = self.inner.reactive.save(&snapshot) {
            tracing::warn!(error = %e, "reactive store write failed");
        }
        self.save_immediately();
        tracing::info!(session_id = snapshot.session_id().unwrap_or("-"), "session completed");
        true
    }

    /// Archived session records, newest first.
    pub fn session_history(&self) -> Vec<SessionRecord> {
        self.inner.history.records()
    }

    /// Make an archived session current again. Returns `false` if there is
    /// no record for `session_id`.
    pub fn restore_from_history(&self, session_id: &str) -> bool {
        match self.inner.history.get(session_id) {
            Some(record) => {
                tracing::info!(session_id, "restoring session from history");
                self.save(record.snapshot);
                true
            }
            None => false,
        }
    }

    /// Flush a pending save and stop the scheduler thread.
    ///
    /// Idempotent. Also run on drop.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        if self.inner.dirty.swap(false, Ordering::SeqCst) {
            self.inner.schedule(Command::Cancel);
            self.inner.fan_out();
        }

        self.inner.schedule(Command::Shutdown);
        if worker.join().is_err() {
            tracing::error!("sync scheduler thread panicked");
        }
        tracing::info!(queued = self.inner.queue.len(), "sync coordinator stopped");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(
    inner: Arc<Inner>,
    commands: Receiver<Command>,
    connectivity: Receiver<ConnectivityEvent>,
    debounce: Duration,
) {
    let mut flush_at: Option<Instant> = None;
    let mut drain_at: Option<Instant> = None;
    let mut listening = true;

    loop {
        let events = if listening {
            connectivity.clone()
        } else {
            never()
        };
        let timer = match [flush_at, drain_at].into_iter().flatten().min() {
            Some(at) => after(at.saturating_duration_since(Instant::now())),
            None => never(),
        };

        select! {
            recv(commands) -> command => match command {
                Ok(Command::Touch) => flush_at = Some(Instant::now() + debounce),
                Ok(Command::Cancel) => flush_at = None,
                Ok(Command::RetryIn(delay)) => {
                    let at = Instant::now() + delay;
                    drain_at = Some(drain_at.map_or(at, |current| current.min(at)));
                }
                Ok(Command::Shutdown) | Err(_) => break,
            },
            recv(events) -> event => match event {
                Ok(ConnectivityEvent::BecameOnline) => {
                    tracing::info!(queued = inner.queue.len(), "back online, draining offline queue");
                    inner.process_offline_queue();
                }
                Ok(ConnectivityEvent::BecameOffline) => {
                    tracing::info!("went offline, remote writes will be queued");
                }
                Err(_) => listening = false,
            },
            recv(timer) -> _ => {
                let now = Instant::now();
                if flush_at.is_some_and(|at| at <= now) {
                    flush_at = None;
                    inner.flush_pending();
                }
                if drain_at.is_some_and(|at| at <= now) {
                    drain_at = None;
                    inner.process_offline_queue();
                }
            },
        }
    }

    tracing::debug!("sync scheduler exiting");
}
