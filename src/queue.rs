//! Offline queue of deferred remote writes.
//!
//! The queue is kept in memory and mirrored as a whole into the key-value
//! cache after every change, so it survives restarts. A persisted queue that
//! cannot be read is treated as empty.

use crate::adapters::SnapshotTier;
use crate::kv::KeyValueStore;
use crate::types::{QueueItem, QueueStatus, SessionSnapshot, Timestamp};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Key holding the persisted queue.
pub const OFFLINE_QUEUE_KEY: &str = "workshop_offline_queue";

/// Default attempt budget per item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default unit of the linear retry backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Outcome of one drain pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainReport {
    /// Items the pass attempted.
    pub attempted: usize,
    /// Items written and removed.
    pub succeeded: usize,
    /// Items that failed and stay queued.
    pub retried: usize,
    /// Items that exhausted their budget and were removed.
    pub dropped: Vec<QueueItem>,
    /// Earliest backoff among retried items; `None` if nothing needs a retry.
    pub retry_after: Option<Duration>,
}

/// Durable retry buffer for snapshots that could not reach the remote tier.
pub struct OfflineQueue {
    kv: Arc<dyn KeyValueStore>,
    items: Mutex<Vec<QueueItem>>,
    /// Serializes drain passes.
    drain_lock: Mutex<()>,
    /// Bumped by `clear` so an in-flight drain doesn't resurrect items.
    generation: AtomicU64,
    next_seq: AtomicU64,
    max_retries: u32,
    base_delay: Duration,
}

impl OfflineQueue {
    /// Open the queue, restoring any persisted items.
    pub fn open(kv: Arc<dyn KeyValueStore>, max_retries: u32, base_delay: Duration) -> Self {
        let items = Self::read_persisted(kv.as_ref());
        if !items.is_empty() {
            tracing::info!(count = items.len(), "restored offline queue");
        }

        Self {
            kv,
            next_seq: AtomicU64::new(items.len() as u64 + 1),
            items: Mutex::new(items),
            drain_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            max_retries,
            base_delay,
        }
    }

    /// Queue a write of `snapshot` with a fresh retry budget.
    pub fn enqueue(&self, snapshot: SessionSnapshot) -> QueueItem {
        let timestamp = Timestamp::now();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem {
            id: format!("q-{}-{}", timestamp.0, seq),
            timestamp,
            data: snapshot,
            retry_count: 0,
            max_retries: self.max_retries,
        };

        let mut items = self.items.lock();
        items.push(item.clone());
        self.persist(&items);
        tracing::debug!(
            item_id = %item.id,
            session_id = item.data.session_id().unwrap_or("-"),
            queued = items.len(),
            "queued remote write"
        );

        item
    }

    /// Attempt every queued write once.
    ///
    /// Works from a copy of the queue so writes enqueued while a remote call
    /// is in flight are kept (after the survivors) rather than lost.
    pub fn drain(&self, remote: &dyn SnapshotTier) -> DrainReport {
        let _drain = self.drain_lock.lock();

        let generation = self.generation.load(Ordering::SeqCst);
        let pending: Vec<QueueItem> = self.items.lock().clone();
        let mut report = DrainReport {
            attempted: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return report;
        }

        let attempted_ids: HashSet<String> = pending.iter().map(|i| i.id.clone()).collect();
        let mut survivors = Vec::new();

        for mut item in pending {
            match remote.save(&item.data) {
                Ok(()) => {
                    tracing::debug!(item_id = %item.id, "queued write delivered");
                    report.succeeded += 1;
                }
                Err(e) => {
                    item.retry_count += 1;
                    if item.retry_count < item.max_retries {
                        let backoff = self.base_delay * item.retry_count;
                        tracing::warn!(
                            item_id = %item.id,
                            retry_count = item.retry_count,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "queued write failed, will retry"
                        );
                        report.retry_after = Some(match report.retry_after {
                            Some(current) => current.min(backoff),
                            None => backoff,
                        });
                        report.retried += 1;
                        survivors.push(item);
                    } else {
                        tracing::error!(
                            item_id = %item.id,
                            session_id = item.data.session_id().unwrap_or("-"),
                            retry_count = item.retry_count,
                            error = %e,
                            "dropping queued write after exhausting retries"
                        );
                        report.dropped.push(item);
                    }
                }
            }
        }

        let mut items = self.items.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            // Cleared mid-drain: keep only what arrived after the clear.
            survivors.clear();
        }
        let arrived = items
            .drain(..)
            .filter(|i| !attempted_ids.contains(&i.id));
        survivors.extend(arrived);
        *items = survivors;
        self.persist(&items);

        tracing::debug!(
            succeeded = report.succeeded,
            retried = report.retried,
            dropped = report.dropped.len(),
            remaining = items.len(),
            "drained offline queue"
        );
        report
    }

    pub fn status(&self) -> QueueStatus {
        let items = self.items.lock().clone();
        QueueStatus {
            count: items.len(),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every queued write, in memory and on disk.
    pub fn clear(&self) {
        let mut items = self.items.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        items.clear();
        if let Err(e) = self.kv.remove(OFFLINE_QUEUE_KEY) {
            tracing::warn!(error = %e, "failed to remove persisted offline queue");
        }
    }

    fn persist(&self, items: &[QueueItem]) {
        let result = serde_json::to_string(items)
            .map_err(Into::into)
            .and_then(|encoded| self.kv.set(OFFLINE_QUEUE_KEY, &encoded));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist offline queue");
        }
    }

    fn read_persisted(kv: &dyn KeyValueStore) -> Vec<QueueItem> {
        let raw = match kv.get(OFFLINE_QUEUE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable offline queue, starting empty");
                return Vec::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "corrupt offline queue, starting empty");
                Vec::new()
            }
        }
    }
}
