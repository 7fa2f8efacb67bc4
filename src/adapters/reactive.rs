//! Reactive (in-process) tier.

use crate::adapters::SnapshotTier;
use crate::error::Result;
use crate::types::SessionSnapshot;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::Arc;

/// Default buffered changes per subscriber.
const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Actions the reactive store accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionAction {
    /// Replace the whole session snapshot.
    Replace(SessionSnapshot),
    /// Drop the session back to its initial empty state.
    Reset,
}

/// Application state container the engine reads from and dispatches to.
pub trait ReactiveStore: Send + Sync {
    /// The current snapshot, `None` after a reset.
    fn snapshot(&self) -> Option<SessionSnapshot>;

    fn dispatch(&self, action: SessionAction);
}

/// Reactive store kept in memory, notifying subscribers of every change.
pub struct MemoryReactiveStore {
    current: RwLock<Option<SessionSnapshot>>,
    subscribers: RwLock<Vec<Sender<Option<SessionSnapshot>>>>,
    buffer_size: usize,
}

impl MemoryReactiveStore {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Create a store whose subscribers are dropped after `buffer_size`
    /// unread changes.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            current: RwLock::new(None),
            subscribers: RwLock::new(Vec::new()),
            buffer_size,
        }
    }

    /// Receive every subsequent state (`None` after a reset).
    pub fn subscribe(&self) -> Receiver<Option<SessionSnapshot>> {
        let (sender, receiver) = bounded(self.buffer_size);
        self.subscribers.write().push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn notify(&self, state: Option<SessionSnapshot>) {
        let mut subs = self.subscribers.write();
        if subs.is_empty() {
            return;
        }
        subs.retain(|sender| match sender.try_send(state.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("dropping slow reactive store subscriber");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl Default for MemoryReactiveStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactiveStore for MemoryReactiveStore {
    fn snapshot(&self) -> Option<SessionSnapshot> {
        self.current.read().clone()
    }

    fn dispatch(&self, action: SessionAction) {
        let next = match action {
            SessionAction::Replace(snapshot) => Some(snapshot),
            SessionAction::Reset => None,
        };
        *self.current.write() = next.clone();
        self.notify(next);
    }
}

/// [`SnapshotTier`] over any [`ReactiveStore`].
pub struct ReactiveStoreAdapter {
    store: Arc<dyn ReactiveStore>,
}

impl ReactiveStoreAdapter {
    pub fn new(store: Arc<dyn ReactiveStore>) -> Self {
        Self { store }
    }
}

impl SnapshotTier for ReactiveStoreAdapter {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.store.dispatch(SessionAction::Replace(snapshot.clone()));
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionSnapshot>> {
        Ok(self.store.snapshot())
    }

    fn clear(&self) -> Result<()> {
        self.store.dispatch(SessionAction::Reset);
        Ok(())
    }
}
