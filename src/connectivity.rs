//! Connectivity signal.
//!
//! Tracks whether the remote store is believed reachable and broadcasts
//! transitions to subscribers over bounded channels. Events describe state,
//! so a subscriber whose buffer is full keeps its subscription and skips the
//! event: the transitions already buffered make it re-read [`Connectivity::is_online`].
//! Only subscribers whose receiver was dropped are removed.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Buffered transitions per subscriber; later ones are skipped until it catches up.
const SUBSCRIBER_BUFFER: usize = 64;

/// A connectivity transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

/// Shared online/offline state with change notifications.
pub struct Connectivity {
    online: AtomicBool,
    subscribers: RwLock<Vec<Sender<ConnectivityEvent>>>,
}

impl Connectivity {
    /// Create a signal with the given initial state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update the state. Subscribers are notified only on an actual change.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        let event = if online {
            ConnectivityEvent::BecameOnline
        } else {
            ConnectivityEvent::BecameOffline
        };
        tracing::info!(?event, "connectivity changed");
        self.broadcast(event);
    }

    /// Receive future transitions.
    pub fn subscribe(&self) -> Receiver<ConnectivityEvent> {
        let (sender, receiver) = bounded(SUBSCRIBER_BUFFER);
        self.subscribers.write().push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn broadcast(&self, event: ConnectivityEvent) {
        let mut subs = self.subscribers.write();
        subs.retain(|sender| match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(?event, "connectivity subscriber lagging, event coalesced");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
