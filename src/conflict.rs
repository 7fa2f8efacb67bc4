//! Conflict resolution between the local and remote copies of a session.

use crate::types::SessionSnapshot;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Caller-supplied merge of (local, remote) into one snapshot.
pub type MergeFn = Arc<dyn Fn(&SessionSnapshot, &SessionSnapshot) -> SessionSnapshot + Send + Sync>;

/// How to choose between divergent copies.
#[derive(Clone)]
pub enum ConflictPolicy {
    /// Always keep the local copy.
    LocalFirst,
    /// Always keep the remote copy.
    RemoteFirst,
    /// Apply the given merge, or [`progress_then_recency`] when `None`.
    Merge(Option<MergeFn>),
}

impl ConflictPolicy {
    /// Merge with the default heuristic.
    pub fn merge() -> Self {
        ConflictPolicy::Merge(None)
    }

    /// Merge with a custom function.
    pub fn merge_with<F>(f: F) -> Self
    where
        F: Fn(&SessionSnapshot, &SessionSnapshot) -> SessionSnapshot + Send + Sync + 'static,
    {
        ConflictPolicy::Merge(Some(Arc::new(f)))
    }

    /// Pick the authoritative snapshot.
    ///
    /// A custom merge's output is passed through without validation.
    pub fn resolve(&self, local: &SessionSnapshot, remote: &SessionSnapshot) -> SessionSnapshot {
        match self {
            ConflictPolicy::LocalFirst => local.clone(),
            ConflictPolicy::RemoteFirst => remote.clone(),
            ConflictPolicy::Merge(Some(f)) => f(local, remote),
            ConflictPolicy::Merge(None) => progress_then_recency(local, remote).clone(),
        }
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::Merge(None)
    }
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::LocalFirst => write!(f, "LocalFirst"),
            ConflictPolicy::RemoteFirst => write!(f, "RemoteFirst"),
            ConflictPolicy::Merge(Some(_)) => write!(f, "Merge(custom)"),
            ConflictPolicy::Merge(None) => write!(f, "Merge(default)"),
        }
    }
}

/// Default merge heuristic.
///
/// More completed steps wins. On equal counts the later `last_saved` wins.
/// Recency is only compared when both sides carry a timestamp: if either is
/// missing, or they are equal, local wins, even when only the remote copy is
/// timestamped. A one-sided timestamp says nothing about which edit is newer.
///
/// A local copy without a session id never beats a remote copy that has
/// one: it cannot be written back remotely, so letting it win would fork
/// the session.
pub fn progress_then_recency<'a>(
    local: &'a SessionSnapshot,
    remote: &'a SessionSnapshot,
) -> &'a SessionSnapshot {
    if !local.has_session_id() && remote.has_session_id() {
        return remote;
    }

    match local.completion_count().cmp(&remote.completion_count()) {
        Ordering::Greater => local,
        Ordering::Less => remote,
        Ordering::Equal => match (local.last_saved, remote.last_saved) {
            (Some(l), Some(r)) if r > l => remote,
            _ => local,
        },
    }
}
