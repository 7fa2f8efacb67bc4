//! Durable key-value backends.
//!
//! The local cache, the offline queue and the session history all persist
//! through a [`KeyValueStore`]: string keys, string (serialized) values and
//! no built-in expiry. Expiry is layered on top by the local cache adapter.
//!
//! Two backends are provided:
//! - [`MemoryKv`]: process-local, for tests and ephemeral sessions
//! - [`FileKv`]: one checksummed file per key under a locked directory

mod file;
mod memory;

pub use file::{FileKv, FileKvConfig};
pub use memory::MemoryKv;

use crate::error::Result;

/// Origin-scoped string key-value storage.
pub trait KeyValueStore: Send + Sync {
    /// Read the value for `key`, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}
