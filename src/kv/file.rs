//! File-backed key-value backend.
//!
//! Layout under the configured directory:
//!
//! ```text
//! MANIFEST          magic + version
//! LOCK              exclusive advisory lock held while open
//! <sha256(key)>.kv  one file per key
//! ```
//!
//! Each value file is `magic | version | key_len u16 | key | value_len u64 |
//! value | crc32(value)`, all little-endian. Writes go to a temporary file
//! that is renamed over the old one, so a crash leaves either the old or the
//! new value.

use crate::error::{Result, SyncError};
use crate::kv::KeyValueStore;
use crate::types::Hash;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for the directory manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"WKM\0";

/// Magic bytes for value files.
const VALUE_MAGIC: &[u8; 4] = b"WKV\0";

/// Current on-disk format version.
const FORMAT_VERSION: u8 = 1;

/// File-backed cache configuration.
#[derive(Clone, Debug)]
pub struct FileKvConfig {
    /// Directory holding the cache.
    pub path: PathBuf,

    /// Read cache size (number of values).
    pub read_cache_size: usize,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileKvConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./workshop-cache"),
            read_cache_size: 64,
            create_if_missing: true,
        }
    }
}

/// Durable key-value store, one checksummed file per key.
pub struct FileKv {
    path: PathBuf,

    /// Held for the lifetime of the store.
    _lock_file: File,

    /// Recently read or written values.
    cache: Mutex<LruCache<String, String>>,
}

impl FileKv {
    /// Open an existing cache directory or create a new one.
    pub fn open(config: FileKvConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::verify_manifest(&config.path)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            Self::write_manifest(&config.path)?;
        } else {
            return Err(SyncError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(&config.path)?;
        let cache_size = NonZeroUsize::new(config.read_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path: config.path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Directory this store writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let hash = Hash::from_bytes(key.as_bytes());
        self.path.join(format!("{}.kv", hash.to_hex()))
    }

    fn read_value(&self, key: &str) -> Result<Option<String>> {
        let mut file = match File::open(self.value_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        read_field(&mut file, &mut magic, "magic")?;
        if &magic != VALUE_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid value file magic".into()));
        }

        let mut version = [0u8; 1];
        read_field(&mut file, &mut version, "version")?;
        if version[0] != FORMAT_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported value file version: {}",
                version[0]
            )));
        }

        let mut key_len_bytes = [0u8; 2];
        read_field(&mut file, &mut key_len_bytes, "key length")?;
        let key_len = u16::from_le_bytes(key_len_bytes) as usize;
        let mut key_bytes = vec![0u8; key_len];
        read_field(&mut file, &mut key_bytes, "key")?;
        if key_bytes != key.as_bytes() {
            return Err(SyncError::Corruption(format!(
                "Value file for {:?} holds a different key",
                key
            )));
        }

        let mut value_len_bytes = [0u8; 8];
        read_field(&mut file, &mut value_len_bytes, "value length")?;
        let value_len = u64::from_le_bytes(value_len_bytes);

        // Header read so far plus the trailing checksum.
        let overhead = (VALUE_MAGIC.len() + 1 + 2 + key_len + 8 + 4) as u64;
        if value_len > file_len.saturating_sub(overhead) {
            return Err(SyncError::Corruption(format!(
                "Value length {} exceeds file size {}",
                value_len, file_len
            )));
        }
        let mut value = vec![0u8; value_len as usize];
        read_field(&mut file, &mut value, "value")?;

        let mut checksum_bytes = [0u8; 4];
        read_field(&mut file, &mut checksum_bytes, "checksum")?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&value);
        if stored_checksum != computed_checksum {
            return Err(SyncError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        String::from_utf8(value)
            .map(Some)
            .map_err(|e| SyncError::Corruption(e.to_string()))
    }

    fn write_value(&self, key: &str, value: &str) -> Result<()> {
        let key_bytes = key.as_bytes();
        let key_len = u16::try_from(key_bytes.len())
            .map_err(|_| SyncError::InvalidFormat(format!("Key too long: {} bytes", key_bytes.len())))?;

        let final_path = self.value_path(key);
        let tmp_path = final_path.with_extension("kv.tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(VALUE_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.write_all(&key_len.to_le_bytes())?;
        file.write_all(key_bytes)?;
        file.write_all(&(value.len() as u64).to_le_bytes())?;
        file.write_all(value.as_bytes())?;
        file.write_all(&crc32fast::hash(value.as_bytes()).to_le_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid cache manifest magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported cache version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;
        Ok(lock_file)
    }
}

/// `read_exact` that reports a short file as corruption.
fn read_field(file: &mut File, buf: &mut [u8], field: &str) -> Result<()> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            SyncError::Corruption(format!("Truncated value file: missing {}", field))
        }
        _ => e.into(),
    })
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.cache.lock().get(key).cloned() {
            return Ok(Some(value));
        }

        let value = self.read_value(key)?;
        if let Some(ref v) = value {
            self.cache.lock().put(key.to_string(), v.clone());
        }
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write_value(key, value)?;
        self.cache.lock().put(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.cache.lock().pop(key);
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> FileKvConfig {
        FileKvConfig {
            path: dir.path().join("cache"),
            read_cache_size: 4,
            create_if_missing: true,
        }
    }

    #[test]
    fn test_set_and_get() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(config(&dir)).unwrap();

        kv.set("workshop_state", "{\"a\":1}").unwrap();
        assert_eq!(kv.get("workshop_state").unwrap().as_deref(), Some("{\"a\":1}"));
        assert!(kv.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = FileKv::open(config(&dir)).unwrap();
            kv.set("k", "persisted ✓").unwrap();
        }

        let kv = FileKv::open(config(&dir)).unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("persisted ✓"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(config(&dir)).unwrap();

        kv.set("k", "v").unwrap();
        kv.remove("k").unwrap();
        kv.remove("k").unwrap();
        assert!(kv.get("k").unwrap().is_none());
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _kv = FileKv::open(config(&dir)).unwrap();

        let result = FileKv::open(config(&dir));
        assert!(matches!(result, Err(SyncError::Locked)));
    }

    #[test]
    fn test_missing_directory_without_create() {
        let dir = TempDir::new().unwrap();
        let result = FileKv::open(FileKvConfig {
            create_if_missing: false,
            ..config(&dir)
        });
        assert!(matches!(result, Err(SyncError::NotInitialized)));
    }

    #[test]
    fn test_detects_corrupted_value() {
        let dir = TempDir::new().unwrap();
        let value_path;
        {
            let kv = FileKv::open(config(&dir)).unwrap();
            kv.set("k", "original").unwrap();
            value_path = kv.value_path("k");
        }

        // Flip a byte inside the value region
        let mut bytes = fs::read(&value_path).unwrap();
        let value_start = 4 + 1 + 2 + 1 + 8;
        bytes[value_start] ^= 0xff;
        fs::write(&value_path, bytes).unwrap();

        let kv = FileKv::open(config(&dir)).unwrap();
        assert!(matches!(kv.get("k"), Err(SyncError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_oversized_length_prefix_is_corruption() {
        let dir = TempDir::new().unwrap();
        let value_path;
        {
            let kv = FileKv::open(config(&dir)).unwrap();
            kv.set("k", "original").unwrap();
            value_path = kv.value_path("k");
        }

        let mut bytes = fs::read(&value_path).unwrap();
        let len_start = 4 + 1 + 2 + 1;
        bytes[len_start..len_start + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&value_path, bytes).unwrap();

        let kv = FileKv::open(config(&dir)).unwrap();
        assert!(matches!(kv.get("k"), Err(SyncError::Corruption(_))));
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let value_path;
        {
            let kv = FileKv::open(config(&dir)).unwrap();
            kv.set("k", "original").unwrap();
            value_path = kv.value_path("k");
        }

        let bytes = fs::read(&value_path).unwrap();
        fs::write(&value_path, &bytes[..6]).unwrap();

        let kv = FileKv::open(config(&dir)).unwrap();
        assert!(matches!(kv.get("k"), Err(SyncError::Corruption(_))));
    }
}
