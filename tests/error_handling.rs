//! Degraded paths: expired or corrupt caches, failing and slow remotes.

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use workshop_sync::adapters::{DEFAULT_LOCAL_EXPIRY, LOCAL_SNAPSHOT_KEY};
use workshop_sync::queue::OFFLINE_QUEUE_KEY;
use workshop_sync::{
    Connectivity, FileKv, FileKvConfig, Hash, KeyValueStore, LoadSource, LocalCacheAdapter,
    MemoryKv, MemoryReactiveStore, MemoryRemote, RemoteStoreAdapter, SessionSnapshot,
    SnapshotTier, SyncConfig, SyncCoordinator, SyncError, Tiers, Timestamp,
};

fn coordinator(
    config: SyncConfig,
    online: bool,
    kv: Arc<dyn KeyValueStore>,
    remote: Arc<MemoryRemote>,
) -> SyncCoordinator {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let tiers = Tiers::standard(
        &config,
        Arc::new(MemoryReactiveStore::new()),
        kv,
        remote,
        Arc::new(Connectivity::new(online)),
    );
    SyncCoordinator::new(config, tiers).unwrap()
}

fn quiet_config() -> SyncConfig {
    SyncConfig {
        debounce: Duration::from_secs(10),
        retry_base_delay: Duration::from_secs(60),
        ..Default::default()
    }
}

fn file_kv(dir: &TempDir) -> FileKv {
    FileKv::open(FileKvConfig {
        path: dir.path().join("cache"),
        ..Default::default()
    })
    .unwrap()
}

// --- Local cache ---

#[test]
fn test_expired_local_cache_is_not_loaded() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let written = Timestamp::now().minus(DEFAULT_LOCAL_EXPIRY + Duration::from_secs(60));
    LocalCacheAdapter::new(kv.clone())
        .save_at(&SessionSnapshot::new("s1"), written)
        .unwrap();

    let sync = coordinator(quiet_config(), false, kv.clone(), Arc::new(MemoryRemote::new()));

    assert!(!sync.load().is_found());
    assert!(kv.get(LOCAL_SNAPSHOT_KEY).unwrap().is_none());
}

#[test]
fn test_fresh_local_cache_is_loaded_intact() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let snapshot = SessionSnapshot::new("s1")
        .with_step(3)
        .with_completed(vec![1, 2])
        .with_last_saved(Timestamp(42));
    let written = Timestamp::now().minus(Duration::from_secs(23 * 60 * 60));
    LocalCacheAdapter::new(kv.clone()).save_at(&snapshot, written).unwrap();

    let sync = coordinator(quiet_config(), false, kv, Arc::new(MemoryRemote::new()));
    let loaded = sync.load();

    assert_eq!(loaded.source(), Some(LoadSource::LocalCache));
    assert_eq!(loaded.into_snapshot().unwrap(), snapshot);
}

#[test]
fn test_custom_expiry_is_honoured() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let written = Timestamp::now().minus(Duration::from_secs(120));
    LocalCacheAdapter::new(kv.clone())
        .save_at(&SessionSnapshot::new("s1"), written)
        .unwrap();

    let config = SyncConfig {
        local_expiry: Duration::from_secs(60),
        ..quiet_config()
    };
    let sync = coordinator(config, false, kv, Arc::new(MemoryRemote::new()));
    assert!(!sync.load().is_found());
}

#[test]
fn test_unparsable_local_cache_is_absent() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    kv.set(LOCAL_SNAPSHOT_KEY, "{\"data\": {\"sessionId\": ").unwrap();

    let sync = coordinator(quiet_config(), false, kv.clone(), Arc::new(MemoryRemote::new()));

    assert!(!sync.load().is_found());
    assert!(kv.get(LOCAL_SNAPSHOT_KEY).unwrap().is_none());
}

#[test]
fn test_damaged_cache_file_is_absent() {
    let dir = TempDir::new().unwrap();
    {
        let kv = file_kv(&dir);
        LocalCacheAdapter::new(Arc::new(kv))
            .save(&SessionSnapshot::new("s1"))
            .unwrap();
    }

    // Flip one byte of the stored checksum.
    let file = dir
        .path()
        .join("cache")
        .join(format!("{}.kv", Hash::from_bytes(LOCAL_SNAPSHOT_KEY.as_bytes()).to_hex()));
    let mut bytes = fs::read(&file).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&file, bytes).unwrap();

    let kv = Arc::new(file_kv(&dir));
    let sync = coordinator(quiet_config(), false, kv.clone(), Arc::new(MemoryRemote::new()));

    assert!(!sync.load().is_found());
    assert!(!file.exists());
}

#[test]
fn test_cache_directory_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let _first = file_kv(&dir);

    let second = FileKv::open(FileKvConfig {
        path: dir.path().join("cache"),
        ..Default::default()
    });
    assert!(matches!(second, Err(SyncError::Locked)));
}

#[test]
fn test_missing_cache_directory_without_create() {
    let dir = TempDir::new().unwrap();
    let result = FileKv::open(FileKvConfig {
        path: dir.path().join("absent"),
        create_if_missing: false,
        ..Default::default()
    });
    assert!(matches!(result, Err(SyncError::NotInitialized)));
}

// --- Remote ---

#[test]
fn test_remote_failure_queues_write_and_keeps_local() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let remote = Arc::new(MemoryRemote::new());
    remote.set_failing(true);
    let sync = coordinator(quiet_config(), true, kv.clone(), remote.clone());

    sync.save(SessionSnapshot::new("s1").with_step(2));
    sync.save_immediately();

    assert_eq!(sync.offline_queue_status().count, 1);
    assert_eq!(remote.write_count(), 0);
    let local = LocalCacheAdapter::new(kv).load().unwrap().unwrap();
    assert_eq!(local.current_step, 2);
}

#[test]
fn test_remote_timeout_queues_write() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_latency(Some(Duration::from_millis(300)));
    let config = SyncConfig {
        remote_timeout: Duration::from_millis(50),
        ..quiet_config()
    };
    let sync = coordinator(config, true, Arc::new(MemoryKv::new()), remote);

    sync.save(SessionSnapshot::new("s1"));
    sync.save_immediately();

    assert_eq!(sync.offline_queue_status().count, 1);
}

#[test]
fn test_remote_load_failure_falls_back_to_local() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    LocalCacheAdapter::new(kv.clone())
        .save(&SessionSnapshot::new("s1").with_step(5))
        .unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_failing(true);

    let sync = coordinator(quiet_config(), true, kv, remote);
    let loaded = sync.load();

    assert_eq!(loaded.source(), Some(LoadSource::LocalCache));
    assert_eq!(loaded.snapshot().unwrap().current_step, 5);
}

#[test]
fn test_remote_adapter_rejects_sessionless_snapshot() {
    let remote = Arc::new(MemoryRemote::new());
    let adapter = RemoteStoreAdapter::new(remote.clone());

    let result = adapter.save(&SessionSnapshot::default());
    assert!(matches!(result, Err(SyncError::MissingSessionId)));

    let mut blank = SessionSnapshot::new("");
    blank.current_step = 1;
    assert!(matches!(adapter.save(&blank), Err(SyncError::MissingSessionId)));
    assert_eq!(remote.write_count(), 0);
}

#[test]
fn test_transient_errors() {
    assert!(SyncError::Timeout(Duration::from_secs(1)).is_transient());
    assert!(SyncError::Remote("503".into()).is_transient());
    assert!(!SyncError::MissingSessionId.is_transient());
    assert!(!SyncError::ChecksumMismatch { expected: 1, got: 2 }.is_transient());
}

#[test]
fn test_cache_file_with_bad_length_prefix_is_absent() {
    let dir = TempDir::new().unwrap();
    {
        let kv = file_kv(&dir);
        LocalCacheAdapter::new(Arc::new(kv))
            .save(&SessionSnapshot::new("s1"))
            .unwrap();
    }

    // Value length follows magic, version, key length and the key itself.
    let file = dir
        .path()
        .join("cache")
        .join(format!("{}.kv", Hash::from_bytes(LOCAL_SNAPSHOT_KEY.as_bytes()).to_hex()));
    let mut bytes = fs::read(&file).unwrap();
    let len_start = 4 + 1 + 2 + LOCAL_SNAPSHOT_KEY.len();
    bytes[len_start..len_start + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    fs::write(&file, bytes).unwrap();

    let kv = Arc::new(file_kv(&dir));
    let sync = coordinator(quiet_config(), false, kv, Arc::new(MemoryRemote::new()));

    assert!(!sync.load().is_found());
    assert!(!file.exists());
}

#[test]
fn test_truncated_queue_file_does_not_block_startup() {
    let dir = TempDir::new().unwrap();
    {
        let kv: Arc<dyn KeyValueStore> = Arc::new(file_kv(&dir));
        let sync = coordinator(quiet_config(), false, kv, Arc::new(MemoryRemote::new()));
        sync.save(SessionSnapshot::new("s1"));
        sync.save_immediately();
        assert_eq!(sync.offline_queue_status().count, 1);
    }

    let file = dir
        .path()
        .join("cache")
        .join(format!("{}.kv", Hash::from_bytes(OFFLINE_QUEUE_KEY.as_bytes()).to_hex()));
    let bytes = fs::read(&file).unwrap();
    fs::write(&file, &bytes[..bytes.len() / 2]).unwrap();

    let kv = Arc::new(file_kv(&dir));
    let sync = coordinator(quiet_config(), true, kv, Arc::new(MemoryRemote::new()));
    assert_eq!(sync.offline_queue_status().count, 0);
}
