//! Reslock Core Integration Tests

use reslock_core::{
    Error, Result,
    config::{FileConfig, LockerConfig},
    lifecycle::Bootstrap,
    locking::{
        BackendKind, FileSystemLocker, LockKey, LockMode, LockingStack, MemoryLocker,
        ReadWriteLocker, ResourceIdentifier, ResourceLocker, RetryPolicy, StartupSweep,
    },
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Barrier, Mutex};

const TEST_RESOURCE: &str = "http://localhost/container1/test.txt";

/// Minimal resource store whose operations run under the coordinator
struct LockedStore {
    coordinator: ReadWriteLocker,
    resources: Mutex<HashMap<String, String>>,
}

impl LockedStore {
    fn new(coordinator: ReadWriteLocker) -> Self {
        Self {
            coordinator,
            resources: Mutex::new(HashMap::new()),
        }
    }

    async fn write(&self, id: &ResourceIdentifier, body: &str) -> Result<()> {
        self.coordinator
            .with_write_lock(id, || async {
                self.resources
                    .lock()
                    .await
                    .insert(id.to_string(), body.to_string());
                Ok(())
            })
            .await
    }

    async fn read(&self, id: &ResourceIdentifier) -> Result<Option<String>> {
        self.coordinator
            .with_read_lock(id, || async {
                Ok(self.resources.lock().await.get(id.as_str()).cloned())
            })
            .await
    }
}

fn resource() -> ResourceIdentifier {
    ResourceIdentifier::new(TEST_RESOURCE).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_delays(Duration::from_millis(2), Duration::from_millis(20))
}

fn file_locker(dir: &Path) -> Arc<dyn ResourceLocker> {
    Arc::new(FileSystemLocker::new(dir).with_retry(fast_retry()))
}

#[tokio::test]
async fn test_dangling_file_lock_cleared_at_startup() {
    let temp = TempDir::new().unwrap();
    let locker = file_locker(temp.path());
    let bootstrap = Bootstrap::new().register(Arc::new(StartupSweep::new(locker.clone())));
    bootstrap.initialize_all().await.unwrap();

    let store = LockedStore::new(
        ReadWriteLocker::new(locker.clone()).with_timeout(Duration::from_millis(200)),
    );
    store.write(&resource(), "hello").await.unwrap();

    // A write lock acquired and never released, as by a crashed process
    let _dangling = locker
        .acquire(&LockKey::encode(&resource(), LockMode::Write), Duration::ZERO)
        .await
        .unwrap();

    let err = store.write(&resource(), "blocked").await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));
    assert!(err.is_transient());

    // Next startup clears it
    bootstrap.initialize_all().await.unwrap();
    store.write(&resource(), "after restart").await.unwrap();
    assert_eq!(
        store.read(&resource()).await.unwrap().as_deref(),
        Some("after restart")
    );
    assert!(locker.artifacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dangling_marker_from_previous_process() {
    let temp = TempDir::new().unwrap();
    let key = LockKey::encode(&resource(), LockMode::Write);
    std::fs::write(temp.path().join(key.name()), "").unwrap();
    std::fs::create_dir(temp.path().join("stray-dir")).unwrap();

    let config = LockerConfig {
        backend: BackendKind::File,
        acquire_timeout_ms: 200,
        file: FileConfig {
            lock_dir: temp.path().to_path_buf(),
        },
        ..LockerConfig::default()
    };
    let stack = LockingStack::from_config(&config).await.unwrap();

    let report = stack.sweep().run().await.unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(report.failed, 0);

    let store = LockedStore::new(stack.coordinator().clone());
    store.write(&resource(), "data").await.unwrap();
}

#[tokio::test]
async fn test_sweep_during_held_lock_surfaces_release_error() {
    let temp = TempDir::new().unwrap();
    let locker = file_locker(temp.path());
    let sweep = StartupSweep::new(locker.clone());
    let coordinator = ReadWriteLocker::new(locker.clone()).with_timeout(Duration::from_millis(500));
    let id = resource();

    let nested_ran = Arc::new(AtomicUsize::new(0));
    let outer = coordinator
        .with_write_lock(&id, || async {
            // Another process starting up against the same store
            sweep.run().await?;

            let ran = nested_ran.clone();
            coordinator
                .with_write_lock(&id, || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                })
                .await?;
            Ok::<_, Error>("outer done")
        })
        .await;

    assert_eq!(nested_ran.load(Ordering::SeqCst), 1);
    match outer {
        Err(Error::LockRelease(e)) => {
            assert!(e.to_string().contains("lock no longer exists"))
        }
        other => panic!("expected release failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stale_release_leaves_new_writer_in_place() {
    let temp = TempDir::new().unwrap();
    let locker = file_locker(temp.path());
    let sweep = StartupSweep::new(locker.clone());
    let coordinator = ReadWriteLocker::new(locker.clone()).with_timeout(Duration::from_millis(200));
    let id = resource();
    let write = LockKey::encode(&id, LockMode::Write);

    let fresh = Mutex::new(None);
    let outer = coordinator
        .with_write_lock(&id, || async {
            // Another process restarts and takes the lock for itself
            sweep.run().await?;
            let handle = locker.acquire(&write, Duration::ZERO).await?;
            *fresh.lock().await = Some(handle);
            Ok::<_, Error>(())
        })
        .await;

    match outer {
        Err(Error::LockRelease(e)) => {
            assert!(e.to_string().contains("held by another owner"))
        }
        other => panic!("expected release failure, got {:?}", other),
    }

    // The new holder still owns the resource
    let err = coordinator
        .with_write_lock(&id, || async { Ok::<_, Error>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));

    let handle = fresh.lock().await.take().unwrap();
    locker.release(handle).await.unwrap();
    coordinator
        .with_write_lock(&id, || async { Ok::<_, Error>(()) })
        .await
        .unwrap();
    assert!(locker.artifacts().await.unwrap().is_empty());
}

async fn assert_mutual_exclusion(locker: Arc<dyn ResourceLocker>) {
    let coordinator = ReadWriteLocker::new(locker).with_timeout(Duration::from_secs(10));
    let id = resource();
    let writers = Arc::new(AtomicUsize::new(0));
    let readers = Arc::new(AtomicUsize::new(0));
    let max_writers = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let coordinator = coordinator.clone();
        let id = id.clone();
        let writers = writers.clone();
        let readers = readers.clone();
        let max_writers = max_writers.clone();
        let completed = completed.clone();

        tasks.push(tokio::spawn(async move {
            let outcome = if i % 3 == 0 {
                coordinator
                    .with_read_lock(&id, || async {
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers.load(Ordering::SeqCst), 0, "reader overlapped a writer");
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        assert_eq!(writers.load(Ordering::SeqCst), 0, "reader overlapped a writer");
                        readers.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Error>(())
                    })
                    .await
            } else {
                coordinator
                    .with_write_lock(&id, || async {
                        let active = writers.fetch_add(1, Ordering::SeqCst) + 1;
                        max_writers.fetch_max(active, Ordering::SeqCst);
                        assert_eq!(readers.load(Ordering::SeqCst), 0, "writer overlapped a reader");
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        writers.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Error>(())
                    })
                    .await
            };
            outcome.map(|()| completed.fetch_add(1, Ordering::SeqCst))
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 12);
    assert_eq!(max_writers.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_mutual_exclusion() {
    let locker = Arc::new(MemoryLocker::new());
    assert_mutual_exclusion(locker.clone()).await;
    assert!(locker.artifacts().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_mutual_exclusion() {
    let temp = TempDir::new().unwrap();
    let locker = file_locker(temp.path());
    assert_mutual_exclusion(locker.clone()).await;
    assert!(locker.artifacts().await.unwrap().is_empty());
}

async fn assert_readers_overlap(locker: Arc<dyn ResourceLocker>) {
    let coordinator = ReadWriteLocker::new(locker).with_timeout(Duration::from_secs(2));
    let barrier = Arc::new(Barrier::new(2));

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let coordinator = coordinator.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .with_read_lock(&resource(), || async {
                    // Both readers must be inside at the same time to pass
                    barrier.wait().await;
                    Ok::<_, Error>(())
                })
                .await
        }));
    }

    let joined = tokio::time::timeout(Duration::from_secs(5), async {
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "readers did not share the lock");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_memory_readers_share() {
    assert_readers_overlap(Arc::new(MemoryLocker::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_readers_share() {
    let temp = TempDir::new().unwrap();
    assert_readers_overlap(file_locker(temp.path())).await;
}

#[tokio::test]
async fn test_read_and_write_keys_are_distinct_artifacts() {
    let temp = TempDir::new().unwrap();
    let locker = file_locker(temp.path());
    let id = resource();

    let read = locker
        .acquire(&LockKey::encode(&id, LockMode::Read), Duration::ZERO)
        .await
        .unwrap();
    let artifacts = locker.artifacts().await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].contains(".read"));

    // Writer cannot get in while the reader holds
    let err = locker
        .acquire(&LockKey::encode(&id, LockMode::Write), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    locker.release(read).await.unwrap();
    assert!(locker.artifacts().await.unwrap().is_empty());
}
