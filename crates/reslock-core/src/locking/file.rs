//! File-system locker
//!
//! Every held lock is a marker file in the lock directory:
//!
//! - `<digest>.write` for the single writer, claimed with an atomic
//!   create-if-absent and holding the writer's token;
//! - `<digest>.read.<token>` (empty) for each reader.
//!
//! Both sides publish before they check. A writer claims `.write` and then
//! waits for the reader markers to drain; a reader creates its marker and
//! withdraws it again if `.write` is present. Whichever order the two race
//! in, at least one of them sees the other, so they never both proceed.
//!
//! A write marker is only removed by the writer whose token it holds, so a
//! stale handle cannot release a lock that was swept and claimed again. A
//! marker published by an acquire that is cancelled before it returns is
//! withdrawn in the background.
//!
//! Markers survive a crash. They are only cleared by [`ResourceLocker::sweep`]
//! at startup, never by age.

use super::handle::LockHandle;
use super::key::LockKey;
use super::locker::{ResourceLocker, SweepReport};
use super::types::{BackendKind, LockError, LockMode, LockResult, RetryPolicy};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Locker backed by marker files in a directory
#[derive(Debug, Clone)]
pub struct FileSystemLocker {
    lock_dir: PathBuf,
    retry: RetryPolicy,
}

/// A marker this acquire is publishing but has not handed out yet
///
/// Dropped while armed, it removes the marker once any pending creation has
/// finished. Write markers are only removed while they still hold `owner`.
struct Claim {
    lock_dir: PathBuf,
    path: PathBuf,
    owner: Option<String>,
    creating: Option<JoinHandle<LockResult<bool>>>,
    armed: bool,
}

impl Claim {
    fn writer(lock_dir: &Path, path: PathBuf, token: Uuid) -> Self {
        Self {
            lock_dir: lock_dir.to_path_buf(),
            path,
            owner: Some(token.simple().to_string()),
            creating: None,
            armed: true,
        }
    }

    fn reader(lock_dir: &Path, path: PathBuf) -> Self {
        Self {
            lock_dir: lock_dir.to_path_buf(),
            path,
            owner: None,
            creating: None,
            armed: true,
        }
    }

    /// Try to create the marker; `false` if it already exists
    async fn publish(&mut self) -> LockResult<bool> {
        let contents = self.owner.clone().unwrap_or_default().into_bytes();
        let creating = self.creating.insert(tokio::spawn(publish(
            self.lock_dir.clone(),
            self.path.clone(),
            contents,
        )));
        let outcome = creating.await;
        self.creating = None;
        outcome.map_err(|e| {
            LockError::InvalidState(format!(
                "creating lock file {} failed: {}",
                self.path.display(),
                e
            ))
        })?
    }

    /// The marker now belongs to a handle
    fn complete(mut self) {
        self.armed = false;
    }

    /// Remove the marker now, if it is ours
    async fn withdraw(mut self) {
        self.armed = false;
        if let Some(creating) = self.creating.take() {
            let _ = creating.await;
        }
        discard(&self.path, self.owner.as_deref()).await;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        let owner = self.owner.take();
        let creating = self.creating.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(creating) = creating {
                        let _ = creating.await;
                    }
                    discard(&path, owner.as_deref()).await;
                });
            }
            Err(_) => {
                warn!(path = %path.display(), "Cancelled lock claim dropped outside of a runtime");
            }
        }
    }
}

impl FileSystemLocker {
    /// Create a locker over `lock_dir` (created on first use)
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the backoff used while a marker is contended
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn write_marker(&self, key: &LockKey) -> PathBuf {
        self.lock_dir.join(format!("{}.write", key.digest()))
    }

    fn read_marker(&self, key: &LockKey, token: Uuid) -> PathBuf {
        self.lock_dir
            .join(format!("{}.read.{}", key.digest(), token.simple()))
    }

    async fn exists(&self, path: &Path) -> LockResult<bool> {
        fs::try_exists(path).await.map_err(|e| {
            LockError::Io(format!("Failed to check lock file {}: {}", path.display(), e))
        })
    }

    /// Whether any reader marker exists for the digest
    async fn has_readers(&self, digest: &str) -> LockResult<bool> {
        let prefix = format!("{}.read.", digest);
        let mut entries = match fs::read_dir(&self.lock_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(dir_error(&self.lock_dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| dir_error(&self.lock_dir, e))?
        {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn acquire_write(&self, key: &LockKey, timeout: Duration) -> LockResult<LockHandle> {
        let token = Uuid::new_v4();
        let mut claim = Claim::writer(&self.lock_dir, self.write_marker(key), token);
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0;

        loop {
            match claim.publish().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    claim.withdraw().await;
                    return Err(e);
                }
            }
            attempts += 1;
            if let Err(e) = self.retry.pause(key, attempts, start, deadline).await {
                claim.withdraw().await;
                return Err(e);
            }
        }

        // Holding `.write` keeps new readers out; wait for current ones
        loop {
            match self.has_readers(key.digest()).await {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => {
                    claim.withdraw().await;
                    return Err(e);
                }
            }
            attempts += 1;
            if let Err(e) = self.retry.pause(key, attempts, start, deadline).await {
                claim.withdraw().await;
                return Err(e);
            }
        }

        claim.complete();
        debug!(
            lock_key = %key,
            elapsed_ms = start.elapsed().as_millis(),
            "Write lock acquired"
        );
        Ok(LockHandle::new(key.clone(), token))
    }

    async fn acquire_read(&self, key: &LockKey, timeout: Duration) -> LockResult<LockHandle> {
        let token = Uuid::new_v4();
        let marker = self.read_marker(key, token);
        let writer = self.write_marker(key);
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0;

        loop {
            if !self.exists(&writer).await? {
                let mut claim = Claim::reader(&self.lock_dir, marker.clone());
                match claim.publish().await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Token collision; the file is not ours to remove
                        claim.complete();
                        return Err(LockError::InvalidState(format!(
                            "reader marker {} already exists",
                            marker.display()
                        )));
                    }
                    Err(e) => {
                        claim.withdraw().await;
                        return Err(e);
                    }
                }
                match self.exists(&writer).await {
                    Ok(false) => {
                        claim.complete();
                        debug!(
                            lock_key = %key,
                            elapsed_ms = start.elapsed().as_millis(),
                            "Read lock acquired"
                        );
                        return Ok(LockHandle::new(key.clone(), token));
                    }
                    Ok(true) => claim.withdraw().await,
                    Err(e) => {
                        claim.withdraw().await;
                        return Err(e);
                    }
                }
            }
            attempts += 1;
            self.retry.pause(key, attempts, start, deadline).await?;
        }
    }
}

#[async_trait]
impl ResourceLocker for FileSystemLocker {
    fn backend(&self) -> BackendKind {
        BackendKind::File
    }

    async fn acquire(&self, key: &LockKey, timeout: Duration) -> LockResult<LockHandle> {
        match key.mode() {
            LockMode::Write => self.acquire_write(key, timeout).await,
            LockMode::Read => self.acquire_read(key, timeout).await,
        }
    }

    async fn release(&self, handle: LockHandle) -> LockResult<()> {
        let key = handle.key();
        let (marker, removed) = match handle.mode() {
            LockMode::Write => {
                let marker = self.write_marker(key);
                let owner = handle.token().simple().to_string();
                let removed = remove_owned(&marker, &owner).await;
                (marker, removed)
            }
            LockMode::Read => {
                let marker = self.read_marker(key, handle.token());
                let removed = fs::remove_file(&marker).await.map(|()| true);
                (marker, removed)
            }
        };

        match removed {
            Ok(true) => {
                debug!(lock_key = %key, "Lock released");
                Ok(())
            }
            Ok(false) => Err(LockError::release(key, "lock is held by another owner")),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(LockError::release(key, "lock no longer exists"))
            }
            Err(e) => Err(LockError::Io(format!(
                "Failed to remove lock file {}: {}",
                marker.display(),
                e
            ))),
        }
    }

    async fn sweep(&self) -> LockResult<SweepReport> {
        let mut entries = match fs::read_dir(&self.lock_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.lock_dir)
                    .await
                    .map_err(|e| dir_error(&self.lock_dir, e))?;
                return Ok(SweepReport::default());
            }
            Err(e) => return Err(dir_error(&self.lock_dir, e)),
        };

        let mut report = SweepReport::default();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(lock_dir = %self.lock_dir.display(), error = %e, "Stopped reading lock directory");
                    report.failed += 1;
                    break;
                }
            };

            let path = entry.path();
            let removed = match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => fs::remove_dir_all(&path).await,
                _ => fs::remove_file(&path).await,
            };
            match removed {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed dangling lock file");
                    report.removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove dangling lock file");
                    report.failed += 1;
                }
            }
        }

        info!(
            lock_dir = %self.lock_dir.display(),
            removed = report.removed,
            failed = report.failed,
            "Swept lock directory"
        );
        Ok(report)
    }

    async fn artifacts(&self) -> LockResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.lock_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(dir_error(&self.lock_dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| dir_error(&self.lock_dir, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// Atomically create `path` with `contents`; `false` if it already exists
async fn publish(lock_dir: PathBuf, path: PathBuf, contents: Vec<u8>) -> LockResult<bool> {
    match create_new(&path, &contents).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(&lock_dir).await.map_err(|e| {
                LockError::Io(format!(
                    "Failed to create lock directory {}: {}",
                    lock_dir.display(),
                    e
                ))
            })?;
            match create_new(&path, &contents).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(create_error(&path, e)),
            }
        }
        Err(e) => Err(create_error(&path, e)),
    }
}

async fn create_new(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    if contents.is_empty() {
        return Ok(());
    }

    let written = async {
        file.write_all(contents).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(path).await;
        return Err(e);
    }
    Ok(())
}

/// Remove a write marker only while it holds `owner`
async fn remove_owned(path: &Path, owner: &str) -> std::io::Result<bool> {
    let current = fs::read_to_string(path).await?;
    if current.trim() != owner {
        return Ok(false);
    }
    fs::remove_file(path).await?;
    Ok(true)
}

/// Remove a marker an acquire published but is giving up on
async fn discard(path: &Path, owner: Option<&str>) {
    let removed = match owner {
        Some(owner) => remove_owned(path, owner).await.map(|_| ()),
        None => fs::remove_file(path).await,
    };
    if let Err(e) = removed
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to withdraw lock marker");
    }
}

fn create_error(path: &Path, e: std::io::Error) -> LockError {
    LockError::Io(format!("Failed to create lock file {}: {}", path.display(), e))
}

fn dir_error(dir: &Path, e: std::io::Error) -> LockError {
    LockError::Io(format!("Failed to read lock directory {}: {}", dir.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::types::ResourceIdentifier;
    use tempfile::TempDir;

    const SHORT: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(5);

    fn create_test_locker() -> (FileSystemLocker, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let retry = RetryPolicy::default()
            .with_delays(Duration::from_millis(5), Duration::from_millis(20));
        let locker = FileSystemLocker::new(temp_dir.path().join("locks")).with_retry(retry);
        (locker, temp_dir)
    }

    fn key(path: &str, mode: LockMode) -> LockKey {
        LockKey::encode(&ResourceIdentifier::new(path).unwrap(), mode)
    }

    #[tokio::test]
    async fn test_write_lock_creates_marker_file() {
        let (locker, _temp) = create_test_locker();
        let write = key("container1/test.txt", LockMode::Write);

        let handle = locker.acquire(&write, SHORT).await.unwrap();
        let marker = locker.lock_dir().join(write.name());
        assert_eq!(
            std::fs::read_to_string(&marker).unwrap(),
            handle.token().simple().to_string()
        );

        locker.release(handle).await.unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_acquire_release_acquire() {
        let (locker, _temp) = create_test_locker();
        let write = key("doc", LockMode::Write);

        for _ in 0..3 {
            let handle = locker.acquire(&write, SHORT).await.unwrap();
            locker.release(handle).await.unwrap();
        }
        assert!(locker.artifacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contended_write_times_out() {
        let (locker, _temp) = create_test_locker();
        let write = key("doc", LockMode::Write);

        let held = locker.acquire(&write, SHORT).await.unwrap();
        let err = locker.acquire(&write, SHORT).await.unwrap_err();
        assert!(err.is_timeout());

        locker.release(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_readers_share_and_block_writer() {
        let (locker, _temp) = create_test_locker();
        let read = key("doc", LockMode::Read);

        let first = locker.acquire(&read, SHORT).await.unwrap();
        let second = locker.acquire(&read, SHORT).await.unwrap();
        assert_eq!(locker.artifacts().await.unwrap().len(), 2);

        let err = locker
            .acquire(&read.with_mode(LockMode::Write), SHORT)
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // The writer withdrew its claim when it gave up
        assert_eq!(locker.artifacts().await.unwrap().len(), 2);

        locker.release(first).await.unwrap();
        locker.release(second).await.unwrap();

        let writer = locker.acquire(&read.with_mode(LockMode::Write), SHORT).await.unwrap();
        locker.release(writer).await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_blocks_readers() {
        let (locker, _temp) = create_test_locker();
        let write = key("doc", LockMode::Write);

        let held = locker.acquire(&write, SHORT).await.unwrap();
        let err = locker
            .acquire(&write.with_mode(LockMode::Read), SHORT)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(locker.artifacts().await.unwrap(), vec![write.name()]);

        locker.release(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_marker_removed_fails() {
        let (locker, _temp) = create_test_locker();
        let write = key("doc", LockMode::Write);

        let handle = locker.acquire(&write, SHORT).await.unwrap();
        std::fs::remove_file(locker.lock_dir().join(write.name())).unwrap();

        let err = locker.release(handle).await.unwrap_err();
        assert!(err.is_release());
    }

    #[tokio::test]
    async fn test_sweep_removes_everything() {
        let (locker, _temp) = create_test_locker();

        let _w = locker.acquire(&key("a", LockMode::Write), SHORT).await.unwrap();
        let _r = locker.acquire(&key("b", LockMode::Read), SHORT).await.unwrap();
        std::fs::write(locker.lock_dir().join("stray"), b"x").unwrap();
        std::fs::create_dir(locker.lock_dir().join("nested")).unwrap();

        let report = locker.sweep().await.unwrap();
        assert_eq!(report.removed, 4);
        assert_eq!(report.failed, 0);
        assert!(locker.artifacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_creates_missing_directory() {
        let (locker, _temp) = create_test_locker();
        assert!(!locker.lock_dir().exists());

        let report = locker.sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(locker.lock_dir().exists());
    }

    #[tokio::test]
    async fn test_stale_release_keeps_new_owner_lock() {
        let (locker, _temp) = create_test_locker();
        let write = key("doc", LockMode::Write);

        let stale = locker.acquire(&write, SHORT).await.unwrap();
        locker.sweep().await.unwrap();
        let current = locker.acquire(&write, SHORT).await.unwrap();

        let err = locker.release(stale).await.unwrap_err();
        assert!(err.is_release());
        assert!(err.to_string().contains("held by another owner"));

        // The new owner still excludes other writers
        assert_eq!(locker.artifacts().await.unwrap(), vec![write.name()]);
        let err = locker.acquire(&write, SHORT).await.unwrap_err();
        assert!(err.is_timeout());

        locker.release(current).await.unwrap();
        assert!(locker.artifacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_writer_withdraws_claim() {
        let (locker, _temp) = create_test_locker();
        let read = key("doc", LockMode::Read);
        let write = read.with_mode(LockMode::Write);

        let reader = locker.acquire(&read, SHORT).await.unwrap();

        // Claims `.write`, then is dropped while waiting for the reader
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), locker.acquire(&write, LONG)).await;
        assert!(cancelled.is_err());

        locker.release(reader).await.unwrap();

        let mut remaining = locker.artifacts().await.unwrap();
        for _ in 0..50 {
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            remaining = locker.artifacts().await.unwrap();
        }
        assert!(remaining.is_empty(), "leftover markers: {:?}", remaining);

        let writer = locker.acquire(&write, SHORT).await.unwrap();
        locker.release(writer).await.unwrap();
    }
}
