//! In-memory locker
//!
//! A table from resource digest to a waiter structure. Requests are served
//! strictly FIFO per resource: a request is granted on arrival only if nobody
//! is queued and the mode is compatible, otherwise it waits on a oneshot
//! channel until it reaches the front of the queue. Consecutive readers at the
//! front are granted together; a queued writer holds back everyone behind it.
//!
//! The table mutex only guards bookkeeping and is never held across an await
//! on a grant. Nothing here outlives the process, so there is nothing to sweep.

use super::handle::LockHandle;
use super::key::LockKey;
use super::locker::ResourceLocker;
use super::types::{BackendKind, LockError, LockMode, LockResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

type LockTable = Arc<Mutex<HashMap<String, KeyState>>>;

#[derive(Debug)]
struct Waiter {
    token: Uuid,
    mode: LockMode,
    notify: oneshot::Sender<()>,
}

/// Per-resource state
#[derive(Debug, Default)]
struct KeyState {
    readers: usize,
    writer: bool,
    holders: HashMap<Uuid, LockMode>,
    queue: VecDeque<Waiter>,
}

impl KeyState {
    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer,
            LockMode::Write => !self.writer && self.readers == 0,
        }
    }

    fn grant(&mut self, token: Uuid, mode: LockMode) {
        self.holders.insert(token, mode);
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Write => self.writer = true,
        }
    }

    fn revoke(&mut self, token: Uuid) -> Option<LockMode> {
        let mode = self.holders.remove(&token)?;
        match mode {
            LockMode::Read => self.readers = self.readers.saturating_sub(1),
            LockMode::Write => self.writer = false,
        }
        Some(mode)
    }

    /// Grant queued waiters from the front for as long as they are eligible
    fn promote(&mut self) {
        loop {
            let eligible = match self.queue.front() {
                Some(waiter) => self.compatible(waiter.mode),
                None => false,
            };
            if !eligible {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };

            self.grant(waiter.token, waiter.mode);
            if waiter.notify.send(()).is_err() {
                // Waiter went away before its turn
                self.revoke(waiter.token);
            }
        }
    }

    /// Forget a waiter or holder that will never release normally
    fn discard(&mut self, token: Uuid) {
        self.queue.retain(|waiter| waiter.token != token);
        self.revoke(token);
        self.promote();
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

/// Removes a queued waiter if its acquire future is dropped mid-wait
struct PendingWaiter {
    table: LockTable,
    digest: String,
    token: Uuid,
    armed: bool,
}

impl PendingWaiter {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let table = self.table.clone();
        let digest = std::mem::take(&mut self.digest);
        let token = self.token;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let mut table = table.lock().await;
                    if let Some(state) = table.get_mut(&digest) {
                        state.discard(token);
                        if state.is_idle() {
                            table.remove(&digest);
                        }
                    }
                });
            }
            Err(_) => warn!(lock_key = %digest, "Cancelled lock waiter dropped outside of a runtime"),
        }
    }
}

/// Process-local read/write locker
///
/// Owned by the composition root and shared by reference (`Arc`); cloning
/// shares the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocker {
    table: LockTable,
}

impl MemoryLocker {
    /// Create an empty locker
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle a waiter whose timeout fired
    ///
    /// The grant may have raced the timeout; a waiter that was granted keeps
    /// its lock.
    async fn abandon(&self, key: &LockKey, token: Uuid, waited: Duration) -> LockResult<LockHandle> {
        let mut table = self.table.lock().await;
        let Some(state) = table.get_mut(key.digest()) else {
            return Err(LockError::timeout(key, waited));
        };

        if state.holders.contains_key(&token) {
            debug!(lock_key = %key, "Lock granted as the wait timed out");
            return Ok(LockHandle::new(key.clone(), token));
        }

        state.discard(token);
        if state.is_idle() {
            table.remove(key.digest());
        }
        Err(LockError::timeout(key, waited))
    }
}

#[async_trait]
impl ResourceLocker for MemoryLocker {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn acquire(&self, key: &LockKey, timeout: Duration) -> LockResult<LockHandle> {
        let token = Uuid::new_v4();
        let mode = key.mode();
        let start = Instant::now();

        let granted = {
            let mut table = self.table.lock().await;
            let state = table.entry(key.digest().to_string()).or_default();

            if state.queue.is_empty() && state.compatible(mode) {
                state.grant(token, mode);
                debug!(lock_key = %key, "Lock acquired");
                return Ok(LockHandle::new(key.clone(), token));
            }

            let (notify, granted) = oneshot::channel();
            state.queue.push_back(Waiter {
                token,
                mode,
                notify,
            });
            debug!(lock_key = %key, queued = state.queue.len(), "Waiting for lock");
            granted
        };

        let mut pending = PendingWaiter {
            table: self.table.clone(),
            digest: key.digest().to_string(),
            token,
            armed: true,
        };

        let outcome = tokio::time::timeout(timeout, granted).await;
        pending.disarm();

        match outcome {
            Ok(Ok(())) => {
                debug!(
                    lock_key = %key,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Lock acquired after waiting"
                );
                Ok(LockHandle::new(key.clone(), token))
            }
            Ok(Err(_)) => Err(LockError::InvalidState(format!(
                "waiter for '{}' was dropped without a grant",
                key
            ))),
            Err(_) => self.abandon(key, token, start.elapsed()).await,
        }
    }

    async fn release(&self, handle: LockHandle) -> LockResult<()> {
        let key = handle.key();
        let mut table = self.table.lock().await;

        let Some(state) = table.get_mut(key.digest()) else {
            return Err(LockError::release(key, "lock no longer exists"));
        };

        match state.holders.get(&handle.token()) {
            None => return Err(LockError::release(key, "lock no longer exists")),
            Some(mode) if *mode != handle.mode() => {
                return Err(LockError::release(
                    key,
                    format!("lock is held in {} mode", mode),
                ));
            }
            Some(_) => {}
        }

        state.revoke(handle.token());
        state.promote();
        let idle = state.is_idle();
        if idle {
            table.remove(key.digest());
        }

        debug!(lock_key = %key, "Lock released");
        Ok(())
    }

    async fn artifacts(&self) -> LockResult<Vec<String>> {
        let table = self.table.lock().await;
        let mut names: Vec<String> = table
            .iter()
            .flat_map(|(digest, state)| {
                state
                    .holders
                    .iter()
                    .map(move |(token, mode)| format!("{}.{}#{}", digest, mode, token))
            })
            .collect();
        names.sort();
        Ok(names)
    }
}
