//! Redis locker
//!
//! Keys live under a dedicated namespace prefix:
//!
//! - `<ns><digest>.write`: the writer's token, with a lease (`PX`);
//! - `<ns><digest>.read`: hash of reader tokens, lease refreshed whenever a
//!   reader joins;
//! - `<ns><digest>.intent`: token of a writer that is waiting for readers to
//!   drain. New readers back off while it exists, so a steady stream of
//!   readers cannot starve a writer.
//!
//! Every step is a single Lua script, so check and mutation are atomic on
//! the server. Releasing a write lock is a compare-and-delete on the token.
//! The lease only protects against holders that die without releasing; dangling
//! keys are normally cleared by [`ResourceLocker::sweep`] at startup.

use super::handle::LockHandle;
use super::key::LockKey;
use super::locker::{ResourceLocker, SweepReport};
use super::types::{BackendKind, LockError, LockMode, LockResult, RetryPolicy};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default lease attached to every lock entry
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

// KEYS: write, read, intent. ARGV: token, lease ms, intent ms
const ACQUIRE_WRITE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
local intent = redis.call('GET', KEYS[3])
if redis.call('EXISTS', KEYS[2]) == 1 then
  if not intent or intent == ARGV[1] then
    redis.call('SET', KEYS[3], ARGV[1], 'PX', ARGV[3])
  end
  return 0
end
if intent and intent ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
if intent then
  redis.call('DEL', KEYS[3])
end
return 1
"#;

// KEYS: write, read, intent. ARGV: token, lease ms
const ACQUIRE_READ: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 or redis.call('EXISTS', KEYS[3]) == 1 then
  return 0
end
redis.call('HSET', KEYS[2], ARGV[1], '1')
redis.call('PEXPIRE', KEYS[2], ARGV[2])
return 1
"#;

// KEYS: write. ARGV: token. -1 = absent, 0 = other owner, 1 = released
const RELEASE_WRITE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

// KEYS: read. ARGV: token
const RELEASE_READ: &str = r#"
return redis.call('HDEL', KEYS[1], ARGV[1])
"#;

// KEYS: intent. ARGV: token
const WITHDRAW_INTENT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug)]
struct Scripts {
    acquire_write: Script,
    acquire_read: Script,
    release_write: Script,
    release_read: Script,
    withdraw_intent: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            acquire_write: Script::new(ACQUIRE_WRITE),
            acquire_read: Script::new(ACQUIRE_READ),
            release_write: Script::new(RELEASE_WRITE),
            release_read: Script::new(RELEASE_READ),
            withdraw_intent: Script::new(WITHDRAW_INTENT),
        }
    }
}

/// Locker backed by a Redis instance
#[derive(Clone)]
pub struct RedisLocker {
    conn: ConnectionManager,
    namespace: String,
    lease: Duration,
    retry: RetryPolicy,
    scripts: Arc<Scripts>,
}

impl std::fmt::Debug for RedisLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLocker")
            .field("namespace", &self.namespace)
            .field("lease", &self.lease)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RedisLocker {
    /// Connect to Redis and create a locker under `namespace`
    ///
    /// Example URLs:
    /// - `redis://127.0.0.1/`
    /// - `rediss://host:6379/`
    pub async fn connect(url: &str, namespace: impl Into<String>) -> LockResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LockError::Backend(format!("failed to create redis client: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| LockError::Backend(format!("failed to connect redis: {e}")))?;
        Self::with_connection(conn, namespace)
    }

    /// Create a locker over an existing connection
    pub fn with_connection(conn: ConnectionManager, namespace: impl Into<String>) -> LockResult<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            // An empty prefix would make the sweep clear the whole database
            return Err(LockError::InvalidKey(
                "redis lock namespace must not be empty".to_string(),
            ));
        }
        Ok(Self {
            conn,
            namespace,
            lease: DEFAULT_LEASE,
            retry: RetryPolicy::default(),
            scripts: Arc::new(Scripts::load()),
        })
    }

    /// Set the lease attached to lock entries
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the backoff used on contention
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn entry(&self, key: &LockKey, suffix: &str) -> String {
        format!("{}{}.{}", self.namespace, key.digest(), suffix)
    }

    /// How long a waiting writer's intent survives without being refreshed
    fn intent_ttl(&self) -> Duration {
        (self.retry.max_delay * 2 + self.retry.jitter + Duration::from_millis(100)).min(self.lease)
    }

    async fn try_acquire(&self, key: &LockKey, token: &str) -> LockResult<bool> {
        let mut conn = self.conn.clone();
        let lease_ms = self.lease.as_millis() as u64;

        let granted: i64 = match key.mode() {
            LockMode::Write => {
                self.scripts
                    .acquire_write
                    .key(self.entry(key, "write"))
                    .key(self.entry(key, "read"))
                    .key(self.entry(key, "intent"))
                    .arg(token)
                    .arg(lease_ms)
                    .arg(self.intent_ttl().as_millis() as u64)
                    .invoke_async(&mut conn)
                    .await?
            }
            LockMode::Read => {
                self.scripts
                    .acquire_read
                    .key(self.entry(key, "write"))
                    .key(self.entry(key, "read"))
                    .key(self.entry(key, "intent"))
                    .arg(token)
                    .arg(lease_ms)
                    .invoke_async(&mut conn)
                    .await?
            }
        };
        Ok(granted == 1)
    }

    async fn withdraw_intent(&self, key: &LockKey, token: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = self
            .scripts
            .withdraw_intent
            .key(self.entry(key, "intent"))
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(lock_key = %key, error = %e, "Failed to withdraw write intent");
        }
    }

    async fn scan_namespace(&self) -> LockResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(&self.namespace));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl ResourceLocker for RedisLocker {
    fn backend(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn acquire(&self, key: &LockKey, timeout: Duration) -> LockResult<LockHandle> {
        let token = Uuid::new_v4();
        let token_str = token.to_string();
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0;

        loop {
            match self.try_acquire(key, &token_str).await {
                Ok(true) => {
                    debug!(
                        lock_key = %key,
                        elapsed_ms = start.elapsed().as_millis(),
                        "Lock acquired"
                    );
                    return Ok(LockHandle::new(key.clone(), token));
                }
                Ok(false) => {}
                Err(e) => {
                    if key.mode().is_exclusive() {
                        self.withdraw_intent(key, &token_str).await;
                    }
                    return Err(e);
                }
            }

            attempts += 1;
            if let Err(e) = self.retry.pause(key, attempts, start, deadline).await {
                if key.mode().is_exclusive() {
                    self.withdraw_intent(key, &token_str).await;
                }
                return Err(e);
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> LockResult<()> {
        let mut conn = self.conn.clone();
        let key = handle.key();
        let token = handle.token().to_string();

        match handle.mode() {
            LockMode::Write => {
                let outcome: i64 = self
                    .scripts
                    .release_write
                    .key(self.entry(key, "write"))
                    .arg(&token)
                    .invoke_async(&mut conn)
                    .await?;
                match outcome {
                    1 => {}
                    0 => return Err(LockError::release(key, "lock is held by another owner")),
                    _ => return Err(LockError::release(key, "lock no longer exists")),
                }
            }
            LockMode::Read => {
                let removed: i64 = self
                    .scripts
                    .release_read
                    .key(self.entry(key, "read"))
                    .arg(&token)
                    .invoke_async(&mut conn)
                    .await?;
                if removed == 0 {
                    return Err(LockError::release(key, "lock no longer exists"));
                }
            }
        }

        debug!(lock_key = %key, "Lock released");
        Ok(())
    }

    async fn sweep(&self) -> LockResult<SweepReport> {
        let keys = self.scan_namespace().await?;
        let mut conn = self.conn.clone();
        let mut report = SweepReport::default();

        for key in keys {
            let deleted: redis::RedisResult<i64> =
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
            match deleted {
                Ok(n) if n > 0 => {
                    debug!(key = %key, "Removed dangling lock entry");
                    report.removed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to remove dangling lock entry");
                    report.failed += 1;
                }
            }
        }

        info!(
            namespace = %self.namespace,
            removed = report.removed,
            failed = report.failed,
            "Swept redis lock namespace"
        );
        Ok(report)
    }

    async fn artifacts(&self) -> LockResult<Vec<String>> {
        self.scan_namespace().await
    }
}

/// Escape glob metacharacters so the namespace matches literally in `SCAN MATCH`
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
