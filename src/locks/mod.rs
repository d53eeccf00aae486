//! Distributed keyed mutex.
//!
//! Gives independent processes mutual exclusion on a logical key through a
//! shared [`LockService`]. Within one process, concurrent acquirers of the
//! same key share a single [`RemoteLock`] from a bounded local table instead
//! of racing to create duplicates.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       KeyedMutex                         │
//! │  - local table: LRU, max entries, idle   │
//! │    expiry; guarded by a short-held mutex │
//! └─────────────────────────────────────────┘
//!          ↓ (guard mutex released before waiting)
//! ┌─────────────────────────────────────────┐
//! │       RemoteLock (one per key)           │
//! │  - token per acquisition, TTL            │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       LockService                        │
//! │  - RedisLockService / MemoryLockService  │
//! └─────────────────────────────────────────┘
//! ```

mod guard;
mod memory;
mod redis_service;
mod service;

pub use guard::LockGuard;
pub use memory::MemoryLockService;
pub use redis_service::RedisLockService;
pub use service::{LockService, RemoteLock};

use crate::errors::LockError;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default lock TTL; also the idle expiry of the local table.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default capacity of the local lock table.
pub const DEFAULT_MAX_LOCAL_LOCKS: usize = 6000;

/// Default pause between acquisition attempts while a lock is held elsewhere.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Identifies what a lock protects: an ordered tuple of string segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockKey(Vec<String>);

impl LockKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The plain per-credential key: `("user:<id>", "credentials:<id>")`.
    pub fn credentials(user_id: &str, credential_id: &str) -> Self {
        Self(vec![
            format!("user:{user_id}"),
            format!("credentials:{credential_id}"),
        ])
    }

    /// Appends a purpose qualifier, giving an independent lock namespace.
    pub fn qualified(mut self, qualifier: &str) -> Self {
        self.0.push(qualifier.to_string());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The lock name used on the lock service.
    pub fn name(&self) -> String {
        self.0.join("/")
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Tuning for [`KeyedMutex`].
#[derive(Clone, Debug)]
pub struct KeyedMutexOptions {
    /// TTL of every remote lock, and idle expiry of local table entries.
    pub timeout: Duration,
    pub max_local_locks: usize,
    pub retry_interval: Duration,
}

impl Default for KeyedMutexOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            max_local_locks: DEFAULT_MAX_LOCAL_LOCKS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

struct CachedLock {
    lock: Arc<RemoteLock>,
    last_used: Instant,
}

/// Cross-process mutex keyed by [`LockKey`].
pub struct KeyedMutex {
    service: Arc<dyn LockService>,
    options: KeyedMutexOptions,
    locks: Mutex<LruCache<LockKey, CachedLock>>,
}

impl KeyedMutex {
    pub fn new(service: Arc<dyn LockService>) -> Self {
        Self::with_options(service, KeyedMutexOptions::default())
    }

    pub fn with_options(service: Arc<dyn LockService>, options: KeyedMutexOptions) -> Self {
        let capacity = NonZeroUsize::new(options.max_local_locks).unwrap_or(NonZeroUsize::MIN);
        Self {
            service,
            options,
            locks: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn options(&self) -> &KeyedMutexOptions {
        &self.options
    }

    /// Number of lock objects currently held in the local table.
    pub fn local_len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Returns the shared lock object for `key`, creating it if needed.
    ///
    /// The table mutex is held only for the lookup/insert.
    fn lock_for(&self, key: &LockKey) -> Arc<RemoteLock> {
        let now = Instant::now();
        let max_age = self.options.timeout;
        let mut locks = self.locks.lock();

        // Least recently used entries are also the longest idle
        while let Some((_, oldest)) = locks.peek_lru() {
            if now.duration_since(oldest.last_used) < max_age {
                break;
            }
            locks.pop_lru();
        }

        if let Some(cached) = locks.get_mut(key) {
            cached.last_used = now;
            return Arc::clone(&cached.lock);
        }

        let lock = Arc::new(RemoteLock::new(
            Arc::clone(&self.service),
            key.name(),
            self.options.timeout,
            self.options.retry_interval,
        ));
        locks.put(
            key.clone(),
            CachedLock {
                lock: Arc::clone(&lock),
                last_used: now,
            },
        );
        lock
    }

    /// Waits until the lock for `key` is obtained.
    ///
    /// Lock service errors propagate; there is no unlocked fallback.
    pub async fn acquire(&self, key: &LockKey) -> Result<LockGuard, LockError> {
        let lock = self.lock_for(key);
        debug!(key = %key, "Acquiring lock");
        let token = lock.acquire().await?;
        Ok(LockGuard::new(lock, token))
    }

    /// Runs `f` while holding the lock for `key`, releasing it on every exit.
    ///
    /// The result is always `f`'s own; a failed release (the TTL ran out
    /// during `f`) is only logged.
    pub async fn locked<F, Fut, T, E>(&self, key: &LockKey, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.acquire(key).await?;
        let result = f().await;
        let released = guard.release().await;

        if let Err(e) = released {
            warn!(
                key = %key,
                succeeded = result.is_ok(),
                error = %e,
                "Failed to release lock"
            );
        }
        result
    }

    /// Releases the lock for `key` if the local table knows it.
    ///
    /// No-op when the key is absent.
    pub async fn release(&self, key: &LockKey) -> Result<(), LockError> {
        let lock = self.locks.lock().peek(key).map(|c| Arc::clone(&c.lock));
        match lock {
            Some(lock) => lock.release().await,
            None => Ok(()),
        }
    }

    /// Best-effort release of every lock this process currently owns.
    ///
    /// Intended for process shutdown. Locks that were already released,
    /// expired, or are held by someone else are skipped. Returns the number
    /// of locks released.
    pub async fn release_all(&self) -> usize {
        let locks: Vec<Arc<RemoteLock>> = self
            .locks
            .lock()
            .iter()
            .map(|(_, cached)| Arc::clone(&cached.lock))
            .collect();

        let outcomes = futures::future::join_all(locks.iter().map(|lock| async move {
            match lock.owned().await {
                Ok(true) => match lock.release().await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(lock = %lock.name(), error = %e, "Skipping lock release");
                        false
                    }
                },
                Ok(false) => false,
                Err(e) => {
                    warn!(lock = %lock.name(), error = %e, "Could not check lock ownership");
                    false
                }
            }
        }))
        .await;

        outcomes.into_iter().filter(|released| *released).count()
    }
}
