use super::RemoteLock;
use crate::errors::LockError;
use std::sync::Arc;
use tracing::{debug, warn};

/// A held lock.
///
/// Bound to the token of the acquisition that produced it, so releasing an
/// old guard can never free a later holder's lock. Prefer
/// [`LockGuard::release`]; a guard dropped without it is released in the
/// background on the current tokio runtime, and the lock service TTL covers
/// the case where no runtime is available.
#[must_use = "dropping a LockGuard releases the lock in the background"]
pub struct LockGuard {
    lock: Arc<RemoteLock>,
    token: String,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(lock: Arc<RemoteLock>, token: String) -> Self {
        Self {
            lock,
            token,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        self.lock.name()
    }

    /// True while this guard's token still holds the lock.
    ///
    /// Becomes false once the lock service expires the lock.
    pub async fn is_owned(&self) -> Result<bool, LockError> {
        self.lock.is_held_by(&self.token).await
    }

    /// Releases the lock.
    ///
    /// Returns `NotOwned` if the lock already expired on the lock service.
    pub async fn release(mut self) -> Result<(), LockError> {
        let result = self.lock.release_token(&self.token).await;
        self.released = true;
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let lock = Arc::clone(&self.lock);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release_token(&token).await {
                        debug!(lock = %lock.name(), error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock = %lock.name(),
                    "LockGuard dropped outside a runtime; lock will expire via TTL"
                );
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.lock.name())
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::LockError;
    use crate::locks::{KeyedMutex, KeyedMutexOptions, LockKey, LockService, MemoryLockService};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Lock service whose releases take a while to reach the server.
    struct SlowRelease {
        inner: MemoryLockService,
    }

    #[async_trait]
    impl LockService for SlowRelease {
        async fn try_acquire(
            &self,
            name: &str,
            token: &str,
            ttl: Duration,
        ) -> Result<bool, LockError> {
            self.inner.try_acquire(name, token, ttl).await
        }

        async fn release(&self, name: &str, token: &str) -> Result<bool, LockError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.release(name, token).await
        }

        async fn owner(&self, name: &str) -> Result<Option<String>, LockError> {
            self.inner.owner(name).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_release_falls_back_to_drop() {
        let service = Arc::new(SlowRelease {
            inner: MemoryLockService::new(),
        });
        let mutex = KeyedMutex::with_options(
            service.clone(),
            KeyedMutexOptions {
                retry_interval: Duration::from_millis(2),
                ..KeyedMutexOptions::default()
            },
        );

        let guard = mutex.acquire(&LockKey::new(["k"])).await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(5), guard.release()).await;
        assert!(cancelled.is_err());
        assert_eq!(service.inner.held_count(), 1);

        // The dropped guard releases in the background instead of waiting for the TTL
        tokio::time::timeout(Duration::from_secs(1), async {
            while service.inner.held_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lock stayed held after a cancelled release");
    }
}
