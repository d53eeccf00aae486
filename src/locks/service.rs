//! The remote lock primitive and the per-key lock object built on it.

use crate::errors::LockError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A shared lock service offering atomic acquire/release with a TTL.
///
/// `token` identifies the holder; only the current holder's token can
/// release a lock. Every lock expires after `ttl` even if never released.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Sets `name` to `token` if no live lock exists. Returns true if acquired.
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Deletes `name` if it is still held by `token`. Returns true if released.
    async fn release(&self, name: &str, token: &str) -> Result<bool, LockError>;

    /// Returns the token currently holding `name`, if any.
    async fn owner(&self, name: &str) -> Result<Option<String>, LockError>;
}

/// One named lock on the lock service.
///
/// A process keeps a single `RemoteLock` per key and shares it among its
/// local acquirers. Each successful acquisition gets a fresh token; the most
/// recent one is remembered so [`RemoteLock::owned`] and
/// [`RemoteLock::release`] work without a guard.
pub struct RemoteLock {
    name: String,
    timeout: Duration,
    retry_interval: Duration,
    service: Arc<dyn LockService>,
    token: Mutex<Option<String>>,
}

impl RemoteLock {
    pub fn new(
        service: Arc<dyn LockService>,
        name: impl Into<String>,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            timeout,
            retry_interval,
            service,
            token: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits until the lock is obtained and returns the holder token.
    ///
    /// Waiting yields to the runtime between attempts. Lock service errors
    /// are returned immediately.
    pub async fn acquire(&self) -> Result<String, LockError> {
        let token = Uuid::new_v4().to_string();
        let mut attempts: u64 = 0;

        loop {
            if self
                .service
                .try_acquire(&self.name, &token, self.timeout)
                .await?
            {
                *self.token.lock() = Some(token.clone());
                debug!(lock = %self.name, attempts, "Lock acquired");
                return Ok(token);
            }
            attempts += 1;
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Releases the lock if `token` still holds it.
    pub async fn release_token(&self, token: &str) -> Result<(), LockError> {
        let released = self.service.release(&self.name, token).await?;

        {
            let mut current = self.token.lock();
            if current.as_deref() == Some(token) {
                *current = None;
            }
        }

        if released {
            debug!(lock = %self.name, "Lock released");
            Ok(())
        } else {
            Err(LockError::NotOwned {
                name: self.name.clone(),
            })
        }
    }

    /// Releases the lock using the most recent acquisition's token.
    pub async fn release(&self) -> Result<(), LockError> {
        let token = self.token.lock().clone();
        match token {
            Some(token) => self.release_token(&token).await,
            None => Err(LockError::NotOwned {
                name: self.name.clone(),
            }),
        }
    }

    /// True if anyone holds the lock.
    pub async fn locked(&self) -> Result<bool, LockError> {
        Ok(self.service.owner(&self.name).await?.is_some())
    }

    /// True if this lock object's most recent token still holds the lock.
    pub async fn owned(&self) -> Result<bool, LockError> {
        let token = self.token.lock().clone();
        match token {
            Some(token) => self.is_held_by(&token).await,
            None => Ok(false),
        }
    }

    pub(crate) async fn is_held_by(&self, token: &str) -> Result<bool, LockError> {
        Ok(self.service.owner(&self.name).await?.as_deref() == Some(token))
    }
}

impl std::fmt::Debug for RemoteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLock")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}
