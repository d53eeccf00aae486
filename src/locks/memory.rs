//! In-process lock service.
//!
//! Implements the same contract as the Redis service (atomic set-if-absent
//! with TTL, token-checked release) for tests and single-node deployments.

use super::LockService;
use crate::errors::LockError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct HeldLock {
    token: String,
    expires_at: Instant,
}

impl HeldLock {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct MemoryLockService {
    locks: DashMap<String, HeldLock>,
    online: AtomicBool,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Simulates the service becoming unreachable (or reachable again).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of live locks.
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.locks.iter().filter(|entry| entry.is_live(now)).count()
    }

    fn check_online(&self) -> Result<(), LockError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockError::Service {
                details: "in-memory lock service is offline".to_string(),
                source: None,
            })
        }
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.check_online()?;
        let now = Instant::now();
        let fresh = HeldLock {
            token: token.to_string(),
            expires_at: now + ttl,
        };

        match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_live(now) {
                    Ok(false)
                } else {
                    held.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, LockError> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .locks
            .remove_if(name, |_, held| held.token == token && held.is_live(now))
            .is_some())
    }

    async fn owner(&self, name: &str) -> Result<Option<String>, LockError> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .locks
            .get(name)
            .filter(|held| held.is_live(now))
            .map(|held| held.token.clone()))
    }
}
