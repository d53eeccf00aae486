//! Redis-backed lock service.
//!
//! Acquisition is a single `SET key token NX PX ttl`; release is an atomic
//! compare-and-delete script so a holder whose TTL expired can never free a
//! lock that someone else has since taken.

use super::LockService;
use crate::errors::LockError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

const DEFAULT_KEY_PREFIX: &str = "latchkey:lock:";

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    else
        return 0
    end
"#;

/// Lock service on a shared Redis instance.
///
/// The connection is constructed by the caller at service startup and
/// injected here; cloning a [`ConnectionManager`] shares one multiplexed
/// connection.
pub struct RedisLockService {
    conn: ConnectionManager,
    key_prefix: String,
    release_script: redis::Script,
}

impl RedisLockService {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    /// Opens a managed connection to `redis_url`.
    ///
    /// Fails if the server is unreachable; there is no fallback to unlocked
    /// operation.
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(redis_url = %redis_url, "Connected to Redis lock service");
        Ok(Self::new(conn))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        // Nil reply means the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(self.key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn owner(&self, name: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn.get(self.key(name)).await?;
        Ok(owner)
    }
}
