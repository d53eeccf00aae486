//! Encrypted credential storage using SQLite.
//!
//! The serialized credential is sealed with AES-256-GCM; only the lookup
//! columns (user, id, provider, kind) are stored in clear.

use super::store::ensure_same_provider;
use super::{encryption, CredentialStore, Credentials};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     user_id TEXT NOT NULL,
///     credential_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     kind TEXT NOT NULL,               -- "oauth2" | "api_key"
///     payload TEXT NOT NULL,            -- Encrypted JSON
///     payload_nonce TEXT NOT NULL,
///     created_at TEXT NOT NULL,         -- ISO 8601 timestamp
///     updated_at TEXT NOT NULL,         -- ISO 8601 timestamp
///     PRIMARY KEY(user_id, credential_id)
/// );
/// ```
///
/// # Thread Safety
/// The connection is wrapped in a mutex; statements run synchronously and the
/// mutex is never held across an await point.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    encryption_key: Vec<u8>,
}

impl SqliteCredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self, StoreError> {
        let key_bytes = encryption::validate_key(encryption_key)?;
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT NOT NULL,
                credential_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_nonce TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY(user_id, credential_id)
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_user ON credentials(user_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key: key_bytes,
        })
    }

    fn seal(&self, credentials: &Credentials) -> Result<(String, String), StoreError> {
        let payload = serde_json::to_vec(credentials)?;
        encryption::encrypt(&payload, &self.encryption_key)
    }

    fn open(&self, payload: &str, nonce: &str) -> Result<Credentials, StoreError> {
        let plaintext = encryption::decrypt(payload, nonce, &self.encryption_key)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn add(&self, user_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        let (payload, nonce) = self.seal(credentials)?;
        let now = Utc::now().to_rfc3339();

        let inserted = self.conn.lock().execute(
            r#"
            INSERT INTO credentials (
                user_id, credential_id, provider, kind,
                payload, payload_nonce, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(user_id, credential_id) DO NOTHING
            "#,
            params![
                user_id,
                credentials.id(),
                credentials.provider(),
                credentials.kind().as_str(),
                payload,
                nonce,
                now,
            ],
        )?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                user_id: user_id.to_string(),
                credential_id: credentials.id().to_string(),
            });
        }

        debug!(user_id = %user_id, credential_id = %credentials.id(), "Stored credentials");
        Ok(())
    }

    async fn get_by_id(
        &self,
        user_id: &str,
        credential_id: &str,
    ) -> Result<Option<Credentials>, StoreError> {
        let row: Option<(String, String)> = self
            .conn
            .lock()
            .query_row(
                "SELECT payload, payload_nonce FROM credentials
                 WHERE user_id = ?1 AND credential_id = ?2",
                params![user_id, credential_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(payload, nonce)| self.open(&payload, &nonce))
            .transpose()
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Credentials>, StoreError> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT payload, payload_nonce FROM credentials
                 WHERE user_id = ?1 ORDER BY credential_id",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        rows.iter()
            .map(|(payload, nonce)| self.open(payload, nonce))
            .collect()
    }

    async fn update(&self, user_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        let (payload, nonce) = self.seal(credentials)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock();
        let stored: Option<(String, String)> = conn
            .query_row(
                "SELECT provider, kind FROM credentials WHERE user_id = ?1 AND credential_id = ?2",
                params![user_id, credentials.id()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((provider, kind)) = stored else {
            return Err(StoreError::NotFound {
                user_id: user_id.to_string(),
                credential_id: credentials.id().to_string(),
            });
        };
        ensure_same_provider(&provider, &kind, credentials)?;

        conn.execute(
            r#"
            UPDATE credentials
            SET payload = ?3, payload_nonce = ?4, updated_at = ?5
            WHERE user_id = ?1 AND credential_id = ?2
            "#,
            params![user_id, credentials.id(), payload, nonce, now],
        )?;
        Ok(())
    }

    async fn delete_by_id(&self, user_id: &str, credential_id: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND credential_id = ?2",
            params![user_id, credential_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ApiKeyCredentials, OAuth2Credentials, Secret};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn create_test_store() -> SqliteCredentialStore {
        let key = BASE64.encode([0u8; 32]);
        SqliteCredentialStore::new(":memory:", &key).expect("Failed to create test store")
    }

    fn oauth_credentials() -> Credentials {
        let mut creds = OAuth2Credentials::new(
            "github",
            Secret::new("access-token-12345"),
            Some(Secret::new("refresh-token-67890")),
            Some(Utc::now().timestamp() + 3600),
            vec!["repo".to_string()],
        );
        creds.username = Some("octocat".to_string());
        creds.into()
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let store = create_test_store();
        let creds = oauth_credentials();

        store.add("user1", &creds).await.unwrap();

        let retrieved = store
            .get_by_id("user1", creds.id())
            .await
            .unwrap()
            .expect("Credentials not found");
        assert_eq!(retrieved, creds);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.get_by_id("user1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_payload_encrypted_at_rest() {
        let store = create_test_store();
        let creds = oauth_credentials();
        store.add("user1", &creds).await.unwrap();

        let raw: String = store
            .conn
            .lock()
            .query_row("SELECT payload FROM credentials", [], |row| row.get(0))
            .unwrap();
        assert!(!raw.contains("access-token-12345"));
        assert!(!raw.contains("refresh-token-67890"));
    }

    #[tokio::test]
    async fn test_update() {
        let store = create_test_store();
        let creds = oauth_credentials();
        store.add("user1", &creds).await.unwrap();

        let mut updated = creds.clone();
        if let Credentials::OAuth2(ref mut oauth) = updated {
            oauth.access_token = Secret::new("new-access-token");
        }
        store.update("user1", &updated).await.unwrap();

        let retrieved = store.get_by_id("user1", creds.id()).await.unwrap().unwrap();
        assert_eq!(
            retrieved.as_oauth2().unwrap().access_token.expose(),
            "new-access-token"
        );
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let store = create_test_store();
        let err = store.update("user1", &oauth_credentials()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_keeps_provider_columns() {
        let store = create_test_store();
        let creds = oauth_credentials();
        store.add("user1", &creds).await.unwrap();

        let mut moved = creds.clone();
        if let Credentials::OAuth2(ref mut oauth) = moved {
            oauth.provider = "google".to_string();
        }
        let err = store.update("user1", &moved).await.unwrap_err();
        assert!(matches!(err, StoreError::ProviderChanged { .. }));

        let (provider, kind): (String, String) = store
            .conn
            .lock()
            .query_row("SELECT provider, kind FROM credentials", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(provider, creds.provider());
        assert_eq!(kind, "oauth2");
    }

    #[tokio::test]
    async fn test_duplicate_add_fails() {
        let store = create_test_store();
        let creds = oauth_credentials();
        store.add("user1", &creds).await.unwrap();

        let err = store.add("user1", &creds).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        // Same id under another user is a separate record
        store.add("user2", &creds).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = create_test_store();
        let oauth = oauth_credentials();
        let key: Credentials = ApiKeyCredentials::new("openai", Secret::new("sk-1")).into();

        store.add("user1", &oauth).await.unwrap();
        store.add("user1", &key).await.unwrap();
        store.add("user2", &key).await.unwrap();

        assert_eq!(store.list("user1").await.unwrap().len(), 2);

        store.delete_by_id("user1", oauth.id()).await.unwrap();
        // Deleting again is a no-op
        store.delete_by_id("user1", oauth.id()).await.unwrap();

        let remaining = store.list("user1").await.unwrap();
        assert_eq!(remaining, vec![key.clone()]);
        assert_eq!(store.list("user2").await.unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_encryption_key() {
        assert!(SqliteCredentialStore::new(":memory:", "short").is_err());
        assert!(SqliteCredentialStore::new(":memory:", "not-valid-base64!@#$").is_err());
    }
}
