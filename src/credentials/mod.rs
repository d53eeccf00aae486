//! Integration credentials and their persistence.
//!
//! A credential is either an API key or an OAuth2 token set, owned by exactly
//! one user and identified by an immutable id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (trait)            │
//! │  - add / get_by_id / update / delete     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↓
//! ┌──────────────────┐  ┌──────────────────────┐
//! │ MemoryCredential │  │ SqliteCredentialStore │
//! │ Store            │  │  - AES-256-GCM at rest│
//! └──────────────────┘  └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use latchkey::credentials::{
//!     Credentials, CredentialStore, OAuth2Credentials, Secret, SqliteCredentialStore,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let encryption_key = std::env::var("LATCHKEY_ENCRYPTION_KEY")?;
//! let store = SqliteCredentialStore::new("credentials.db", &encryption_key)?;
//!
//! let creds = Credentials::OAuth2(OAuth2Credentials::new(
//!     "github",
//!     Secret::new("gho_access"),
//!     Some(Secret::new("ghr_refresh")),
//!     None,
//!     vec!["repo".to_string()],
//! ));
//! store.add("user1", &creds).await?;
//!
//! if let Some(found) = store.get_by_id("user1", creds.id()).await? {
//!     println!("Found {} credentials", found.provider());
//! }
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

mod encryption;
mod memory;
mod storage;
mod store;

pub use memory::MemoryCredentialStore;
pub use storage::SqliteCredentialStore;
pub use store::CredentialStore;

// Re-export encryption functions for testing/utilities
pub use encryption::{decrypt, encrypt, validate_key};

/// A secret string value.
///
/// Serializes transparently but never prints its contents through `Debug`
/// or `Display`, so credentials can be logged without leaking tokens.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the underlying secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Discriminator of the [`Credentials`] sum type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialsKind {
    #[serde(rename = "oauth2")]
    OAuth2,
    ApiKey,
}

impl CredentialsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialsKind::OAuth2 => "oauth2",
            CredentialsKind::ApiKey => "api_key",
        }
    }
}

/// OAuth2 token set for one provider account.
///
/// Expiry timestamps are Unix seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Credentials {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub access_token: Secret,
    #[serde(default)]
    pub access_token_expires_at: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<Secret>,
    #[serde(default)]
    pub refresh_token_expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OAuth2Credentials {
    /// Creates a new token set with a freshly generated id.
    pub fn new(
        provider: impl Into<String>,
        access_token: Secret,
        refresh_token: Option<Secret>,
        access_token_expires_at: Option<i64>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.into(),
            title: None,
            username: None,
            access_token,
            access_token_expires_at,
            refresh_token,
            refresh_token_expires_at: None,
            scopes,
            metadata: HashMap::new(),
        }
    }

    /// True if every scope in `required` was granted.
    pub fn has_all_scopes(&self, required: &[&str]) -> bool {
        required
            .iter()
            .all(|scope| self.scopes.iter().any(|granted| granted == scope))
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token.expose())
    }
}

/// An opaque API key for one provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyCredentials {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub title: Option<String>,
    pub api_key: Secret,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl ApiKeyCredentials {
    pub fn new(provider: impl Into<String>, api_key: Secret) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.into(),
            title: None,
            api_key,
            expires_at: None,
        }
    }
}

/// Stored credentials for a third-party provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Credentials),
    #[serde(rename = "api_key")]
    ApiKey(ApiKeyCredentials),
}

impl Credentials {
    pub fn id(&self) -> &str {
        match self {
            Credentials::OAuth2(c) => &c.id,
            Credentials::ApiKey(c) => &c.id,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Credentials::OAuth2(c) => &c.provider,
            Credentials::ApiKey(c) => &c.provider,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Credentials::OAuth2(c) => c.title.as_deref(),
            Credentials::ApiKey(c) => c.title.as_deref(),
        }
    }

    pub fn kind(&self) -> CredentialsKind {
        match self {
            Credentials::OAuth2(_) => CredentialsKind::OAuth2,
            Credentials::ApiKey(_) => CredentialsKind::ApiKey,
        }
    }

    /// Expiry of the usable secret (access token or API key), if any.
    pub fn expires_at(&self) -> Option<i64> {
        match self {
            Credentials::OAuth2(c) => c.access_token_expires_at,
            Credentials::ApiKey(c) => c.expires_at,
        }
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        match self {
            Credentials::OAuth2(c) => c.bearer(),
            Credentials::ApiKey(c) => c.api_key.expose().to_string(),
        }
    }

    pub fn as_oauth2(&self) -> Option<&OAuth2Credentials> {
        match self {
            Credentials::OAuth2(c) => Some(c),
            Credentials::ApiKey(_) => None,
        }
    }
}

impl From<OAuth2Credentials> for Credentials {
    fn from(creds: OAuth2Credentials) -> Self {
        Credentials::OAuth2(creds)
    }
}

impl From<ApiKeyCredentials> for Credentials {
    fn from(creds: ApiKeyCredentials) -> Self {
        Credentials::ApiKey(creds)
    }
}
