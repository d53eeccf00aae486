//! Error types for the credentials core.
//!
//! Each area gets its own enum; [`CredentialsError`] is the surface returned
//! by [`crate::manager::IntegrationCredentialsManager`] and wraps the others
//! unchanged so callers can still match on the original cause.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("error-latchkey-lock-1 Lock service unavailable: {details}")]
    Service {
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("error-latchkey-lock-2 Lock not owned: {name}")]
    NotOwned { name: String },
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Service {
            details: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("error-latchkey-store-1 Database operation failed: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("error-latchkey-store-2 Credential serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("error-latchkey-store-3 Credential encryption failed: {details}")]
    Encryption { details: String },

    #[error("error-latchkey-store-4 Credential #{credential_id} not found for user #{user_id}")]
    NotFound {
        user_id: String,
        credential_id: String,
    },

    #[error("error-latchkey-store-5 Credential #{credential_id} already exists for user #{user_id}")]
    AlreadyExists {
        user_id: String,
        credential_id: String,
    },

    #[error("error-latchkey-store-6 Credential #{credential_id} is {stored} and cannot become {requested}")]
    ProviderChanged {
        credential_id: String,
        stored: String,
        requested: String,
    },
}

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("error-latchkey-oauth-1 Request to provider failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("error-latchkey-oauth-2 Token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("error-latchkey-oauth-3 Invalid token response: {details}")]
    InvalidResponse { details: String },

    #[error("error-latchkey-oauth-4 {handler} cannot refresh tokens for other provider '{provider}'")]
    ProviderMismatch { handler: String, provider: String },

    #[error("error-latchkey-oauth-5 Credential has no {token}")]
    MissingToken { token: &'static str },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-latchkey-config-1 Unknown provider '{provider}'")]
    UnknownProvider { provider: String },

    #[error(
        "error-latchkey-config-2 Integration with provider '{provider}' is not configured: set {env_prefix}_CLIENT_ID and {env_prefix}_CLIENT_SECRET"
    )]
    MissingProviderConfig { provider: String, env_prefix: String },

    #[error("error-latchkey-config-3 Failed to read config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error-latchkey-config-4 Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("error-latchkey-config-5 Invalid value for {field}: {details}")]
    InvalidValue { field: &'static str, details: String },
}

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("error-latchkey-credentials-1 Credentials #{credential_id} for user #{user_id} not found")]
    NotFound {
        user_id: String,
        credential_id: String,
    },

    #[error("error-latchkey-credentials-2 Invalid or expired OAuth login state")]
    InvalidLoginState,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = CredentialsError> = std::result::Result<T, E>;
