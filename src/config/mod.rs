use crate::errors::ConfigError;
use crate::locks::KeyedMutexOptions;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "LATCHKEY_CONFIG";

/// Config file used when `LATCHKEY_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "latchkey.toml";

/// Environment variable holding the base64 credential encryption key.
pub const ENCRYPTION_KEY_ENV: &str = "LATCHKEY_ENCRYPTION_KEY";

/// Complete Latchkey configuration
///
/// Provider client ids and secrets are not part of the file; they are read
/// from `LATCHKEY_OAUTH_<PROVIDER>_CLIENT_ID` / `_CLIENT_SECRET`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatchkeyConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl LatchkeyConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: LatchkeyConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.locks.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "locks.timeout_seconds",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.locks.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "locks.cache_capacity",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.locks.retry_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "locks.retry_interval_ms",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.oauth.state_expiry_seconds <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "oauth.state_expiry_seconds",
                details: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Redis lock service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

/// Keyed mutex configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lock TTL; also how long an idle lock stays in the local table
    #[serde(default = "default_lock_timeout")]
    pub timeout_seconds: u64,
    /// Maximum lock objects kept in the local table
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Pause between attempts while a lock is held elsewhere
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_cache_capacity() -> usize {
    6000
}

fn default_retry_interval() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_lock_timeout(),
            cache_capacity: default_cache_capacity(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

impl LockConfig {
    pub fn mutex_options(&self) -> KeyedMutexOptions {
        KeyedMutexOptions {
            timeout: Duration::from_secs(self.timeout_seconds),
            max_local_locks: self.cache_capacity,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

/// OAuth flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_platform_base_url")]
    pub platform_base_url: String,
    /// Preferred over `platform_base_url` for the callback when set
    #[serde(default)]
    pub frontend_base_url: Option<String>,
    /// How long a login state token stays valid
    #[serde(default = "default_state_expiry")]
    pub state_expiry_seconds: i64,
}

fn default_platform_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_state_expiry() -> i64 {
    600
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            platform_base_url: default_platform_base_url(),
            frontend_base_url: None,
            state_expiry_seconds: default_state_expiry(),
        }
    }
}

impl OAuthConfig {
    /// Callback URI handed to every provider.
    pub fn redirect_uri(&self) -> String {
        let base = self
            .frontend_base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(self.platform_base_url.as_str());
        format!("{}/auth/integrations/oauth_callback", base.trim_end_matches('/'))
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "credentials.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Load configuration from TOML file
///
/// A missing file yields the defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LatchkeyConfig, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => LatchkeyConfig::from_toml_str(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(LatchkeyConfig::default())
        }
        Err(e) => Err(ConfigError::File {
            path: path.display().to_string(),
            source: e,
        }),
    }
}
