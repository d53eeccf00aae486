use anyhow::{Context, Result};
use latchkey::config::{self, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, ENCRYPTION_KEY_ENV};
use latchkey::credentials::SqliteCredentialStore;
use latchkey::locks::{KeyedMutex, RedisLockService};
use latchkey::oauth::{run_state_cleanup, HandlerRegistry, LoginStateManager};
use latchkey::IntegrationCredentialsManager;
use std::sync::Arc;
use tracing::{error, info};

const STATE_CLEANUP_INTERVAL_SECONDS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "latchkey=info".into()),
        )
        .init();

    info!("Latchkey starting...");

    if let Err(e) = run().await {
        error!(error = ?e, "Latchkey failed");
        return Err(e);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    let encryption_key = std::env::var(ENCRYPTION_KEY_ENV)
        .with_context(|| format!("{ENCRYPTION_KEY_ENV} is required (base64-encoded 32-byte key)"))?;

    let redirect_uri = config.oauth.redirect_uri();
    info!(
        redis_url = %config.redis.url,
        database_path = %config.store.database_path,
        redirect_uri = %redirect_uri,
        lock_timeout_seconds = config.locks.timeout_seconds,
        "Configuration loaded"
    );

    let lock_service = RedisLockService::connect(&config.redis.url)
        .await
        .context("Failed to connect to Redis lock service")?;
    let locks = KeyedMutex::with_options(Arc::new(lock_service), config.locks.mutex_options());

    let store = SqliteCredentialStore::new(&config.store.database_path, &encryption_key)
        .context("Failed to initialize credential store")?;
    info!("Credential store initialized");

    let handlers = HandlerRegistry::from_env(&redirect_uri);
    let login_states = LoginStateManager::new(config.oauth.state_expiry_seconds);

    let manager = IntegrationCredentialsManager::new(Arc::new(store), locks, handlers)
        .with_login_states(login_states.clone());

    let cleanup_handle = tokio::spawn(run_state_cleanup(
        login_states,
        STATE_CLEANUP_INTERVAL_SECONDS,
    ));
    info!("Credentials manager ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    cleanup_handle.abort();
    manager
        .release_all_locks()
        .await
        .context("Failed to release credential locks")?;
    info!("Latchkey stopped");

    Ok(())
}
