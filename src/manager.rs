//! Integration credentials manager.
//!
//! The single entry point workflow execution uses to obtain, mutate and
//! release credentials. Refreshes OAuth tokens on demand and coordinates
//! every access through the [`KeyedMutex`].
//!
//! # Locking
//!
//! Three locks exist per `(user, credential)`:
//!
//! | Lock | Taken by |
//! |---|---|
//! | plain | `acquire` (held by the caller), `update`, `delete`, `revoke`, a locked refresh |
//! | `refresh` | anyone about to refresh the tokens |
//! | `!time_sensitive` | `acquire`, only while queueing for the plain lock |
//!
//! Using a credential can invalidate it (a refresh rotates the tokens), so
//! `acquire` hands out exclusive use. Plain `acquire` callers queue behind
//! the low-priority `!time_sensitive` gate; `update`, `delete` and refreshes
//! queue for the plain lock directly, so a long line of executions waiting
//! for the same credential cannot hold back an update.
//!
//! Whenever both are needed the plain lock is taken before the `refresh`
//! lock.

use crate::credentials::{CredentialStore, Credentials, OAuth2Credentials};
use crate::errors::{CredentialsError, Result};
use crate::locks::{KeyedMutex, LockGuard, LockKey};
use crate::oauth::{HandlerRegistry, LoginStateManager, OAuthHandler};
use std::sync::Arc;
use tracing::{debug, info, warn};

const REFRESH_QUALIFIER: &str = "refresh";
const TIME_SENSITIVE_QUALIFIER: &str = "!time_sensitive";

/// Manages the lifecycle of integration credentials.
///
/// ⚠️ A credential obtained through [`acquire`](Self::acquire) is locked
/// system-wide until its guard is released; nothing else can acquire,
/// update, refresh or delete it in the meantime.
pub struct IntegrationCredentialsManager {
    store: Arc<dyn CredentialStore>,
    locks: KeyedMutex,
    handlers: HandlerRegistry,
    login_states: LoginStateManager,
}

impl IntegrationCredentialsManager {
    pub fn new(store: Arc<dyn CredentialStore>, locks: KeyedMutex, handlers: HandlerRegistry) -> Self {
        Self {
            store,
            locks,
            handlers,
            login_states: LoginStateManager::default(),
        }
    }

    pub fn with_login_states(mut self, login_states: LoginStateManager) -> Self {
        self.login_states = login_states;
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn locks(&self) -> &KeyedMutex {
        &self.locks
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn login_states(&self) -> &LoginStateManager {
        &self.login_states
    }

    /// Stores new credentials. Fails if the id is already taken.
    pub async fn create(&self, user_id: &str, credentials: &Credentials) -> Result<()> {
        self.store.add(user_id, credentials).await?;
        info!(
            user_id = %user_id,
            credential_id = %credentials.id(),
            provider = %credentials.provider(),
            "Created credentials"
        );
        Ok(())
    }

    pub async fn exists(&self, user_id: &str, credential_id: &str) -> Result<bool> {
        Ok(self.store.get_by_id(user_id, credential_id).await?.is_some())
    }

    /// All credentials of a user, without refreshing.
    pub async fn list(&self, user_id: &str) -> Result<Vec<Credentials>> {
        Ok(self.store.list(user_id).await?)
    }

    /// Fetches credentials, refreshing OAuth tokens that are about to expire.
    ///
    /// With `lock`, the refresh also waits for the plain lock so it cannot
    /// rotate tokens out from under a holder of [`acquire`](Self::acquire).
    /// Concurrent refreshers are serialized; the ones that lose the race
    /// get the already-refreshed credentials without a second request.
    ///
    /// Returns `None` if the user has no credentials with that id.
    pub async fn get(
        &self,
        user_id: &str,
        credential_id: &str,
        lock: bool,
    ) -> Result<Option<Credentials>> {
        let Some(credentials) = self.store.get_by_id(user_id, credential_id).await? else {
            return Ok(None);
        };

        let oauth = match &credentials {
            Credentials::OAuth2(oauth) if oauth.access_token_expires_at.is_some() => oauth,
            _ => {
                debug!(credential_id = %credential_id, "Credentials do not expire");
                return Ok(Some(credentials));
            }
        };

        debug!(
            credential_id = %credential_id,
            expires_at = ?oauth.access_token_expires_at,
            now = chrono::Utc::now().timestamp(),
            "Checking credentials expiry"
        );

        let handler = self.handlers.handler(&oauth.provider)?;
        if !handler.needs_refresh(oauth) {
            return Ok(Some(credentials));
        }

        let handler = handler.as_ref();
        let refreshed = if lock {
            let key = LockKey::credentials(user_id, credential_id);
            self.locks
                .locked(&key, move || {
                    self.refresh_single_flight(user_id, credential_id, handler)
                })
                .await?
        } else {
            self.refresh_single_flight(user_id, credential_id, handler)
                .await?
        };

        Ok(refreshed)
    }

    /// Refreshes under the `refresh` lock, re-reading the stored credentials
    /// first in case another refresher already finished.
    async fn refresh_single_flight(
        &self,
        user_id: &str,
        credential_id: &str,
        handler: &dyn OAuthHandler,
    ) -> Result<Option<Credentials>> {
        let key = LockKey::credentials(user_id, credential_id).qualified(REFRESH_QUALIFIER);
        self.locks
            .locked(&key, || async move {
                let current = match self.store.get_by_id(user_id, credential_id).await? {
                    Some(Credentials::OAuth2(current)) => current,
                    other => return Ok::<_, CredentialsError>(other),
                };

                if !handler.needs_refresh(&current) {
                    debug!(credential_id = %credential_id, "Credentials already refreshed");
                    return Ok(Some(Credentials::OAuth2(current)));
                }

                let refreshed = self.refresh_and_store(user_id, handler, &current).await?;
                Ok(Some(Credentials::OAuth2(refreshed)))
            })
            .await
    }

    /// Persists only after a fully successful refresh.
    async fn refresh_and_store(
        &self,
        user_id: &str,
        handler: &dyn OAuthHandler,
        current: &OAuth2Credentials,
    ) -> Result<OAuth2Credentials> {
        info!(
            user_id = %user_id,
            credential_id = %current.id,
            provider = %current.provider,
            "Refreshing credentials"
        );

        let refreshed = handler.refresh_tokens(current).await?;
        self.store
            .update(user_id, &Credentials::OAuth2(refreshed.clone()))
            .await?;
        Ok(refreshed)
    }

    /// Fetches credentials for exclusive use.
    ///
    /// The returned guard holds the plain lock; release it when done. Queues
    /// through the `!time_sensitive` gate so updates and refreshes get ahead
    /// of waiting acquirers.
    pub async fn acquire(
        &self,
        user_id: &str,
        credential_id: &str,
    ) -> Result<(Credentials, LockGuard)> {
        let key = LockKey::credentials(user_id, credential_id);
        let gate_key = key.clone().qualified(TIME_SENSITIVE_QUALIFIER);

        let gate = self.locks.acquire(&gate_key).await?;
        let acquired = self.locks.acquire(&key).await;
        if let Err(e) = gate.release().await {
            warn!(key = %gate_key, error = %e, "Failed to release priority gate");
        }
        let guard = acquired?;

        let credentials = match self.get(user_id, credential_id, false).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                release_after_failure(guard, &key).await;
                return Err(CredentialsError::NotFound {
                    user_id: user_id.to_string(),
                    credential_id: credential_id.to_string(),
                });
            }
            Err(e) => {
                release_after_failure(guard, &key).await;
                return Err(e);
            }
        };

        Ok((credentials, guard))
    }

    /// Replaces stored credentials (matched by id).
    ///
    /// Provider and kind are fixed at creation; changing either fails with
    /// `StoreError::ProviderChanged`.
    pub async fn update(&self, user_id: &str, credentials: &Credentials) -> Result<()> {
        let key = LockKey::credentials(user_id, credentials.id());
        self.locks
            .locked(&key, || async move {
                self.store.update(user_id, credentials).await?;
                Ok::<_, CredentialsError>(())
            })
            .await?;

        debug!(user_id = %user_id, credential_id = %credentials.id(), "Updated credentials");
        Ok(())
    }

    pub async fn delete(&self, user_id: &str, credential_id: &str) -> Result<()> {
        let key = LockKey::credentials(user_id, credential_id);
        self.locks
            .locked(&key, || async move {
                self.store.delete_by_id(user_id, credential_id).await?;
                Ok::<_, CredentialsError>(())
            })
            .await?;

        info!(user_id = %user_id, credential_id = %credential_id, "Deleted credentials");
        Ok(())
    }

    /// Process-shutdown hook: releases every lock this process holds.
    pub async fn release_all_locks(&self) -> Result<()> {
        let released = self.locks.release_all().await;
        self.store.release_all_locks().await?;
        info!(released, "Released all credential locks");
        Ok(())
    }

    /// Starts an OAuth login, returning the provider URL to redirect to.
    pub async fn start_login(
        &self,
        user_id: &str,
        provider: &str,
        scopes: &[String],
    ) -> Result<String> {
        let handler = self.handlers.handler(provider)?;
        let scopes = handler.handle_default_scopes(scopes);
        let state = self.login_states.create_state(user_id, provider, &scopes);

        info!(user_id = %user_id, provider = %provider, "Starting OAuth login");
        Ok(handler.get_login_url(&scopes, &state))
    }

    /// Completes an OAuth login from the provider callback and stores the
    /// new credentials.
    ///
    /// `state` must come from [`start_login`](Self::start_login) for the same
    /// user and provider, and is consumed either way.
    pub async fn complete_login(
        &self,
        user_id: &str,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<Credentials> {
        let login = self
            .login_states
            .validate_and_consume(state)
            .filter(|login| login.user_id == user_id && login.provider == provider)
            .ok_or(CredentialsError::InvalidLoginState)?;

        let handler = self.handlers.handler(provider)?;
        let credentials: Credentials = handler
            .exchange_code_for_tokens(code, &login.scopes)
            .await?
            .into();

        self.create(user_id, &credentials).await?;
        info!(
            user_id = %user_id,
            provider = %provider,
            credential_id = %credentials.id(),
            "Completed OAuth login"
        );
        Ok(credentials)
    }

    /// Revokes OAuth tokens at the provider and deletes the credentials.
    ///
    /// Returns whether the provider revoked anything; API keys and providers
    /// without revocation return `false` but are still deleted.
    pub async fn revoke(&self, user_id: &str, credential_id: &str) -> Result<bool> {
        let key = LockKey::credentials(user_id, credential_id);
        self.locks
            .locked(&key, || async move {
                let credentials = self
                    .store
                    .get_by_id(user_id, credential_id)
                    .await?
                    .ok_or_else(|| CredentialsError::NotFound {
                        user_id: user_id.to_string(),
                        credential_id: credential_id.to_string(),
                    })?;

                let revoked = match &credentials {
                    Credentials::OAuth2(oauth) => {
                        let handler = self.handlers.handler(&oauth.provider)?;
                        handler.revoke_tokens(oauth).await?
                    }
                    Credentials::ApiKey(_) => false,
                };

                self.store.delete_by_id(user_id, credential_id).await?;
                info!(
                    user_id = %user_id,
                    credential_id = %credential_id,
                    revoked,
                    "Revoked and deleted credentials"
                );
                Ok::<_, CredentialsError>(revoked)
            })
            .await
    }
}

async fn release_after_failure(guard: LockGuard, key: &LockKey) {
    if let Err(e) = guard.release().await {
        warn!(key = %key, error = %e, "Failed to release lock after error");
    }
}
