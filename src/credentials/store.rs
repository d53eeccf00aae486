use super::Credentials;
use crate::errors::StoreError;
use async_trait::async_trait;

/// Persistence for credential records, keyed by `(user_id, credential_id)`.
///
/// Implementations do no locking of their own on behalf of callers;
/// [`crate::manager::IntegrationCredentialsManager`] serializes mutations
/// through the distributed mutex before calling into the store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Persists a new credential. Fails with `AlreadyExists` on a duplicate id.
    async fn add(&self, user_id: &str, credentials: &Credentials) -> Result<(), StoreError>;

    /// Returns `Ok(None)` if the user has no credential with that id.
    async fn get_by_id(
        &self,
        user_id: &str,
        credential_id: &str,
    ) -> Result<Option<Credentials>, StoreError>;

    /// Lists all credentials owned by a user.
    async fn list(&self, user_id: &str) -> Result<Vec<Credentials>, StoreError>;

    /// Replaces an existing credential. Fails with `NotFound` if it is missing
    /// and `ProviderChanged` if the provider or kind differs from the stored one.
    async fn update(&self, user_id: &str, credentials: &Credentials) -> Result<(), StoreError>;

    /// Removes a credential. Deleting a missing id is not an error.
    async fn delete_by_id(&self, user_id: &str, credential_id: &str) -> Result<(), StoreError>;

    /// Releases any locks the store itself holds. Called at process shutdown.
    async fn release_all_locks(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Provider and kind are fixed at creation.
pub(crate) fn ensure_same_provider(
    stored_provider: &str,
    stored_kind: &str,
    incoming: &Credentials,
) -> Result<(), StoreError> {
    if stored_provider == incoming.provider() && stored_kind == incoming.kind().as_str() {
        return Ok(());
    }
    Err(StoreError::ProviderChanged {
        credential_id: incoming.id().to_string(),
        stored: format!("{stored_provider} {stored_kind}"),
        requested: format!("{} {}", incoming.provider(), incoming.kind().as_str()),
    })
}
