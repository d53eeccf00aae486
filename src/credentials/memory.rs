//! In-process credential store.

use super::store::ensure_same_provider;
use super::{CredentialStore, Credentials};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Credential store held entirely in memory.
///
/// Useful for tests and single-process deployments; contents are lost on
/// restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    users: RwLock<HashMap<String, HashMap<String, Credentials>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn add(&self, user_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        let mut users = self.users.write();
        let user = users.entry(user_id.to_string()).or_default();
        if user.contains_key(credentials.id()) {
            return Err(StoreError::AlreadyExists {
                user_id: user_id.to_string(),
                credential_id: credentials.id().to_string(),
            });
        }
        user.insert(credentials.id().to_string(), credentials.clone());
        Ok(())
    }

    async fn get_by_id(
        &self,
        user_id: &str,
        credential_id: &str,
    ) -> Result<Option<Credentials>, StoreError> {
        Ok(self
            .users
            .read()
            .get(user_id)
            .and_then(|user| user.get(credential_id))
            .cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Credentials>, StoreError> {
        let mut creds: Vec<Credentials> = self
            .users
            .read()
            .get(user_id)
            .map(|user| user.values().cloned().collect())
            .unwrap_or_default();
        creds.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(creds)
    }

    async fn update(&self, user_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        let mut users = self.users.write();
        match users
            .get_mut(user_id)
            .and_then(|user| user.get_mut(credentials.id()))
        {
            Some(existing) => {
                ensure_same_provider(existing.provider(), existing.kind().as_str(), credentials)?;
                *existing = credentials.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                user_id: user_id.to_string(),
                credential_id: credentials.id().to_string(),
            }),
        }
    }

    async fn delete_by_id(&self, user_id: &str, credential_id: &str) -> Result<(), StoreError> {
        if let Some(user) = self.users.write().get_mut(user_id) {
            user.remove(credential_id);
        }
        Ok(())
    }
}
