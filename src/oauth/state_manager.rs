//! OAuth login state management for CSRF protection.
//!
//! Manages temporary state tokens tying an OAuth callback back to the login
//! that started it.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Default lifetime of a login state token.
pub const DEFAULT_STATE_EXPIRY_SECONDS: i64 = 600;

/// A pending login (tracked per state token)
#[derive(Clone, Debug, PartialEq)]
pub struct LoginState {
    pub user_id: String,
    pub provider: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Login state manager with automatic expiration
#[derive(Clone)]
pub struct LoginStateManager {
    states: Arc<Mutex<HashMap<String, LoginState>>>,
    expiry_duration: Duration,
}

impl LoginStateManager {
    /// Create a new state manager
    ///
    /// # Arguments
    /// * `expiry_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(expiry_seconds: i64) -> Self {
        Self::with_expiry(Duration::seconds(expiry_seconds))
    }

    pub fn with_expiry(expiry_duration: Duration) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration,
        }
    }

    /// Generate a new state token and store it
    ///
    /// Returns the state token (UUID v4)
    pub fn create_state(&self, user_id: &str, provider: &str, scopes: &[String]) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = LoginState {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            scopes: scopes.to_vec(),
            created_at: Utc::now(),
        };

        self.states.lock().insert(state.clone(), entry);
        state
    }

    /// Validate and consume a state token
    ///
    /// Returns the LoginState if valid and not expired, None otherwise.
    /// The state is removed from the map (single-use).
    pub fn validate_and_consume(&self, state: &str) -> Option<LoginState> {
        let entry = self.states.lock().remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }

        Some(entry)
    }

    /// Clean up expired states (should be called periodically)
    ///
    /// Returns the number of states removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut states = self.states.lock();
        let now = Utc::now();
        let before = states.len();

        states.retain(|_, entry| now - entry.created_at <= self.expiry_duration);
        before - states.len()
    }

    /// Get count of active states (for debugging/monitoring)
    pub fn count(&self) -> usize {
        self.states.lock().len()
    }
}

impl Default for LoginStateManager {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_EXPIRY_SECONDS)
    }
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(manager: LoginStateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let removed = manager.cleanup_expired();
        tracing::debug!(
            removed,
            remaining = manager.count(),
            "OAuth state cleanup complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes() -> Vec<String> {
        vec!["repo".to_string()]
    }

    #[test]
    fn test_create_and_validate_state() {
        let manager = LoginStateManager::default();

        let state = manager.create_state("user123", "github", &scopes());
        assert!(!state.is_empty());

        let entry = manager.validate_and_consume(&state).unwrap();
        assert_eq!(entry.user_id, "user123");
        assert_eq!(entry.provider, "github");
        assert_eq!(entry.scopes, scopes());
    }

    #[test]
    fn test_state_is_single_use() {
        let manager = LoginStateManager::default();
        let state = manager.create_state("alice", "google", &[]);

        assert!(manager.validate_and_consume(&state).is_some());
        assert!(manager.validate_and_consume(&state).is_none());
    }

    #[test]
    fn test_invalid_state_rejected() {
        let manager = LoginStateManager::default();
        assert!(manager.validate_and_consume("invalid_state").is_none());
    }

    #[test]
    fn test_expired_state_rejected() {
        let manager = LoginStateManager::with_expiry(Duration::milliseconds(10));
        let state = manager.create_state("alice", "github", &[]);
        std::thread::sleep(std::time::Duration::from_millis(30));

        assert!(manager.validate_and_consume(&state).is_none());
        // Consumed even though expired
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let manager = LoginStateManager::with_expiry(Duration::milliseconds(10));
        manager.create_state("alice", "github", &[]);
        manager.create_state("bob", "notion", &[]);
        std::thread::sleep(std::time::Duration::from_millis(30));
        manager.create_state("carol", "google", &[]);

        assert_eq!(manager.cleanup_expired(), 2);
        assert_eq!(manager.count(), 1);
    }
}
