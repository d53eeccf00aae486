//! OAuth 2.0 handlers.
//!
//! One [`OAuthHandler`] per provider encapsulates that provider's OAuth
//! dialect: building the login URL, exchanging the authorization code,
//! refreshing and revoking tokens. Handlers are looked up by provider name
//! through a [`HandlerRegistry`].
//!
//! ## Flow
//! 1. `get_login_url` - Redirect the user to the provider with a state token
//! 2. Provider redirects back to `{base_url}/auth/integrations/oauth_callback`
//! 3. `exchange_code_for_tokens` - Trade the code for an `OAuth2Credentials`
//! 4. `refresh_tokens` - Rotate the access token before it expires

mod exchange;
mod provider;
mod registry;
mod standard;
mod state_manager;

pub use provider::{
    builtin_provider, is_builtin_provider, ClientCredentials, ProviderDefinition,
    ProviderEndpoints, RevokeMethod, TokenAuthStyle, UsernameSource, BUILTIN_PROVIDERS,
};
pub use registry::HandlerRegistry;
pub use standard::StandardOAuthHandler;
pub use state_manager::{run_state_cleanup, LoginState, LoginStateManager};

use crate::credentials::{OAuth2Credentials, Secret};
use crate::errors::OAuthError;
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

/// Tokens expiring within this many seconds are refreshed before use.
pub const REFRESH_MARGIN_SECONDS: i64 = 300;

/// True if a token expiring at `expires_at` should be refreshed at `now`.
///
/// Both values are Unix timestamps in seconds; no expiry means never due.
pub fn refresh_due(expires_at: Option<i64>, now: i64) -> bool {
    match expires_at {
        Some(expires_at) => expires_at - now <= REFRESH_MARGIN_SECONDS,
        None => false,
    }
}

/// A provider's OAuth 2.0 implementation.
#[async_trait]
pub trait OAuthHandler: Send + Sync {
    /// Provider this handler serves, e.g. `"github"`.
    fn provider_name(&self) -> &str;

    /// Scopes requested when the caller asks for none.
    fn default_scopes(&self) -> &[String];

    /// Builds the authorization URL the user is redirected to.
    fn get_login_url(&self, scopes: &[String], state: &str) -> String;

    /// Trades an authorization code for a new set of tokens.
    async fn exchange_code_for_tokens(
        &self,
        code: &str,
        scopes: &[String],
    ) -> Result<OAuth2Credentials, OAuthError>;

    /// Provider-specific refresh. Called by [`OAuthHandler::refresh_tokens`]
    /// after the provider check; do not call directly.
    async fn refresh_tokens_unchecked(
        &self,
        credentials: &OAuth2Credentials,
    ) -> Result<OAuth2Credentials, OAuthError>;

    /// Invalidates the tokens at the provider.
    ///
    /// Returns `Ok(false)` when the provider has no revocation endpoint.
    async fn revoke_tokens(&self, credentials: &OAuth2Credentials) -> Result<bool, OAuthError>;

    /// Refreshes `credentials`, keeping their `id` and `title`.
    async fn refresh_tokens(
        &self,
        credentials: &OAuth2Credentials,
    ) -> Result<OAuth2Credentials, OAuthError> {
        if credentials.provider != self.provider_name() {
            return Err(OAuthError::ProviderMismatch {
                handler: self.provider_name().to_string(),
                provider: credentials.provider.clone(),
            });
        }

        let mut refreshed = self.refresh_tokens_unchecked(credentials).await?;
        refreshed.id = credentials.id.clone();
        refreshed.title = credentials.title.clone();
        Ok(refreshed)
    }

    fn needs_refresh(&self, credentials: &OAuth2Credentials) -> bool {
        refresh_due(credentials.access_token_expires_at, Utc::now().timestamp())
    }

    /// Returns a usable access token, refreshing first if needed.
    ///
    /// The refreshed credentials are not persisted.
    async fn get_access_token(&self, credentials: &OAuth2Credentials) -> Result<Secret, OAuthError> {
        if self.needs_refresh(credentials) {
            let refreshed = self.refresh_tokens(credentials).await?;
            return Ok(refreshed.access_token);
        }
        Ok(credentials.access_token.clone())
    }

    fn handle_default_scopes(&self, scopes: &[String]) -> Vec<String> {
        if scopes.is_empty() {
            debug!(provider = %self.provider_name(), "Using default scopes");
            return self.default_scopes().to_vec();
        }
        scopes.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHandler {
        defaults: Vec<String>,
        refreshes: AtomicUsize,
    }

    impl FakeHandler {
        fn new() -> Self {
            Self {
                defaults: vec!["read".to_string()],
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OAuthHandler for FakeHandler {
        fn provider_name(&self) -> &str {
            "fake"
        }

        fn default_scopes(&self) -> &[String] {
            &self.defaults
        }

        fn get_login_url(&self, _scopes: &[String], state: &str) -> String {
            format!("https://fake.example/authorize?state={state}")
        }

        async fn exchange_code_for_tokens(
            &self,
            _code: &str,
            scopes: &[String],
        ) -> Result<OAuth2Credentials, OAuthError> {
            Ok(OAuth2Credentials::new(
                "fake",
                Secret::new("fresh"),
                None,
                None,
                scopes.to_vec(),
            ))
        }

        async fn refresh_tokens_unchecked(
            &self,
            _credentials: &OAuth2Credentials,
        ) -> Result<OAuth2Credentials, OAuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(OAuth2Credentials::new(
                "fake",
                Secret::new("refreshed"),
                None,
                Some(Utc::now().timestamp() + 3600),
                vec![],
            ))
        }

        async fn revoke_tokens(&self, _credentials: &OAuth2Credentials) -> Result<bool, OAuthError> {
            Ok(false)
        }
    }

    fn credentials(provider: &str, expires_at: Option<i64>) -> OAuth2Credentials {
        let mut creds =
            OAuth2Credentials::new(provider, Secret::new("old"), None, expires_at, vec![]);
        creds.title = Some("Work account".to_string());
        creds
    }

    #[test]
    fn test_refresh_margin() {
        let now = 1_700_000_000;
        assert!(refresh_due(Some(now + 300), now));
        assert!(refresh_due(Some(now + 10), now));
        assert!(refresh_due(Some(now - 10), now));
        assert!(!refresh_due(Some(now + 301), now));
        assert!(!refresh_due(None, now));
    }

    #[tokio::test]
    async fn test_refresh_preserves_id_and_title() {
        let handler = FakeHandler::new();
        let original = credentials("fake", Some(0));

        let refreshed = handler.refresh_tokens(&original).await.unwrap();

        assert_eq!(refreshed.id, original.id);
        assert_eq!(refreshed.title.as_deref(), Some("Work account"));
        assert_eq!(refreshed.access_token.expose(), "refreshed");
    }

    #[tokio::test]
    async fn test_refresh_rejects_other_provider() {
        let handler = FakeHandler::new();
        let foreign = credentials("github", Some(0));

        let err = handler.refresh_tokens(&foreign).await.unwrap_err();

        assert!(matches!(err, OAuthError::ProviderMismatch { .. }));
        assert_eq!(handler.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_access_token() {
        let handler = FakeHandler::new();

        let valid = credentials("fake", Some(Utc::now().timestamp() + 3600));
        assert_eq!(handler.get_access_token(&valid).await.unwrap().expose(), "old");

        let expired = credentials("fake", Some(Utc::now().timestamp() - 10));
        assert_eq!(
            handler.get_access_token(&expired).await.unwrap().expose(),
            "refreshed"
        );
        assert_eq!(handler.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_default_scopes() {
        let handler = FakeHandler::new();
        assert_eq!(handler.handle_default_scopes(&[]), vec!["read".to_string()]);
        assert_eq!(
            handler.handle_default_scopes(&["write".to_string()]),
            vec!["write".to_string()]
        );
    }
}
