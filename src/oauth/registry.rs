use super::{
    builtin_provider, ClientCredentials, OAuthHandler, StandardOAuthHandler,
    BUILTIN_PROVIDERS,
};
use crate::errors::ConfigError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// OAuth handlers by provider name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OAuthHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every built-in provider whose client id and
    /// secret are set in the environment.
    pub fn from_env(redirect_uri: &str) -> Self {
        Self::from_lookup(redirect_uri, |name| std::env::var(name).ok())
    }

    /// Like [`HandlerRegistry::from_env`] with a custom variable source.
    pub fn from_lookup<F>(redirect_uri: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut registry = Self::new();
        for provider in BUILTIN_PROVIDERS {
            let client = match ClientCredentials::from_lookup(provider, &lookup) {
                Ok(client) => client,
                Err(e) => {
                    debug!(provider = %provider, error = %e, "OAuth provider not configured");
                    continue;
                }
            };
            if let Some(definition) = builtin_provider(provider) {
                registry.register(Arc::new(StandardOAuthHandler::new(
                    definition,
                    client,
                    redirect_uri,
                )));
            }
        }

        info!(providers = ?registry.providers(), "OAuth handlers configured");
        registry
    }

    /// Adds or replaces the handler for `handler.provider_name()`.
    pub fn register(&mut self, handler: Arc<dyn OAuthHandler>) {
        self.handlers
            .insert(handler.provider_name().to_string(), handler);
    }

    /// Looks up the handler for `provider`.
    ///
    /// Fails with `MissingProviderConfig` for a known provider whose secrets
    /// are not configured, `UnknownProvider` otherwise.
    pub fn handler(&self, provider: &str) -> Result<Arc<dyn OAuthHandler>, ConfigError> {
        if let Some(handler) = self.handlers.get(provider) {
            return Ok(Arc::clone(handler));
        }

        match builtin_provider(provider) {
            Some(definition) => Err(ConfigError::MissingProviderConfig {
                provider: provider.to_string(),
                env_prefix: definition.env_prefix(),
            }),
            None => Err(ConfigError::UnknownProvider {
                provider: provider.to_string(),
            }),
        }
    }

    /// Configured provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
