//! OAuth provider configurations.
//!
//! Defines the OAuth 2.0 dialect of each supported external service.

use crate::credentials::Secret;
use crate::errors::ConfigError;

/// Providers with a built-in definition.
pub const BUILTIN_PROVIDERS: &[&str] = &["github", "google", "notion"];

/// Provider URLs. Overridable so handlers can be pointed at a test server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    /// May contain `{client_id}`.
    pub revoke_url: Option<String>,
    pub user_info_url: Option<String>,
}

/// How client credentials are sent to the token endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenAuthStyle {
    /// Form-encoded body carrying `client_id` and `client_secret`.
    FormBody,
    /// JSON body with HTTP basic auth.
    JsonBasicAuth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevokeMethod {
    Unsupported,
    /// `DELETE` with basic auth and `{"access_token": ..}` as JSON body.
    DeleteWithBasicAuth,
    /// `POST` with the token as a form field.
    PostToken,
}

/// Where the human-readable account name comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsernameSource {
    /// A field of the JSON returned by the user info endpoint.
    UserInfo { field: String },
    /// `owner.person.email` in the token response.
    TokenOwnerEmail,
    None,
}

/// Everything that differs between providers.
#[derive(Clone, Debug)]
pub struct ProviderDefinition {
    pub name: String,
    pub endpoints: ProviderEndpoints,
    pub default_scopes: Vec<String>,
    /// Always add the default scopes to the login URL.
    pub merge_default_scopes: bool,
    pub extra_login_params: Vec<(String, String)>,
    /// Separator of the `scope` field in token responses.
    pub scope_separator: char,
    pub token_auth: TokenAuthStyle,
    pub revoke_method: RevokeMethod,
    pub username_source: UsernameSource,
    /// Token response field used as the credential title.
    pub title_field: Option<String>,
    /// Token response fields copied into the credential metadata.
    pub metadata_fields: Vec<String>,
    /// Providers issuing non-expiring tokens never refresh.
    pub tokens_expire: bool,
}

impl ProviderDefinition {
    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Prefix of the environment variables holding this provider's secrets.
    pub fn env_prefix(&self) -> String {
        env_prefix(&self.name)
    }
}

fn env_prefix(provider: &str) -> String {
    format!("LATCHKEY_OAUTH_{}", provider.to_uppercase())
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Get the built-in definition for a provider name
pub fn builtin_provider(name: &str) -> Option<ProviderDefinition> {
    let definition = match name {
        "github" => ProviderDefinition {
            name: name.to_string(),
            endpoints: ProviderEndpoints {
                authorize_url: "https://github.com/login/oauth/authorize".to_string(),
                token_url: "https://github.com/login/oauth/access_token".to_string(),
                revoke_url: Some(
                    "https://api.github.com/applications/{client_id}/token".to_string(),
                ),
                user_info_url: Some("https://api.github.com/user".to_string()),
            },
            default_scopes: vec![],
            merge_default_scopes: false,
            extra_login_params: vec![],
            scope_separator: ',',
            token_auth: TokenAuthStyle::FormBody,
            revoke_method: RevokeMethod::DeleteWithBasicAuth,
            username_source: UsernameSource::UserInfo {
                field: "login".to_string(),
            },
            title_field: None,
            metadata_fields: vec![],
            tokens_expire: true,
        },
        "google" => ProviderDefinition {
            name: name.to_string(),
            endpoints: ProviderEndpoints {
                authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                revoke_url: Some("https://oauth2.googleapis.com/revoke".to_string()),
                user_info_url: Some("https://www.googleapis.com/oauth2/v2/userinfo".to_string()),
            },
            default_scopes: strings(&[
                "https://www.googleapis.com/auth/userinfo.email",
                "https://www.googleapis.com/auth/userinfo.profile",
                "openid",
            ]),
            merge_default_scopes: true,
            extra_login_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("include_granted_scopes".to_string(), "true".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
            scope_separator: ' ',
            token_auth: TokenAuthStyle::FormBody,
            revoke_method: RevokeMethod::PostToken,
            username_source: UsernameSource::UserInfo {
                field: "email".to_string(),
            },
            title_field: None,
            metadata_fields: vec![],
            tokens_expire: true,
        },
        "notion" => ProviderDefinition {
            name: name.to_string(),
            endpoints: ProviderEndpoints {
                authorize_url: "https://api.notion.com/v1/oauth/authorize".to_string(),
                token_url: "https://api.notion.com/v1/oauth/token".to_string(),
                revoke_url: None,
                user_info_url: None,
            },
            default_scopes: vec![],
            merge_default_scopes: false,
            extra_login_params: vec![("owner".to_string(), "user".to_string())],
            scope_separator: ' ',
            token_auth: TokenAuthStyle::JsonBasicAuth,
            revoke_method: RevokeMethod::Unsupported,
            username_source: UsernameSource::TokenOwnerEmail,
            title_field: Some("workspace_name".to_string()),
            metadata_fields: strings(&[
                "owner",
                "bot_id",
                "workspace_id",
                "workspace_name",
                "workspace_icon",
            ]),
            tokens_expire: false,
        },
        _ => return None,
    };

    Some(definition)
}

/// Check if a provider has a built-in definition
pub fn is_builtin_provider(name: &str) -> bool {
    BUILTIN_PROVIDERS.contains(&name)
}

/// OAuth client id and secret of this deployment at one provider.
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Secret,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Secret::new(client_secret),
        }
    }

    /// Reads `LATCHKEY_OAUTH_<PROVIDER>_CLIENT_ID` and `..._CLIENT_SECRET`.
    pub fn from_env(provider: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(provider, |name| std::env::var(name).ok())
    }

    /// Like [`ClientCredentials::from_env`] with a custom variable source.
    pub fn from_lookup<F>(provider: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = env_prefix(provider);
        let client_id = lookup(&format!("{prefix}_CLIENT_ID")).filter(|v| !v.is_empty());
        let client_secret = lookup(&format!("{prefix}_CLIENT_SECRET")).filter(|v| !v.is_empty());

        match (client_id, client_secret) {
            (Some(id), Some(secret)) => Ok(Self::new(id, secret)),
            _ => Err(ConfigError::MissingProviderConfig {
                provider: provider.to_string(),
                env_prefix: prefix,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_builtin_providers() {
        for name in BUILTIN_PROVIDERS {
            let definition = builtin_provider(name).unwrap();
            assert_eq!(definition.name, *name);
            assert!(is_builtin_provider(name));
        }
        assert!(builtin_provider("linkedin").is_none());
        assert!(!is_builtin_provider(""));
    }

    #[test]
    fn test_notion_tokens_never_expire() {
        let notion = builtin_provider("notion").unwrap();
        assert!(!notion.tokens_expire);
        assert_eq!(notion.revoke_method, RevokeMethod::Unsupported);
        assert_eq!(notion.token_auth, TokenAuthStyle::JsonBasicAuth);
    }

    #[test]
    fn test_client_credentials_lookup() {
        let vars: HashMap<String, String> = [
            ("LATCHKEY_OAUTH_GITHUB_CLIENT_ID", "id-123"),
            ("LATCHKEY_OAUTH_GITHUB_CLIENT_SECRET", "secret-456"),
            ("LATCHKEY_OAUTH_GOOGLE_CLIENT_ID", "only-id"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let lookup = |name: &str| vars.get(name).cloned();

        let github = ClientCredentials::from_lookup("github", lookup).unwrap();
        assert_eq!(github.client_id, "id-123");
        assert_eq!(github.client_secret.expose(), "secret-456");

        let err = ClientCredentials::from_lookup("google", lookup).unwrap_err();
        match err {
            ConfigError::MissingProviderConfig {
                provider,
                env_prefix,
            } => {
                assert_eq!(provider, "google");
                assert_eq!(env_prefix, "LATCHKEY_OAUTH_GOOGLE");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
