use super::exchange::{request_tokens, TokenResponse};
use super::{
    refresh_due, ClientCredentials, OAuthHandler, ProviderDefinition, RevokeMethod,
    UsernameSource,
};
use crate::credentials::{OAuth2Credentials, Secret};
use crate::errors::{ConfigError, OAuthError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info, warn};

const CLIENT_USER_AGENT: &str = concat!("latchkey/", env!("CARGO_PKG_VERSION"));

/// OAuth handler driven by a [`ProviderDefinition`].
///
/// Covers the authorization-code grant, the refresh grant and revocation for
/// every built-in provider.
pub struct StandardOAuthHandler {
    definition: ProviderDefinition,
    client: ClientCredentials,
    redirect_uri: String,
    http: reqwest::Client,
}

impl StandardOAuthHandler {
    pub fn new(
        definition: ProviderDefinition,
        client: ClientCredentials,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            definition,
            client,
            redirect_uri: redirect_uri.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Handler for a built-in provider.
    pub fn builtin(
        provider: &str,
        client: ClientCredentials,
        redirect_uri: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let definition =
            super::builtin_provider(provider).ok_or_else(|| ConfigError::UnknownProvider {
                provider: provider.to_string(),
            })?;
        Ok(Self::new(definition, client, redirect_uri))
    }

    pub fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Turns a token response into credentials.
    ///
    /// On refresh, `previous` supplies whatever the response leaves out.
    async fn build_credentials(
        &self,
        tokens: TokenResponse,
        previous: Option<&OAuth2Credentials>,
        requested_scopes: &[String],
    ) -> OAuth2Credentials {
        let now = Utc::now().timestamp();

        let mut scopes = tokens.granted_scopes(self.definition.scope_separator);
        if scopes.is_empty() {
            scopes = match previous {
                Some(previous) => previous.scopes.clone(),
                None => requested_scopes.to_vec(),
            };
        }

        let (refresh_token, refresh_token_expires_at) = match &tokens.refresh_token {
            Some(token) => (
                Some(Secret::new(token.as_str())),
                tokens.refresh_token_expires_in.map(|seconds| now + seconds),
            ),
            None => (
                previous.and_then(|p| p.refresh_token.clone()),
                previous.and_then(|p| p.refresh_token_expires_at),
            ),
        };

        let access_token_expires_at = if self.definition.tokens_expire {
            tokens.expires_in.map(|seconds| now + seconds)
        } else {
            None
        };

        let username = self.resolve_username(&tokens).await;

        let mut credentials = OAuth2Credentials::new(
            self.definition.name.as_str(),
            Secret::new(tokens.access_token.as_str()),
            refresh_token,
            access_token_expires_at,
            scopes,
        );
        credentials.refresh_token_expires_at = refresh_token_expires_at;
        credentials.username = username.or_else(|| previous.and_then(|p| p.username.clone()));
        credentials.title = self
            .definition
            .title_field
            .as_ref()
            .and_then(|field| tokens.extra.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| previous.and_then(|p| p.title.clone()));

        if let Some(previous) = previous {
            credentials.metadata = previous.metadata.clone();
        }
        for field in &self.definition.metadata_fields {
            if let Some(value) = tokens.extra.get(field) {
                credentials.metadata.insert(field.clone(), value.clone());
            }
        }

        credentials
    }

    async fn resolve_username(&self, tokens: &TokenResponse) -> Option<String> {
        match &self.definition.username_source {
            UsernameSource::UserInfo { field } => {
                let url = self.definition.endpoints.user_info_url.as_deref()?;
                match self.request_user_info(url, &tokens.access_token).await {
                    Ok(info) => info.get(field).and_then(Value::as_str).map(str::to_string),
                    Err(e) => {
                        warn!(provider = %self.definition.name, error = %e, "Failed to fetch user info");
                        None
                    }
                }
            }
            // Only present for tokens owned by a person rather than a bot
            UsernameSource::TokenOwnerEmail => tokens
                .extra
                .get("owner")
                .and_then(|owner| owner.pointer("/person/email"))
                .and_then(Value::as_str)
                .map(str::to_string),
            UsernameSource::None => None,
        }
    }

    async fn request_user_info(&self, url: &str, access_token: &str) -> Result<Value, OAuthError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(|e| OAuthError::InvalidResponse {
            details: e.to_string(),
        })
    }
}

#[async_trait]
impl OAuthHandler for StandardOAuthHandler {
    fn provider_name(&self) -> &str {
        &self.definition.name
    }

    fn default_scopes(&self) -> &[String] {
        &self.definition.default_scopes
    }

    fn get_login_url(&self, scopes: &[String], state: &str) -> String {
        let mut scopes = scopes.to_vec();
        if self.definition.merge_default_scopes {
            for scope in &self.definition.default_scopes {
                if !scopes.contains(scope) {
                    scopes.push(scope.clone());
                }
            }
        }
        let scope = scopes.join(" ");

        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.client.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("state", state),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        for (key, value) in &self.definition.extra_login_params {
            params.push((key.as_str(), value.as_str()));
        }

        let query = params
            .iter()
            .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        format!("{}?{}", self.definition.endpoints.authorize_url, query)
    }

    async fn exchange_code_for_tokens(
        &self,
        code: &str,
        scopes: &[String],
    ) -> Result<OAuth2Credentials, OAuthError> {
        let tokens = request_tokens(
            &self.http,
            &self.definition.endpoints.token_url,
            &self.client,
            self.definition.token_auth,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ],
        )
        .await?;

        debug!(
            provider = %self.definition.name,
            has_refresh_token = tokens.refresh_token.is_some(),
            expires_in = ?tokens.expires_in,
            "Token exchange successful"
        );

        Ok(self.build_credentials(tokens, None, scopes).await)
    }

    async fn refresh_tokens_unchecked(
        &self,
        credentials: &OAuth2Credentials,
    ) -> Result<OAuth2Credentials, OAuthError> {
        if !self.definition.tokens_expire {
            return Ok(credentials.clone());
        }

        let Some(refresh_token) = &credentials.refresh_token else {
            warn!(
                provider = %self.definition.name,
                credential_id = %credentials.id,
                "Credentials have no refresh token, keeping current access token"
            );
            return Ok(credentials.clone());
        };

        let tokens = request_tokens(
            &self.http,
            &self.definition.endpoints.token_url,
            &self.client,
            self.definition.token_auth,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose()),
            ],
        )
        .await?;

        info!(
            provider = %self.definition.name,
            credential_id = %credentials.id,
            "Refreshed OAuth tokens"
        );

        Ok(self
            .build_credentials(tokens, Some(credentials), &credentials.scopes)
            .await)
    }

    async fn revoke_tokens(&self, credentials: &OAuth2Credentials) -> Result<bool, OAuthError> {
        let url = match (
            self.definition.revoke_method,
            &self.definition.endpoints.revoke_url,
        ) {
            (RevokeMethod::Unsupported, _) | (_, None) => return Ok(false),
            (_, Some(url)) => url.replace(
                "{client_id}",
                &urlencoding::encode(&self.client.client_id),
            ),
        };

        if credentials.access_token.is_empty() {
            return Err(OAuthError::MissingToken {
                token: "access token",
            });
        }
        let token = credentials.access_token.expose();

        let request = match self.definition.revoke_method {
            RevokeMethod::DeleteWithBasicAuth => self
                .http
                .delete(&url)
                .basic_auth(&self.client.client_id, Some(self.client.client_secret.expose()))
                .header(ACCEPT, "application/json")
                .header(USER_AGENT, CLIENT_USER_AGENT)
                .json(&serde_json::json!({ "access_token": token })),
            _ => self.http.post(&url).form(&[("token", token)]),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            provider = %self.definition.name,
            credential_id = %credentials.id,
            "Revoked OAuth tokens"
        );
        Ok(true)
    }

    fn needs_refresh(&self, credentials: &OAuth2Credentials) -> bool {
        self.definition.tokens_expire
            && refresh_due(credentials.access_token_expires_at, Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{builtin_provider, ProviderEndpoints};
    use mockito::Matcher;

    const REDIRECT: &str = "http://localhost:3000/auth/integrations/oauth_callback";

    fn handler(provider: &str, base_url: &str) -> StandardOAuthHandler {
        let definition = builtin_provider(provider).unwrap();
        let endpoints = ProviderEndpoints {
            authorize_url: definition.endpoints.authorize_url.clone(),
            token_url: format!("{base_url}/token"),
            revoke_url: Some(format!("{base_url}/applications/{{client_id}}/revoke")),
            user_info_url: definition
                .endpoints
                .user_info_url
                .as_ref()
                .map(|_| format!("{base_url}/user")),
        };
        StandardOAuthHandler::new(
            definition.with_endpoints(endpoints),
            ClientCredentials::new("client-id", "client-secret"),
            REDIRECT,
        )
    }

    fn github_credentials(refresh_token: Option<&str>) -> OAuth2Credentials {
        let mut creds = OAuth2Credentials::new(
            "github",
            Secret::new("old-access"),
            refresh_token.map(Secret::new),
            Some(Utc::now().timestamp() - 10),
            vec!["repo".to_string()],
        );
        creds.username = Some("octocat".to_string());
        creds.title = Some("Personal".to_string());
        creds
    }

    #[test]
    fn test_github_login_url() {
        let handler = handler("github", "http://unused");
        let url = handler.get_login_url(&["repo".to_string(), "read:user".to_string()], "abc");

        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("client_id=client-id"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fauth%2Fintegrations%2Foauth_callback"
        ));
        assert!(url.contains("scope=repo%20read%3Auser"));
        assert!(url.contains("state=abc"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn test_google_login_url_always_has_default_scopes() {
        let handler = handler("google", "http://unused");

        let url = handler.get_login_url(
            &["https://www.googleapis.com/auth/drive".to_string()],
            "state-1",
        );
        assert!(url.contains("drive"));
        assert!(url.contains("userinfo.email"));
        assert!(url.contains("userinfo.profile"));
        assert!(url.contains("openid"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("include_granted_scopes=true"));

        let scopes = handler.handle_default_scopes(&[]);
        assert_eq!(scopes, handler.default_scopes());
    }

    #[test]
    fn test_notion_login_url() {
        let handler = handler("notion", "http://unused");
        let url = handler.get_login_url(&[], "s");
        assert!(url.contains("owner=user"));
        assert!(!url.contains("scope="));
    }

    #[tokio::test]
    async fn test_github_exchange_code() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("client_id".into(), "client-id".into()),
                Matcher::UrlEncoded("client_secret".into(), "client-secret".into()),
                Matcher::UrlEncoded("redirect_uri".into(), REDIRECT.into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "gho_new",
                    "refresh_token": "ghr_new",
                    "expires_in": 28800,
                    "scope": "repo,read:user",
                    "token_type": "bearer"
                }"#,
            )
            .expect(1)
            .create_async()
            .await;
        let user_mock = server
            .mock("GET", "/user")
            .match_header("authorization", "Bearer gho_new")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"login": "octocat", "id": 1}"#)
            .create_async()
            .await;

        let handler = handler("github", &server.url());
        let creds = handler
            .exchange_code_for_tokens("auth-code", &["repo".to_string()])
            .await
            .unwrap();

        token_mock.assert_async().await;
        user_mock.assert_async().await;
        assert_eq!(creds.provider, "github");
        assert_eq!(creds.access_token.expose(), "gho_new");
        assert_eq!(creds.refresh_token.as_ref().unwrap().expose(), "ghr_new");
        assert_eq!(creds.username.as_deref(), Some("octocat"));
        assert_eq!(creds.scopes, vec!["repo", "read:user"]);
        let expires_at = creds.access_token_expires_at.unwrap();
        assert!(expires_at > Utc::now().timestamp() + 28000);
    }

    #[tokio::test]
    async fn test_refresh_keeps_omitted_fields() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "fresh-access", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;
        let _user_mock = server
            .mock("GET", "/user")
            .with_status(401)
            .create_async()
            .await;

        let handler = handler("github", &server.url());
        let original = github_credentials(Some("r1"));
        let refreshed = handler.refresh_tokens(&original).await.unwrap();

        token_mock.assert_async().await;
        assert_eq!(refreshed.id, original.id);
        assert_eq!(refreshed.title.as_deref(), Some("Personal"));
        assert_eq!(refreshed.access_token.expose(), "fresh-access");
        assert_eq!(refreshed.refresh_token.as_ref().unwrap().expose(), "r1");
        assert_eq!(refreshed.scopes, vec!["repo"]);
        assert_eq!(refreshed.username.as_deref(), Some("octocat"));
        assert!(!handler.needs_refresh(&refreshed));
    }

    #[tokio::test]
    async fn test_refresh_failure_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _token_mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let handler = handler("github", &server.url());
        let err = handler
            .refresh_tokens(&github_credentials(Some("r1")))
            .await
            .unwrap_err();

        match err {
            OAuthError::TokenEndpoint { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .expect(0)
            .create_async()
            .await;

        let handler = handler("github", &server.url());
        let original = github_credentials(None);
        let result = handler.refresh_tokens(&original).await.unwrap();

        token_mock.assert_async().await;
        assert_eq!(result, original);
    }

    #[tokio::test]
    async fn test_notion_exchange_code() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::PartialJson(serde_json::json!({
                "grant_type": "authorization_code",
                "code": "notion-code",
                "redirect_uri": REDIRECT,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "secret_notion",
                    "bot_id": "bot-1",
                    "workspace_id": "ws-1",
                    "workspace_name": "Acme",
                    "workspace_icon": null,
                    "owner": {"type": "user", "person": {"email": "ada@example.com"}}
                }"#,
            )
            .create_async()
            .await;

        let handler = handler("notion", &server.url());
        let creds = handler
            .exchange_code_for_tokens("notion-code", &[])
            .await
            .unwrap();

        token_mock.assert_async().await;
        assert_eq!(creds.username.as_deref(), Some("ada@example.com"));
        assert_eq!(creds.title.as_deref(), Some("Acme"));
        assert_eq!(creds.access_token_expires_at, None);
        assert_eq!(creds.metadata["bot_id"], "bot-1");
        assert_eq!(creds.metadata["workspace_id"], "ws-1");
        assert!(creds.metadata.contains_key("owner"));

        // Notion tokens never expire and cannot be revoked
        let mut expired = creds.clone();
        expired.access_token_expires_at = Some(0);
        assert!(!handler.needs_refresh(&expired));
        assert!(!handler.revoke_tokens(&creds).await.unwrap());
    }

    #[tokio::test]
    async fn test_google_revoke() {
        let mut server = mockito::Server::new_async().await;
        let revoke_mock = server
            .mock("POST", "/applications/client-id/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "ya29.token".into()))
            .with_status(200)
            .create_async()
            .await;

        let handler = handler("google", &server.url());
        let creds = OAuth2Credentials::new("google", Secret::new("ya29.token"), None, None, vec![]);

        assert!(handler.revoke_tokens(&creds).await.unwrap());
        revoke_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_github_revoke() {
        let mut server = mockito::Server::new_async().await;
        let revoke_mock = server
            .mock("DELETE", "/applications/client-id/revoke")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::Json(
                serde_json::json!({ "access_token": "old-access" }),
            ))
            .with_status(204)
            .create_async()
            .await;

        let handler = handler("github", &server.url());
        assert!(handler
            .revoke_tokens(&github_credentials(None))
            .await
            .unwrap());
        revoke_mock.assert_async().await;
    }

    #[test]
    fn test_unknown_builtin() {
        let err = StandardOAuthHandler::builtin(
            "myspace",
            ClientCredentials::new("id", "secret"),
            REDIRECT,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
    }
}
