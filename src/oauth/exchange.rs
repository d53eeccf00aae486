//! OAuth token endpoint requests.
//!
//! Handles both the authorization-code exchange and the refresh grant.

use super::{ClientCredentials, TokenAuthStyle};
use crate::errors::OAuthError;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::collections::HashMap;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token_expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Provider-specific fields (e.g. Notion's workspace details).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TokenResponse {
    /// Granted scopes, or empty if the response did not list them.
    pub fn granted_scopes(&self, separator: char) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split(separator)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// POST a grant to the token endpoint.
///
/// `params` carries the grant fields (`grant_type`, `code`, ...); client
/// credentials are added according to `auth`.
pub(crate) async fn request_tokens(
    http: &reqwest::Client,
    token_url: &str,
    client: &ClientCredentials,
    auth: TokenAuthStyle,
    params: &[(&str, &str)],
) -> Result<TokenResponse, OAuthError> {
    tracing::debug!(token_url = %token_url, "Requesting tokens");

    let request = match auth {
        TokenAuthStyle::FormBody => {
            let mut form: Vec<(&str, &str)> = vec![
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.expose()),
            ];
            form.extend_from_slice(params);
            http.post(token_url).form(&form)
        }
        TokenAuthStyle::JsonBasicAuth => {
            let body: serde_json::Map<String, serde_json::Value> = params
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect();
            http.post(token_url)
                .basic_auth(&client.client_id, Some(client.client_secret.expose()))
                .json(&body)
        }
    };

    let response = request.header(ACCEPT, "application/json").send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    parse_token_response(status.as_u16(), &body)
}

/// Some providers report grant errors with a 200 status and an `error` field.
fn parse_token_response(status: u16, body: &str) -> Result<TokenResponse, OAuthError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| OAuthError::InvalidResponse {
            details: e.to_string(),
        })?;

    if value.get("error").is_some() {
        return Err(OAuthError::TokenEndpoint {
            status,
            body: body.to_string(),
        });
    }

    serde_json::from_value(value).map_err(|e| OAuthError::InvalidResponse {
        details: e.to_string(),
    })
}
