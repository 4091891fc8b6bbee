//! Credential validator implementations

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::{AuthError, CredentialValidator, Principal, Role};
use crate::config::TokenEntry;

/// Validator backed by a fixed token table
///
/// Intended for local development and tests; production deployments point
/// [`RemoteValidator`] at the credential issuer instead.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token, returning self for chaining
    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    /// Build from the `[[auth.tokens]]` config entries
    pub fn from_entries(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|e| {
                (
                    e.token.clone(),
                    Principal::new(&e.user_id, &e.display_name, e.role),
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CredentialValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Validator that asks the credential issuer over HTTP
pub struct RemoteValidator {
    client: Client,
    issuer_url: String,
}

/// Body returned by `GET /v1/sessions/validate`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    role: String,
}

impl RemoteValidator {
    pub fn new(issuer_url: impl Into<String>, request_timeout_ms: u64) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            issuer_url: issuer_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn validate_url(&self) -> String {
        format!("{}/v1/sessions/validate", self.issuer_url)
    }
}

#[async_trait]
impl CredentialValidator for RemoteValidator {
    async fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        let response = self
            .client
            .get(self.validate_url())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AuthError::Unavailable
                } else {
                    AuthError::Request(e)
                }
            })?;

        match response.status() {
            status if status.is_success() => {
                let body: ValidateResponse = response.json().await?;
                let role: Role = body.role.parse()?;
                let display_name = body
                    .display_name
                    .or(body.username)
                    .unwrap_or_else(|| body.user_id.clone());
                Ok(Principal::new(body.user_id, display_name, role))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::InvalidToken),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(AuthError::Issuer {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}
